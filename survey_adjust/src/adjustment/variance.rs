//! Variance components of the observation types and pseudo-observations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::adjustment::layout::PseudoRow;
use crate::adjustment::outer_accuracy::FinalRows;
use crate::adjustment::NetworkAdjustment;
use crate::model::ObservationKind;
use crate::statistic::TestStatisticParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VarianceComponentType {
    Global,
    Leveling,
    Direction,
    HorizontalDistance,
    SlopeDistance,
    ZenithAngle,
    Gnss1D,
    Gnss2D,
    Gnss3D,
    StochasticPoint1D,
    StochasticPoint2D,
    StochasticPoint3D,
    StochasticDeflection,
}

impl VarianceComponentType {
    pub fn of_observation(kind: ObservationKind) -> Self {
        match kind {
            ObservationKind::Leveling => Self::Leveling,
            ObservationKind::Direction => Self::Direction,
            ObservationKind::HorizontalDistance => Self::HorizontalDistance,
            ObservationKind::SlopeDistance => Self::SlopeDistance,
            ObservationKind::ZenithAngle => Self::ZenithAngle,
            ObservationKind::Gnss1D => Self::Gnss1D,
            ObservationKind::Gnss2D(_) => Self::Gnss2D,
            ObservationKind::Gnss3D(_) => Self::Gnss3D,
        }
    }

    fn of_point(dimension: usize) -> Self {
        match dimension {
            1 => Self::StochasticPoint1D,
            2 => Self::StochasticPoint2D,
            _ => Self::StochasticPoint3D,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarianceComponent {
    pub kind: VarianceComponentType,
    pub omega: f64,
    pub redundancy: f64,
    pub number_of_observations: usize,
    /// Critical value of the variance factor.
    pub quantile: f64,
    pub significant: bool,
}

impl VarianceComponent {
    fn new(kind: VarianceComponentType) -> Self {
        Self {
            kind,
            omega: 0.0,
            redundancy: 0.0,
            number_of_observations: 0,
            quantile: 0.0,
            significant: false,
        }
    }

    fn add(&mut self, omega: f64, redundancy: f64) {
        self.omega += omega;
        self.redundancy += redundancy;
        self.number_of_observations += 1;
    }

    /// `Ω / r`, one if the component has no redundancy.
    pub fn variance_factor(&self) -> f64 {
        if self.redundancy > f64::EPSILON.sqrt() && self.omega > 0.0 {
            self.omega / self.redundancy
        } else {
            1.0
        }
    }

    fn test(&mut self, parameters: &mut TestStatisticParameters) {
        if self.redundancy <= f64::EPSILON.sqrt() {
            return;
        }
        self.quantile = parameters
            .parameter_set(self.redundancy, f64::INFINITY, true)
            .quantile;
        self.significant = self.variance_factor() > self.quantile;
    }
}

impl NetworkAdjustment {
    /// Collects the global variance component and one per observation type and
    /// pseudo-observation group.
    pub(crate) fn estimate_variance_components(&mut self, rows: &FinalRows) {
        let mut components: BTreeMap<VarianceComponentType, VarianceComponent> = BTreeMap::new();
        let mut add = |kind: VarianceComponentType, omega: f64, redundancy: f64| {
            for k in [VarianceComponentType::Global, kind] {
                components
                    .entry(k)
                    .or_insert_with(|| VarianceComponent::new(k))
                    .add(omega, redundancy);
            }
        };
        for obs in self.network.observations() {
            add(
                VarianceComponentType::of_observation(obs.kind),
                obs.result.omega,
                obs.result.redundancy,
            );
        }
        for (k, pseudo) in self.layout.pseudo_rows().iter().enumerate() {
            let row = &rows.pseudo[k];
            let omega = row.residual * row.residual * row.design.weight;
            let kind = match pseudo {
                PseudoRow::Point { point, .. } => {
                    VarianceComponentType::of_point(self.network.point(*point).dimension)
                }
                PseudoRow::Deflection { .. } => VarianceComponentType::StochasticDeflection,
            };
            add(kind, omega, row.redundancy());
        }
        if let Some(parameters) = self.test_parameters.as_mut() {
            for component in components.values_mut() {
                component.test(parameters);
            }
        }
        self.variance_components = components.into_values().collect();
    }
}
