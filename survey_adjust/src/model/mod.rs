//! Network model: points, observations, observation groups and additional parameters.

pub mod observation;
pub mod parameter;
pub mod point;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{AdjustError, AdjustResult};

pub use observation::{
    GnssComponent, GroupValues, Linearization, Observation, ObservationKind, ObservationResult,
    EARTH_RADIUS,
};
pub use parameter::{
    AdditionalParameter, ObservationGroup, ParameterResult, ParameterType, ProcessingType,
};
pub use point::{
    ConfidenceRegion, Deflection, DeflectionMode, DeflectionResult, Point, PointResult, PointRole,
    TestResult,
};

macro_rules! index_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub usize);
    };
}

index_type!(PointId);
index_type!(ObservationId);
index_type!(GroupId);
index_type!(ParameterId);

/// Arena holding the complete observation network.
#[derive(Debug, Clone, Default)]
pub struct Network {
    points: Vec<Point>,
    observations: Vec<Observation>,
    groups: Vec<ObservationGroup>,
    parameters: Vec<AdditionalParameter>,
    baselines: Vec<Vec<ObservationId>>,
    names: HashMap<String, PointId>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_point(&mut self, point: Point) -> AdjustResult<PointId> {
        if !(1..=3).contains(&point.dimension) {
            return Err(AdjustError::invalid(format!(
                "point `{}` has unsupported dimension {}",
                point.name, point.dimension
            )));
        }
        if self.names.contains_key(&point.name) {
            return Err(AdjustError::Duplicate {
                kind: "point",
                name: point.name,
            });
        }
        let id = PointId(self.points.len());
        self.names.insert(point.name.clone(), id);
        self.points.push(point);
        Ok(id)
    }

    pub fn add_group(&mut self, name: impl Into<String>) -> GroupId {
        let id = GroupId(self.groups.len());
        self.groups.push(ObservationGroup::new(name));
        id
    }

    /// Adds a parameter of `kind` to a group. A group carries each type at most once.
    /// The parameter is held fixed until it is registered with the adjustment.
    pub fn add_parameter(
        &mut self,
        group: GroupId,
        kind: ParameterType,
        approx: f64,
    ) -> AdjustResult<ParameterId> {
        let existing = self
            .group_checked(group)?
            .parameters
            .iter()
            .any(|p| self.parameters[p.0].kind == kind);
        if existing {
            return Err(AdjustError::Duplicate {
                kind: "additional parameter",
                name: format!("{kind:?} of group `{}`", self.groups[group.0].name),
            });
        }
        let id = ParameterId(self.parameters.len());
        self.parameters.push(AdditionalParameter {
            kind,
            group,
            approx,
            value: approx,
            processing: ProcessingType::Fixed,
            visible: true,
            result: ParameterResult::default(),
        });
        self.groups[group.0].parameters.push(id);
        Ok(id)
    }

    pub fn add_observation(&mut self, observation: Observation) -> AdjustResult<ObservationId> {
        self.group_checked(observation.group)?;
        if observation.start.0 >= self.points.len() || observation.end.0 >= self.points.len() {
            return Err(AdjustError::invalid("observation references an unknown point"));
        }
        if observation.start == observation.end {
            return Err(AdjustError::invalid(format!(
                "observation starts and ends at `{}`",
                self.points[observation.start.0].name
            )));
        }
        if !(observation.std_apriori > 0.0) {
            return Err(AdjustError::invalid(format!(
                "observation between `{}` and `{}` needs a positive standard deviation",
                self.points[observation.start.0].name, self.points[observation.end.0].name
            )));
        }
        let id = ObservationId(self.observations.len());
        self.points[observation.start.0].observations.push(id);
        self.points[observation.end.0].observations.push(id);
        self.groups[observation.group.0].observations.push(id);
        self.observations.push(observation);
        Ok(id)
    }

    /// Adds the components of one GNSS baseline; `values.len()` selects 1D (Z), 2D (X, Y) or 3D.
    pub fn add_gnss_baseline(
        &mut self,
        group: GroupId,
        start: PointId,
        end: PointId,
        values: &[f64],
        std: &[f64],
    ) -> AdjustResult<Vec<ObservationId>> {
        use GnssComponent::*;
        if values.len() != std.len() {
            return Err(AdjustError::invalid("baseline values and deviations differ in length"));
        }
        let kinds: Vec<ObservationKind> = match values.len() {
            1 => vec![ObservationKind::Gnss1D],
            2 => vec![ObservationKind::Gnss2D(X), ObservationKind::Gnss2D(Y)],
            3 => [X, Y, Z].into_iter().map(ObservationKind::Gnss3D).collect(),
            n => {
                return Err(AdjustError::invalid(format!(
                    "GNSS baseline with {n} components"
                )))
            }
        };
        let baseline = self.baselines.len();
        let mut ids = Vec::with_capacity(kinds.len());
        for (i, kind) in kinds.into_iter().enumerate() {
            let mut obs = Observation::new(kind, group, start, end, values[i], std[i]);
            obs.baseline = Some(baseline);
            ids.push(self.add_observation(obs)?);
        }
        self.baselines.push(ids.clone());
        Ok(ids)
    }

    fn group_checked(&self, group: GroupId) -> AdjustResult<&ObservationGroup> {
        self.groups
            .get(group.0)
            .ok_or_else(|| AdjustError::invalid(format!("unknown observation group {}", group.0)))
    }

    pub fn point_id(&self, name: &str) -> Option<PointId> {
        self.names.get(name).copied()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn point(&self, id: PointId) -> &Point {
        &self.points[id.0]
    }

    pub fn point_mut(&mut self, id: PointId) -> &mut Point {
        &mut self.points[id.0]
    }

    pub fn point_ids(&self) -> impl Iterator<Item = PointId> {
        (0..self.points.len()).map(PointId)
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn observation(&self, id: ObservationId) -> &Observation {
        &self.observations[id.0]
    }

    pub fn observation_mut(&mut self, id: ObservationId) -> &mut Observation {
        &mut self.observations[id.0]
    }

    pub fn groups(&self) -> &[ObservationGroup] {
        &self.groups
    }

    pub fn group(&self, id: GroupId) -> &ObservationGroup {
        &self.groups[id.0]
    }

    pub fn parameters(&self) -> &[AdditionalParameter] {
        &self.parameters
    }

    pub fn parameter(&self, id: ParameterId) -> &AdditionalParameter {
        &self.parameters[id.0]
    }

    pub fn parameter_mut(&mut self, id: ParameterId) -> &mut AdditionalParameter {
        &mut self.parameters[id.0]
    }

    /// Parameter of `kind` in `group` that is estimated.
    pub fn unknown_parameter(&self, group: GroupId, kind: ParameterType) -> Option<ParameterId> {
        self.groups[group.0]
            .parameters
            .iter()
            .copied()
            .find(|p| self.parameters[p.0].kind == kind && self.parameters[p.0].is_unknown())
    }

    pub fn number_of_unknown_parameters(&self, group: GroupId) -> usize {
        self.groups[group.0]
            .parameters
            .iter()
            .filter(|p| self.parameters[p.0].is_unknown())
            .count()
    }

    pub fn group_values(&self, group: GroupId) -> GroupValues {
        let mut values = GroupValues::default();
        for p in &self.groups[group.0].parameters {
            let param = &self.parameters[p.0];
            values.set(param.kind, param.value);
        }
        values
    }

    /// Observations processed together: single observations and complete GNSS baselines.
    pub fn observation_blocks(&self) -> Vec<Vec<ObservationId>> {
        let mut blocks = Vec::new();
        let mut seen = vec![false; self.baselines.len()];
        for (i, obs) in self.observations.iter().enumerate() {
            match obs.baseline {
                Some(b) if !seen[b] => {
                    seen[b] = true;
                    blocks.push(self.baselines[b].clone());
                }
                Some(_) => {}
                None => blocks.push(vec![ObservationId(i)]),
            }
        }
        blocks
    }

    /// Evaluates the functional model of an observation at the current state.
    pub fn linearize(&self, id: ObservationId) -> Linearization {
        let obs = &self.observations[id.0];
        let values = self.group_values(obs.group);
        obs.evaluate(&self.points[obs.start.0], &self.points[obs.end.0], &values)
    }

    /// Resets all estimated quantities to their approximate values.
    pub(crate) fn reset(&mut self) {
        for point in &mut self.points {
            point.reset();
        }
        for param in &mut self.parameters {
            param.value = param.approx;
        }
    }
}
