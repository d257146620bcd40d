//! Weight adaption of the L1 estimation.
//!
//! After each pass the quantity with the largest normalized residual
//! `v²/(σ²·r)` is looked up among the observations and the pseudo-observations.
//! If its residual exceeds the boundary `c·σ·√r`, its standard deviation is
//! inflated by `√(|v|/k)`. Only one quantity is adapted per pass.

use log::{debug, warn};

use crate::adjustment::layout::PseudoRow;
use crate::adjustment::outer_accuracy::{FinalRows, RowRef};
use crate::adjustment::NetworkAdjustment;
use crate::model::ObservationId;

/// Share of gross residuals above which the boundary is widened.
const GROSS_SHARE: f64 = 0.35;
/// Residuals larger than this multiple of their deviation count as gross.
const GROSS_FACTOR: f64 = 500.0;

impl NetworkAdjustment {
    /// Adapts the standard deviation of the worst quantity. Returns `true` if one was inflated.
    pub(crate) fn robust_step(&mut self, rows: &FinalRows) -> bool {
        let refs = (0..rows.observations.len())
            .map(RowRef::Observation)
            .chain((0..rows.pseudo.len()).map(RowRef::Pseudo));
        let total = rows.observations.len() + rows.pseudo.len();
        if total == 0 {
            return false;
        }

        let mut worst: Option<(RowRef, f64)> = None;
        let mut gross = 0usize;
        for r in refs {
            let row = rows.row(r);
            let (v, std, redundancy) = (row.residual, row.std, row.redundancy());
            if std > 0.0 && redundancy > f64::EPSILON.sqrt() {
                let nv2 = v * v / (std * std) / redundancy;
                if worst.map_or(true, |(_, max)| nv2 > max) {
                    worst = Some((r, nv2));
                }
            }
            if v.abs() >= GROSS_FACTOR * std {
                gross += 1;
            }
        }
        let Some((r, max_nv2)) = worst else {
            return false;
        };

        let limit = self.config.robust_limit;
        let c = if gross as f64 / total as f64 > GROSS_SHARE {
            limit + (max_nv2.sqrt() - limit) * 0.9
        } else {
            limit
        };
        let row = rows.row(r);
        let k = c * row.std * row.redundancy().sqrt();
        let v = row.residual.abs();
        if v < k || k <= f64::EPSILON.sqrt() {
            debug!("largest normalized residual {:.3} within the boundary {c:.3}", max_nv2.sqrt());
            return false;
        }
        let std = row.std * (v / k).sqrt();
        match r {
            RowRef::Observation(i) => {
                let obs = self.network.observation_mut(ObservationId(i));
                obs.adapted_std = Some(std);
                warn!(
                    "standard deviation of observation {i} ({:?}) inflated to {std:.6}",
                    obs.kind
                );
            }
            RowRef::Pseudo(k) => match self.layout.pseudo_rows()[k] {
                PseudoRow::Point { point, axis, .. } => {
                    let point = self.network.point_mut(point);
                    let mut adapted = point.std_used();
                    adapted[axis] = std;
                    point.adapted_std = Some(adapted);
                    warn!(
                        "standard deviation of stochastic point `{}` axis {axis} inflated to {std:.6}",
                        point.name
                    );
                }
                PseudoRow::Deflection {
                    point, component, ..
                } => {
                    let point = self.network.point_mut(point);
                    let mut adapted = point.deflection.std_used();
                    adapted[component] = std;
                    point.deflection.adapted_std = Some(adapted);
                    warn!(
                        "standard deviation of the deflection at `{}` inflated to {std:.3e}",
                        point.name
                    );
                }
            },
        }
        true
    }

    /// Drops every adapted standard deviation.
    pub(crate) fn restore_adapted_std(&mut self) {
        for i in 0..self.network.observations().len() {
            self.network.observation_mut(ObservationId(i)).adapted_std = None;
        }
        for id in self.network.point_ids().collect::<Vec<_>>() {
            let point = self.network.point_mut(id);
            point.adapted_std = None;
            point.deflection.adapted_std = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::adjustment::{IterationContext, NetworkAdjustment};
    use crate::config::{AdjustmentConfig, EstimationType};
    use crate::model::{Network, Observation, ObservationKind, Point};

    /// Three leveled differences into one new point, one of them off by 5 cm.
    fn leveling_with_outlier() -> NetworkAdjustment {
        let mut network = Network::new();
        let a = network.add_point(Point::height("A", 100.0)).unwrap();
        let b = network.add_point(Point::height("B", 100.0)).unwrap();
        let c = network.add_point(Point::height("C", 100.0)).unwrap();
        let n = network.add_point(Point::height("N", 101.0)).unwrap();
        let g = network.add_group("leveling");
        for (start, value) in [(a, 1.0), (b, 1.0), (c, 1.05)] {
            network
                .add_observation(Observation::new(ObservationKind::Leveling, g, start, n, value, 0.001))
                .unwrap();
        }
        let config = AdjustmentConfig {
            estimation_type: EstimationType::L1Norm,
            ..Default::default()
        };
        let mut adjustment = NetworkAdjustment::new(network, config);
        for p in [a, b, c] {
            adjustment.add_reference_point(p).unwrap();
        }
        adjustment.add_new_point(n).unwrap();
        adjustment
    }

    #[test]
    fn worst_observation_is_inflated() {
        let mut adjustment = leveling_with_outlier();
        adjustment.rank_defect = adjustment.derive_rank_defect();
        adjustment.layout = crate::adjustment::ParameterLayout::build(&adjustment.network, &[], 0);
        let ctx = IterationContext {
            needs_cofactor: true,
            ..Default::default()
        };
        let normal = adjustment.assemble(&ctx).unwrap();
        let (cofactor, dx) = normal.invert().unwrap();
        adjustment.cofactor = Some(cofactor);
        adjustment.network.point_mut(crate::model::PointId(3)).coordinates.z += dx[0];
        let rows = adjustment.final_rows(&ctx).unwrap();
        adjustment.update_redundancies(&rows);

        assert!(adjustment.robust_step(&rows));
        let adapted = adjustment.network.observations()[2].adapted_std.unwrap();
        assert!(adapted > 0.001);
        assert!(adjustment.network.observations()[0].adapted_std.is_none());

        adjustment.restore_adapted_std();
        assert!(adjustment.network.observations()[2].adapted_std.is_none());
    }
}
