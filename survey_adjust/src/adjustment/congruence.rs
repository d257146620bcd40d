//! Congruence analysis between two epochs of a free network.
//!
//! Point ties connect the reference-epoch realization of a point with its
//! control-epoch realization. Without strain parameters every tie is tested
//! for a significant displacement. With strain parameters the ties enter the
//! adjustment as conditions `f(P_start, θ) - P_end = 0`, the strain parameters
//! are tested against the identity, and every tie reports the model disturbance
//! left at its control-epoch point.

use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::adjustment::layout::Unknown;
use crate::adjustment::normal_equation::{pseudoinverse, NormalEquations};
use crate::adjustment::outer_accuracy::FinalRows;
use crate::adjustment::strain::{self, RestrictionType, StrainAnalysis, StrainParameterResult};
use crate::adjustment::NetworkAdjustment;
use crate::model::point::axes_of;
use crate::model::{Network, PointId, TestResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TieResult {
    /// Reference minus control epoch coordinates.
    pub displacement: Vector3<f64>,
    pub std: Vector3<f64>,
    pub minimal_detectable_bias: Vector3<f64>,
    pub test: TestResult,
    /// The statistic is the model disturbance at the control-epoch point.
    pub model_disturbance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointPair {
    pub start: PointId,
    pub end: PointId,
    #[serde(default)]
    pub result: TieResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CongruenceGroup {
    pub name: String,
    pub dimension: usize,
    pub ties: Vec<PointPair>,
    pub strain: Option<StrainAnalysis>,
}

impl CongruenceGroup {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
            ties: Vec::new(),
            strain: None,
        }
    }

    pub fn add_tie(&mut self, start: PointId, end: PointId) {
        self.ties.push(PointPair {
            start,
            end,
            result: TieResult::default(),
        });
    }

    /// Estimates strain parameters subject to `restrictions`.
    pub fn with_strain(mut self, restrictions: Vec<RestrictionType>) -> Self {
        self.strain = Some(StrainAnalysis::new(self.dimension, restrictions));
        self
    }

    /// Coordinate axes compared by this group.
    pub fn axes(&self) -> &'static [usize] {
        axes_of(self.dimension)
    }

    /// Centroid of the reference-epoch points, used to reduce the strain equations.
    fn centroid(&self, network: &Network) -> Vector3<f64> {
        if self.ties.is_empty() {
            return Vector3::zeros();
        }
        self.ties
            .iter()
            .map(|t| network.point(t.start).approx)
            .sum::<Vector3<f64>>()
            / self.ties.len() as f64
    }
}

/// Column of coordinate `axis` of `point`, `None` for points that are not estimated.
fn axis_column(adjustment: &NetworkAdjustment, point: PointId, axis: usize) -> Option<usize> {
    let offset = adjustment.layout.point_column(point)?;
    let index = adjustment
        .network
        .point(point)
        .axes()
        .iter()
        .position(|a| *a == axis)?;
    Some(offset + index)
}

impl NetworkAdjustment {
    /// Enables the strain parameters of groups that can be estimated and resets them.
    pub(crate) fn prepare_strain(&mut self) {
        let enabled = self.config.congruence_analysis && self.is_free_network();
        for group in &mut self.congruence {
            let centroid = group.centroid(&self.network);
            let (dimension, ties) = (group.dimension, group.ties.len());
            if let Some(analysis) = group.strain.as_mut() {
                analysis.active = enabled && analysis.is_solvable(dimension, ties);
                analysis.values = strain::expectation(dimension);
                analysis.centroid = centroid;
                analysis.results.clear();
                if !analysis.active {
                    log::debug!(
                        "strain parameters of congruence group `{}` are not estimated",
                        group.name
                    );
                }
            }
        }
    }

    pub(crate) fn reset_strain(&mut self) {
        for group in &mut self.congruence {
            let dimension = group.dimension;
            if let Some(analysis) = group.strain.as_mut() {
                analysis.values = strain::expectation(dimension);
            }
        }
    }

    /// Adds the tie conditions and parameter restrictions of the active strain groups.
    pub(crate) fn add_strain_rows(&self, normal: &mut NormalEquations) {
        for (g, first) in self.layout.strain_rows() {
            let group = &self.congruence[g];
            let Some(analysis) = group.strain.as_ref() else {
                continue;
            };
            let Some(slot) = self.layout.slot(Unknown::Strain { group: g }) else {
                continue;
            };
            let mut row = first;
            for tie in &group.ties {
                let start = self.network.point(tie.start).coordinates - analysis.centroid;
                let end = self.network.point(tie.end).coordinates - analysis.centroid;
                for condition in strain::conditions(group.dimension, &analysis.values, &start) {
                    let mut entries: Vec<(usize, f64)> = condition
                        .start
                        .iter()
                        .filter_map(|(axis, v)| axis_column(self, tie.start, *axis).map(|c| (c, *v)))
                        .collect();
                    if let Some(c) = axis_column(self, tie.end, condition.axis) {
                        entries.push((c, -1.0));
                    }
                    entries.extend(
                        condition
                            .parameters
                            .iter()
                            .map(|(i, v)| (slot.offset + i, *v)),
                    );
                    normal.add_constraint(row, &entries, -(condition.value - end[condition.axis]));
                    row += 1;
                }
            }
            for restriction in &analysis.restrictions {
                if let Some((value, gradient)) =
                    strain::restriction(group.dimension, *restriction, &analysis.values)
                {
                    let entries: Vec<(usize, f64)> = gradient
                        .into_iter()
                        .map(|(i, v)| (slot.offset + i, v))
                        .collect();
                    normal.add_constraint(row, &entries, -value);
                }
                row += 1;
            }
        }
    }

    /// Applies the update of the strain parameters of group `g`.
    pub(crate) fn update_strain(&mut self, g: usize, dx: &[f64]) {
        if let Some(analysis) = self.congruence[g].strain.as_mut() {
            for (value, d) in analysis.values.iter_mut().zip(dx) {
                *value += d;
            }
        }
    }

    pub(crate) fn strain_values(&self, g: usize) -> Option<&DVector<f64>> {
        self.congruence[g].strain.as_ref().map(|s| &s.values)
    }

    pub(crate) fn set_strain_values(&mut self, g: usize, values: &[f64]) {
        if let Some(analysis) = self.congruence[g].strain.as_mut() {
            analysis.values.copy_from_slice(values);
        }
    }

    /// Number of ties and strain parameters tested in this run.
    pub(crate) fn congruence_hypotheses(&self) -> usize {
        if !self.config.congruence_analysis || !self.is_free_network() {
            return 0;
        }
        self.congruence
            .iter()
            .map(|g| {
                let strain = g
                    .strain
                    .as_ref()
                    .filter(|s| s.active)
                    .map_or(0, |_| strain::number_of_parameters(g.dimension));
                g.ties.len() + strain
            })
            .sum()
    }

    /// Tests every tie and the strain parameters of all groups.
    pub(crate) fn congruence_analysis(&mut self, rows: &FinalRows) {
        if !self.config.congruence_analysis || !self.is_free_network() {
            return;
        }
        let sigma2 = self.variance_factor;
        for g in 0..self.congruence.len() {
            let dimension = self.congruence[g].dimension;
            let axes = axes_of(dimension);
            let active = self.congruence[g]
                .strain
                .as_ref()
                .is_some_and(|s| s.active);
            let lambda = self.noncentrality(dimension as f64);
            for t in 0..self.congruence[g].ties.len() {
                let tie = &self.congruence[g].ties[t];
                let (start, end) = (tie.start, tie.end);
                let mut result = TieResult {
                    model_disturbance: active,
                    ..Default::default()
                };
                let q = self.tie_cofactor(start, end, axes);
                let p_start = self.network.point(start).coordinates;
                let p_end = self.network.point(end).coordinates;
                let nabla = DVector::from_iterator(axes.len(), axes.iter().map(|a| p_start[*a] - p_end[*a]));
                for (i, axis) in axes.iter().enumerate() {
                    result.displacement[*axis] = nabla[i];
                    result.std[*axis] = (sigma2 * q[(i, i)].max(0.0)).sqrt();
                }

                let (nabla, weight, npn) = if active {
                    let entries = self.point_test_entries(rows, end, axes);
                    let test = self.external_test(rows, &entries);
                    (test.nabla, test.matrix, test.npn)
                } else {
                    let weight = pseudoinverse(&q, 1e-12).unwrap_or_else(|| DMatrix::zeros(q.nrows(), q.ncols()));
                    let npn = (nabla.transpose() * &weight * &nabla)[(0, 0)];
                    (nabla, weight, npn)
                };
                let mdb = minimal_detectable_bias(&nabla, &weight, npn, lambda * sigma2);
                for (i, axis) in axes.iter().enumerate() {
                    result.minimal_detectable_bias[*axis] = mdb[i];
                }
                let t_prio = npn / dimension as f64;
                let t_post = if self.config.apply_variance_of_unit_weight && sigma2 > 0.0 {
                    t_prio / sigma2
                } else {
                    0.0
                };
                let denominator = self.degrees_of_freedom - dimension as f64;
                result.test = self.test_result(dimension as f64, t_prio, t_post, denominator, false);
                self.congruence[g].ties[t].result = result;
            }
            if active {
                self.strain_tests(g);
            }
        }
    }

    /// `Q11 - Q12 - Q21 + Q22` of a tie; points that are not estimated contribute nothing.
    fn tie_cofactor(&self, start: PointId, end: PointId, axes: &[usize]) -> DMatrix<f64> {
        let n = axes.len();
        let Some(cofactor) = self.cofactor.as_ref() else {
            return DMatrix::zeros(n, n);
        };
        let columns = |p: PointId| -> Vec<Option<usize>> {
            axes.iter().map(|a| axis_column(self, p, *a)).collect()
        };
        let (cs, ce) = (columns(start), columns(end));
        DMatrix::from_fn(n, n, |i, j| {
            let q = |a: Option<usize>, b: Option<usize>| match (a, b) {
                (Some(a), Some(b)) => cofactor.get(a, b),
                _ => 0.0,
            };
            q(cs[i], cs[j]) - q(cs[i], ce[j]) - q(ce[i], cs[j]) + q(ce[i], ce[j])
        })
    }

    fn strain_tests(&mut self, g: usize) {
        let dimension = self.congruence[g].dimension;
        let Some(slot) = self.layout.slot(Unknown::Strain { group: g }) else {
            return;
        };
        let Some(values) = self.strain_values(g).cloned() else {
            return;
        };
        let expectation = strain::expectation(dimension);
        let names = strain::parameter_names(dimension);
        let sigma2 = self.variance_factor;
        let lambda = self.noncentrality(1.0);
        let mut results = Vec::with_capacity(values.len());
        for i in 0..values.len() {
            let q = self
                .cofactor
                .as_ref()
                .map_or(0.0, |c| c.get(slot.offset + i, slot.offset + i))
                .max(0.0);
            let nabla = values[i] - expectation[i];
            let mut result = StrainParameterResult {
                name: names[i].to_string(),
                value: values[i],
                expectation: expectation[i],
                std: (sigma2 * q).sqrt(),
                gross_error: nabla,
                minimal_detectable_bias: (lambda * sigma2 * q).sqrt(),
                test: TestResult::default(),
            };
            if q > f64::EPSILON {
                let t_prio = nabla * nabla / q;
                let t_post = if self.config.apply_variance_of_unit_weight && sigma2 > 0.0 {
                    t_prio / sigma2
                } else {
                    0.0
                };
                let denominator = self.degrees_of_freedom - 1.0;
                result.test = self.test_result(1.0, t_prio, t_post, denominator, false);
            }
            results.push(result);
        }
        if let Some(analysis) = self.congruence[g].strain.as_mut() {
            analysis.results = results;
        }
    }
}

/// Minimal detectable bias in the direction of `nabla`, or per axis if `nabla` vanishes.
pub(crate) fn minimal_detectable_bias(
    nabla: &DVector<f64>,
    weight: &DMatrix<f64>,
    npn: f64,
    lambda: f64,
) -> DVector<f64> {
    if npn > f64::EPSILON && nabla.norm() > 0.0 {
        nabla * (lambda / npn).sqrt()
    } else {
        DVector::from_iterator(
            nabla.len(),
            (0..nabla.len()).map(|i| {
                let w = weight[(i, i)];
                if w > 0.0 {
                    (lambda / w).sqrt()
                } else {
                    f64::INFINITY
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detectable_bias_follows_the_displacement() {
        let nabla = DVector::from_vec(vec![3.0, 4.0]);
        let weight = DMatrix::identity(2, 2);
        let npn = 25.0;
        let mdb = minimal_detectable_bias(&nabla, &weight, npn, 16.0);
        assert!((mdb.norm() - 4.0).abs() < 1e-12);
        assert!((mdb[0] / mdb[1] - 0.75).abs() < 1e-12);

        let zero = DVector::zeros(2);
        let mdb = minimal_detectable_bias(&zero, &(weight * 4.0), 0.0, 16.0);
        assert!((mdb[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn centroid_of_reference_epoch() {
        let mut network = Network::new();
        let a = network.add_point(crate::model::Point::planar("A1", 0.0, 0.0)).unwrap();
        let b = network.add_point(crate::model::Point::planar("B1", 10.0, 20.0)).unwrap();
        let a2 = network.add_point(crate::model::Point::planar("A2", 5.0, 5.0)).unwrap();
        let b2 = network.add_point(crate::model::Point::planar("B2", 15.0, 25.0)).unwrap();
        let mut group = CongruenceGroup::new("epochs", 2);
        group.add_tie(a, a2);
        group.add_tie(b, b2);
        let c = group.centroid(&network);
        assert_eq!(c, Vector3::new(5.0, 10.0, 0.0));
        assert_eq!(group.axes(), &[0, 1]);
    }
}
