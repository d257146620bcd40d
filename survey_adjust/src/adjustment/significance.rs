//! Accuracy and significance of points, deflections and additional parameters.

use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::adjustment::congruence::minimal_detectable_bias;
use crate::adjustment::layout::PseudoRow;
use crate::adjustment::outer_accuracy::{FinalRows, RowRef};
use crate::adjustment::NetworkAdjustment;
use crate::model::{
    ConfidenceRegion, DeflectionMode, ParameterId, PointId, PointRole, ProcessingType, TestResult,
};
use crate::statistic::{self, TestStatisticParameters};

impl NetworkAdjustment {
    /// Non-centrality parameter of a test of dimension `n`.
    pub(crate) fn noncentrality(&mut self, n: f64) -> f64 {
        self.test_parameters
            .as_mut()
            .map_or(0.0, |p| p.parameter_set(n, f64::INFINITY, false).noncentrality_parameter)
    }

    /// Tests `t_prio` against `k(n, ∞)` and `t_post` against `k(n, m)`.
    pub(crate) fn test_result(
        &mut self,
        n: f64,
        t_prio: f64,
        t_post: f64,
        m: f64,
        adapted: bool,
    ) -> TestResult {
        let Some(parameters) = self.test_parameters.as_mut() else {
            return TestResult::default();
        };
        let prio = parameters.parameter_set(n, f64::INFINITY, false);
        let mut significant = adapted || t_prio > prio.quantile;
        let mut p_post = 100.0;
        if m > 0.0 && t_post > 0.0 {
            let post = parameters.parameter_set(n, m, false);
            significant |= t_post > post.quantile;
            p_post = statistic::probability_value(t_post, n, m);
        }
        TestResult {
            t_prio,
            t_post,
            p_prio: statistic::probability_value(t_prio, n, f64::INFINITY),
            p_post,
            significant,
        }
    }

    /// Points tested for consistency with the observations.
    fn tested_points(&self) -> Vec<PointId> {
        let datum = self.is_free_network() && self.config.congruence_analysis;
        self.network
            .point_ids()
            .filter(|id| match self.network.point(*id).role() {
                Some(PointRole::Reference | PointRole::Stochastic) => true,
                Some(PointRole::Datum) => datum,
                _ => false,
            })
            .collect()
    }

    fn stochastic_deflections(&self) -> Vec<PointId> {
        self.network
            .point_ids()
            .filter(|id| {
                let point = self.network.point(*id);
                point.role().is_some() && point.deflection.mode == DeflectionMode::Stochastic
            })
            .collect()
    }

    /// Number of hypotheses tested in one run, used by the Šidák correction.
    pub(crate) fn count_hypotheses(&self, rows: &FinalRows) -> usize {
        let blocks = self
            .network
            .observation_blocks()
            .iter()
            .filter(|block| {
                block
                    .iter()
                    .map(|o| rows.observations[o.0].redundancy())
                    .sum::<f64>()
                    > f64::EPSILON.sqrt()
            })
            .count();
        let parameters = self
            .network
            .parameters()
            .iter()
            .filter(|p| p.visible && p.processing != ProcessingType::Fixed)
            .count();
        blocks
            + self.tested_points().len()
            + self.stochastic_deflections().len()
            + parameters
            + self.congruence_hypotheses()
    }

    pub(crate) fn build_test_parameters(&mut self, hypotheses: usize) {
        self.test_parameters = Some(TestStatisticParameters::new(
            self.config.significance,
            hypotheses,
            self.degrees_of_freedom,
        ));
    }

    /// Rows observing the coordinates `axes` of `point` with their partial derivatives.
    pub(crate) fn point_test_entries(
        &self,
        rows: &FinalRows,
        point: PointId,
        axes: &[usize],
    ) -> Vec<(RowRef, DVector<f64>)> {
        let mut entries = Vec::new();
        for id in self.network.point(point).observations() {
            let obs = self.network.observation(*id);
            let lin = &rows.linearizations[id.0];
            let gradient = if obs.start == point { lin.start } else { lin.end };
            let b = DVector::from_iterator(axes.len(), axes.iter().map(|a| gradient[*a]));
            if b.iter().any(|v| *v != 0.0) {
                entries.push((RowRef::Observation(id.0), b));
            }
        }
        for (k, pseudo) in self.layout.pseudo_rows().iter().enumerate() {
            if let PseudoRow::Point { point: p, axis, .. } = pseudo {
                if let Some(i) = axes.iter().position(|a| a == axis).filter(|_| *p == point) {
                    let mut b = DVector::zeros(axes.len());
                    b[i] = -1.0;
                    entries.push((RowRef::Pseudo(k), b));
                }
            }
        }
        entries
    }

    fn deflection_test_entries(&self, rows: &FinalRows, point: PointId) -> Vec<(RowRef, DVector<f64>)> {
        let mut entries = Vec::new();
        for id in self.network.point(point).observations() {
            let obs = self.network.observation(*id);
            let lin = &rows.linearizations[id.0];
            let gradient = if obs.start == point {
                lin.start_deflection
            } else {
                lin.end_deflection
            };
            if gradient.iter().any(|v| *v != 0.0) {
                entries.push((RowRef::Observation(id.0), DVector::from_column_slice(gradient.as_slice())));
            }
        }
        for (k, pseudo) in self.layout.pseudo_rows().iter().enumerate() {
            if let PseudoRow::Deflection { point: p, component, .. } = pseudo {
                if *p == point {
                    let mut b = DVector::zeros(2);
                    b[*component] = -1.0;
                    entries.push((RowRef::Pseudo(k), b));
                }
            }
        }
        entries
    }

    /// `(T_post, denominator)` of a test of dimension `n` given its `∇ᵀM∇`.
    fn posterior(&self, n: f64, npn: f64) -> (f64, f64) {
        let denominator = self.degrees_of_freedom - n;
        if !self.config.apply_variance_of_unit_weight || denominator <= 0.0 {
            return (0.0, denominator);
        }
        let sigma2 = (self.omega - npn) / denominator;
        if sigma2 > 0.0 {
            (npn / n / sigma2, denominator)
        } else {
            (0.0, denominator)
        }
    }

    /// Tests reference and stochastic points (datum points in a congruence analysis)
    /// against their observations.
    pub(crate) fn point_tests(&mut self, rows: &FinalRows) -> bool {
        for id in self.tested_points() {
            if self.interrupt.is_interrupted() {
                return false;
            }
            let point = self.network.point(id);
            let axes = point.axes();
            let n = axes.len() as f64;
            let adapted = point.adapted_std.is_some();
            let entries = self.point_test_entries(rows, id, axes);
            let test = self.external_test(rows, &entries);
            if test.matrix.trace() <= f64::EPSILON {
                continue;
            }
            let lambda = self.noncentrality(n) * self.variance_factor;
            let mdb = minimal_detectable_bias(&test.nabla, &test.matrix, test.npn, lambda);
            let t_prio = test.npn / n;
            let (t_post, denominator) = self.posterior(n, test.npn);
            let result = self.test_result(n, t_prio, t_post, denominator, adapted);
            let point = self.network.point_mut(id);
            for (i, axis) in axes.iter().enumerate() {
                point.result.gross_error[*axis] = test.nabla[i];
                point.result.minimal_detectable_bias[*axis] = mdb[i];
            }
            point.result.test = Some(result);
        }
        true
    }

    pub(crate) fn deflection_tests(&mut self, rows: &FinalRows) {
        for id in self.stochastic_deflections() {
            let adapted = self.network.point(id).deflection.adapted_std.is_some();
            let entries = self.deflection_test_entries(rows, id);
            let test = self.external_test(rows, &entries);
            if test.matrix.trace() <= f64::EPSILON {
                continue;
            }
            let lambda = self.noncentrality(2.0) * self.variance_factor;
            let mdb = minimal_detectable_bias(&test.nabla, &test.matrix, test.npn, lambda);
            let t_prio = test.npn / 2.0;
            let (t_post, denominator) = self.posterior(2.0, test.npn);
            let result = self.test_result(2.0, t_prio, t_post, denominator, adapted);
            let deflection = &mut self.network.point_mut(id).deflection.result;
            deflection.gross_error = nalgebra::Vector2::new(test.nabla[0], test.nabla[1]);
            deflection.minimal_detectable_bias = nalgebra::Vector2::new(mdb[0], mdb[1]);
            deflection.test = result;
        }
    }

    /// Standard deviations and confidence regions of the estimated points and deflections.
    pub(crate) fn point_accuracy(&mut self, hypotheses: usize) {
        let Some(cofactor) = self.cofactor.clone() else {
            return;
        };
        let sigma2 = self.variance_factor;
        let mut region = TestStatisticParameters::new(
            self.config.confidence_region,
            hypotheses,
            self.degrees_of_freedom,
        );
        for id in self.network.point_ids().collect::<Vec<_>>() {
            if let Some(offset) = self.layout.point_column(id) {
                let point = self.network.point(id);
                let axes = point.axes();
                let columns: Vec<usize> = (offset..offset + axes.len()).collect();
                let q = cofactor.block(&columns, &columns);
                let k = region
                    .parameter_set(axes.len() as f64, f64::INFINITY, false)
                    .quantile;
                let confidence_region = confidence_region(&q, axes.len() as f64 * k * sigma2);
                let point = self.network.point_mut(id);
                for (i, axis) in axes.iter().enumerate() {
                    point.result.std[*axis] = (sigma2 * q[(i, i)].max(0.0)).sqrt();
                }
                point.result.confidence_region = confidence_region;
            }
            if let Some(offset) = self.layout.deflection_column(id) {
                let deflection = &mut self.network.point_mut(id).deflection;
                for c in 0..2 {
                    let q = cofactor.get(offset + c, offset + c).max(0.0);
                    deflection.result.std[c] = (sigma2 * q).sqrt();
                }
            }
        }
    }

    /// Largest variance of any estimated point, `σ²·λmax` of its cofactor block.
    pub(crate) fn largest_point_variance(&self) -> f64 {
        let Some(cofactor) = self.cofactor.as_ref() else {
            return 0.0;
        };
        self.network
            .point_ids()
            .filter_map(|id| {
                let offset = self.layout.point_column(id)?;
                let width = self.network.point(id).dimension;
                let columns: Vec<usize> = (offset..offset + width).collect();
                let q = cofactor.block(&columns, &columns);
                SymmetricEigen::new(q).eigenvalues.iter().copied().reduce(f64::max)
            })
            .fold(0.0, f64::max)
            * self.variance_factor
    }

    /// Standard deviations and tests of the additional parameters. Parameters
    /// marked for postprocessing are estimated from the residuals of their group.
    pub(crate) fn parameter_tests(&mut self, rows: &FinalRows) {
        let sigma2 = self.variance_factor;
        let lambda = self.noncentrality(1.0);
        for i in 0..self.network.parameters().len() {
            let id = ParameterId(i);
            let parameter = self.network.parameter(id);
            let (nabla, q) = match parameter.processing {
                ProcessingType::Fixed => continue,
                ProcessingType::Adjusted => {
                    let q = match (self.layout.parameter_column(id), self.cofactor.as_ref()) {
                        (Some(c), Some(cofactor)) => cofactor.get(c, c).max(0.0),
                        _ => continue,
                    };
                    (parameter.value - parameter.expectation(), q)
                }
                ProcessingType::Postprocessing => {
                    let entries = self.parameter_test_entries(rows, id);
                    let test = self.external_test(rows, &entries);
                    let m = test.matrix.get((0, 0)).copied().unwrap_or(0.0);
                    if m <= f64::EPSILON {
                        continue;
                    }
                    let parameter = self.network.parameter_mut(id);
                    parameter.value = parameter.approx + test.nabla[0];
                    (parameter.value - parameter.expectation(), 1.0 / m)
                }
            };
            let visible = self.network.parameter(id).visible;
            let mut result = self.network.parameter(id).result.clone();
            result.std = (sigma2 * q).sqrt();
            result.gross_error = nabla;
            result.minimal_detectable_bias = (lambda * sigma2 * q).sqrt();
            if visible && q > f64::EPSILON {
                let t_prio = nabla * nabla / q;
                let (t_post, denominator) = if self.config.apply_variance_of_unit_weight && sigma2 > 0.0 {
                    (t_prio / sigma2, self.degrees_of_freedom)
                } else {
                    (0.0, self.degrees_of_freedom)
                };
                result.test = self.test_result(1.0, t_prio, t_post, denominator, false);
            }
            self.network.parameter_mut(id).result = result;
        }
    }

    fn parameter_test_entries(&self, rows: &FinalRows, id: ParameterId) -> Vec<(RowRef, DVector<f64>)> {
        let parameter = self.network.parameter(id);
        self.network
            .group(parameter.group)
            .observations()
            .iter()
            .filter_map(|o| {
                let b = rows.linearizations[o.0].parameter(parameter.kind);
                (b != 0.0).then(|| (RowRef::Observation(o.0), DVector::from_element(1, b)))
            })
            .collect()
    }
}

/// Semi-axes `√(f·λi)` of a cofactor block, largest first, and the orientation of planar regions.
fn confidence_region(q: &DMatrix<f64>, factor: f64) -> ConfidenceRegion {
    let eigen = SymmetricEigen::new(q.clone());
    let mut semi_axes: Vec<f64> = eigen
        .eigenvalues
        .iter()
        .map(|l| (factor * l.max(0.0)).sqrt())
        .collect();
    semi_axes.sort_by(|a, b| b.total_cmp(a));
    let angle = (q.nrows() == 2)
        .then(|| 0.5 * (2.0 * q[(0, 1)]).atan2(q[(0, 0)] - q[(1, 1)]));
    ConfidenceRegion { semi_axes, angle }
}
