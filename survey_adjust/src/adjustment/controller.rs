// Iteration control of the adjustment: assembles and solves the normal
// equations until the largest update drops below √ε, runs the sigma-point
// steps of the unscented transformation and finally derives the statistics.

use log::{debug, info, warn};
use nalgebra::DVector;

use crate::adjustment::layout::PseudoRow;
use crate::adjustment::normal_equation::{invert_symmetric, CofactorMatrix, NormalEquations};
use crate::adjustment::outer_accuracy::FinalRows;
use crate::adjustment::rank_defect;
use crate::adjustment::{
    EstimationStateType, IterationContext, NetworkAdjustment, NuisanceBlock, ParameterLayout,
    UnscentedTransformation, Unknown,
};
use crate::config::EstimationType;
use crate::error::AdjustResult;
use crate::model::{ObservationId, PointRole};

impl NetworkAdjustment {
    /// Runs the adjustment and returns its final state.
    ///
    /// Setup errors are returned as `Err`. Numerical failures, interrupts and
    /// missing convergence are reported through the returned state; results
    /// computed up to that point stay available.
    pub fn estimate_model(&mut self) -> AdjustResult<EstimationStateType> {
        self.config.validate()?;
        self.check_registration()?;
        self.clear_results();
        self.notify(EstimationStateType::Busy, 0.0, 0.0);

        self.rank_defect = self.derive_rank_defect();
        self.prepare_strain();
        let datum_rows = if self.is_free_network() {
            self.rank_defect.defect()
        } else {
            0
        };
        self.layout = ParameterLayout::build(&self.network, &self.congruence, datum_rows);
        let size = self.layout.size();
        if size.checked_mul(size).and_then(|n| n.checked_mul(8)).is_none() {
            return Ok(self.finish(EstimationStateType::OutOfMemory));
        }
        info!(
            "adjusting {} observations, {} unknowns, datum defect {}",
            self.network.observations().len(),
            self.layout.unknowns(),
            datum_rows
        );
        if self.config.proof_datum_defect && datum_rows > 0 {
            self.proof_datum_defect();
        }

        let kind = self.config.estimation_type;
        let mut ut = if kind.is_unscented() {
            let n = self.network.observations().len() + self.layout.pseudo_rows().len();
            Some(UnscentedTransformation::new(kind, &self.config.unscented, n)?)
        } else {
            None
        };
        let steps = ut.as_ref().map_or(1, UnscentedTransformation::steps);
        let sigma = self.apriori_deviations();

        let mut state = EstimationStateType::Convergence;
        let mut rows = None;
        for step in 0..steps {
            self.network.reset();
            self.reset_strain();
            let shift = ut.as_ref().map(|ut| {
                self.notify(
                    EstimationStateType::UnscentedTransformationStep,
                    step as f64,
                    steps as f64,
                );
                ut.perturbation(step).component_mul(&sigma)
            });
            let (outcome, step_rows) = self.iterate(shift, step + 1 == steps);
            state = outcome;
            match state {
                EstimationStateType::Convergence
                | EstimationStateType::NoConvergence
                | EstimationStateType::RobustEstimationFailed => {}
                EstimationStateType::Interrupt => {
                    self.interrupt.clear();
                    return Ok(self.finish(state));
                }
                _ => return Ok(self.finish(state)),
            }
            rows = step_rows;
            if let Some(ut) = ut.as_mut() {
                ut.add_solution(step, self.parameter_vector());
            }
        }
        if let Some(ut) = ut.as_ref() {
            if let Some((mean, covariance)) = ut.finish() {
                self.assign_parameter_vector(&mean);
                self.cofactor = Some(CofactorMatrix::from_matrix(covariance));
            }
            // the empirical covariance belongs to the mean, not to the last sigma point
            rows = None;
        }

        let ctx = IterationContext {
            shift: None,
            needs_cofactor: true,
        };
        let complete = match rows.or_else(|| self.final_rows(&ctx)) {
            Some(mut rows) => self.statistics(&mut rows),
            None => false,
        };
        self.restore_adapted_std();
        if !complete {
            self.interrupt.clear();
            return Ok(self.finish(EstimationStateType::Interrupt));
        }

        self.state = if matches!(
            state,
            EstimationStateType::NoConvergence | EstimationStateType::RobustEstimationFailed
        ) {
            state
        } else {
            EstimationStateType::ErrorFreeEstimation
        };
        self.export();
        self.principal_component_analysis();
        Ok(self.finish(self.state))
    }

    fn clear_results(&mut self) {
        self.restore_adapted_std();
        self.cofactor = None;
        self.nuisance = None;
        self.variance_components.clear();
        self.principal_components.clear();
        self.test_parameters = None;
        self.degrees_of_freedom = 0.0;
        self.omega = 0.0;
        self.variance_factor = 1.0;
        self.iterations = 0;
        self.max_dx = 0.0;
    }

    fn finish(&mut self, state: EstimationStateType) -> EstimationStateType {
        self.state = state;
        self.notify(state, self.iterations as f64, self.max_dx);
        match state {
            EstimationStateType::ErrorFreeEstimation => self.log_summary(),
            _ => warn!("{}", self.summary()),
        }
        state
    }

    /// Gauss-Newton passes of one sigma-point step. `final_step` requests the
    /// inversion of the normal equations in the last pass. The rows of the last
    /// inverted system come back with their residuals at the updated parameters.
    fn iterate(
        &mut self,
        shift: Option<DVector<f64>>,
        final_step: bool,
    ) -> (EstimationStateType, Option<FinalRows>) {
        let kind = self.config.estimation_type;
        let max_iterations = self.config.max_iterations;
        let l1 = kind == EstimationType::L1Norm;
        let mut runs = max_iterations.saturating_sub(1);
        let mut final_pass = max_iterations == 0 || kind == EstimationType::Simulation;
        let mut exhausted = false;

        loop {
            if self.interrupt.is_interrupted() {
                return (EstimationStateType::Interrupt, None);
            }
            self.iterations += 1;
            self.notify(
                EstimationStateType::Iterate,
                self.iterations as f64,
                max_iterations as f64,
            );
            let ctx = IterationContext {
                shift: shift.clone(),
                needs_cofactor: final_pass && final_step,
            };
            let Some(mut normal) = self.assemble(&ctx) else {
                return (EstimationStateType::Interrupt, None);
            };

            let inverted = ctx.needs_cofactor || l1;
            let dx = if inverted {
                if ctx.needs_cofactor {
                    self.notify(
                        EstimationStateType::InvertNormalEquationMatrix,
                        0.0,
                        normal.size() as f64,
                    );
                    self.nuisance = self.nuisance_block(&mut normal);
                }
                match normal.invert() {
                    Some((cofactor, dx)) => {
                        self.cofactor = Some(cofactor);
                        dx
                    }
                    None => return (EstimationStateType::SingularMatrix, None),
                }
            } else {
                match normal.solve() {
                    Some(dx) => dx,
                    None => return (EstimationStateType::SingularMatrix, None),
                }
            };

            // design rows of the same linearization as Qxx
            let mut rows = None;
            if inverted {
                let Some(linearized) = self.final_rows(&ctx) else {
                    return (EstimationStateType::Interrupt, None);
                };
                rows = Some(linearized);
            }

            let max_dx = self.apply_update(&dx, final_pass);
            if !max_dx.is_finite() {
                return (EstimationStateType::SingularMatrix, None);
            }
            let previous = self.max_dx;
            self.max_dx = max_dx;
            debug!("iteration {}: max |dx| = {max_dx:.3e}", self.iterations);

            if let Some(rows) = rows.as_mut() {
                if !self.refresh_residuals(rows, &ctx) {
                    return (EstimationStateType::Interrupt, None);
                }
            }
            if final_pass {
                let state = match (exhausted, l1) {
                    (true, true) => EstimationStateType::RobustEstimationFailed,
                    (true, false) => EstimationStateType::NoConvergence,
                    _ => EstimationStateType::Convergence,
                };
                return (state, rows);
            }
            if let Some(rows) = rows.as_ref() {
                self.update_redundancies(rows);
                self.robust_step(rows);
            }
            if max_dx <= f64::EPSILON.sqrt() {
                self.notify(EstimationStateType::Convergence, previous, max_dx);
                final_pass = true;
            } else if runs == 0 {
                warn!("no convergence after {} iterations, max |dx| = {max_dx:.3e}", self.iterations);
                exhausted = true;
                final_pass = true;
            } else {
                runs -= 1;
            }
        }
    }

    /// Builds the normal equations at the current parameters. `None` if interrupted.
    pub(crate) fn assemble(&self, ctx: &IterationContext) -> Option<NormalEquations> {
        let layout = &self.layout;
        let mut normal = NormalEquations::new(layout.size(), layout.unknowns());
        let count = self.network.observations().len();
        for i in 0..count {
            if self.interrupt.is_interrupted() {
                return None;
            }
            let (row, _) = layout.design_row(&self.network, ObservationId(i), ctx.shift(i));
            normal.add_row(&row);
        }
        for (k, pseudo) in layout.pseudo_rows().iter().enumerate() {
            let row = layout.pseudo_design_row(&self.network, *pseudo, ctx.shift(count + k));
            normal.add_row(&row);
        }

        let datum = layout.datum_rows();
        if !datum.is_empty() {
            let columns: Vec<_> = self
                .datum_points
                .iter()
                .filter_map(|id| layout.point_column(*id).map(|c| (*id, c)))
                .collect();
            let rows = rank_defect::datum_rows(&self.network, &self.rank_defect, &columns);
            for (row, entries) in datum.zip(rows.iter()) {
                normal.add_constraint(row, entries, 0.0);
            }
        }
        self.add_strain_rows(&mut normal);

        if self.config.estimation_type == EstimationType::Simulation {
            normal.clear_vector();
        }
        normal.symmetrize();
        Some(normal)
    }

    /// Inverse of the nuisance block `Nzz` and `Qzz·Nzx`, taken before `N` is inverted.
    fn nuisance_block(&self, normal: &mut NormalEquations) -> Option<NuisanceBlock> {
        let z: Vec<usize> = self.layout.nuisance_columns().collect();
        if z.is_empty() {
            return None;
        }
        let x: Vec<usize> = self.layout.point_columns().collect();
        let nzz = normal.block(&z, &z);
        let nzx = normal.block(&z, &x);
        let qzz = invert_symmetric(&nzz)?;
        let qzz_nzx = &qzz * nzx;
        Some(NuisanceBlock { qzz, qzz_nzx })
    }

    /// Adds the update to all unknowns and returns its largest absolute element.
    /// Stochastic points are left out of the maximum in the final pass.
    fn apply_update(&mut self, dx: &DVector<f64>, final_pass: bool) -> f64 {
        if dx.iter().any(|v| !v.is_finite()) {
            return f64::NAN;
        }
        let mut max_dx = 0.0f64;
        for (unknown, slot) in self.layout.slots().to_vec() {
            let update = dx.rows(slot.offset, slot.width);
            let mut tracked = true;
            match unknown {
                Unknown::Point(id) => {
                    let point = self.network.point_mut(id);
                    tracked = !(final_pass && point.role() == Some(PointRole::Stochastic));
                    for (i, axis) in point.axes().iter().enumerate() {
                        point.coordinates[*axis] += update[i];
                    }
                }
                Unknown::Deflection(id) => {
                    let deflection = &mut self.network.point_mut(id).deflection;
                    deflection.value.x += update[0];
                    deflection.value.y += update[1];
                }
                Unknown::Additional(id) => {
                    self.network.parameter_mut(id).value += update[0];
                }
                Unknown::Strain { group } => {
                    let values: Vec<f64> = update.iter().copied().collect();
                    self.update_strain(group, &values);
                }
            }
            if tracked {
                max_dx = update.iter().fold(max_dx, |m, v| m.max(v.abs()));
            }
        }
        max_dx
    }

    /// Current values of all unknowns in column order.
    fn parameter_vector(&self) -> DVector<f64> {
        let mut x = DVector::zeros(self.layout.unknowns());
        for (unknown, slot) in self.layout.slots() {
            let mut target = x.rows_mut(slot.offset, slot.width);
            match *unknown {
                Unknown::Point(id) => {
                    let point = self.network.point(id);
                    for (i, axis) in point.axes().iter().enumerate() {
                        target[i] = point.coordinates[*axis];
                    }
                }
                Unknown::Deflection(id) => {
                    let value = self.network.point(id).deflection.value;
                    target[0] = value.x;
                    target[1] = value.y;
                }
                Unknown::Additional(id) => target[0] = self.network.parameter(id).value,
                Unknown::Strain { group } => {
                    if let Some(values) = self.strain_values(group) {
                        target.copy_from(values);
                    }
                }
            }
        }
        x
    }

    fn assign_parameter_vector(&mut self, x: &DVector<f64>) {
        for (unknown, slot) in self.layout.slots().to_vec() {
            let source = x.rows(slot.offset, slot.width);
            match unknown {
                Unknown::Point(id) => {
                    let point = self.network.point_mut(id);
                    for (i, axis) in point.axes().iter().enumerate() {
                        point.coordinates[*axis] = source[i];
                    }
                }
                Unknown::Deflection(id) => {
                    let deflection = &mut self.network.point_mut(id).deflection;
                    deflection.value.x = source[0];
                    deflection.value.y = source[1];
                }
                Unknown::Additional(id) => self.network.parameter_mut(id).value = source[0],
                Unknown::Strain { group } => {
                    let values: Vec<f64> = source.iter().copied().collect();
                    self.set_strain_values(group, &values);
                }
            }
        }
    }

    /// A-priori standard deviations of the observations followed by the pseudo-observations.
    fn apriori_deviations(&self) -> DVector<f64> {
        let observations = self.network.observations().iter().map(|o| o.std_apriori);
        let pseudo = self.layout.pseudo_rows().iter().map(|p| match *p {
            PseudoRow::Point { point, axis, .. } => self.network.point(point).std_apriori[axis],
            PseudoRow::Deflection {
                point, component, ..
            } => self.network.point(point).deflection.std_apriori[component],
        });
        let values: Vec<f64> = observations.chain(pseudo).collect();
        DVector::from_vec(values)
    }

    /// Compares the datum defect with the number of vanishing eigenvalues of `N`.
    fn proof_datum_defect(&mut self) {
        let ctx = IterationContext::default();
        let Some(mut normal) = self.assemble(&ctx) else {
            return;
        };
        let columns: Vec<usize> = (0..self.layout.nuisance_columns().end).collect();
        let block = normal.block(&columns, &columns);
        let expected = self.rank_defect.defect();
        let zeros = rank_defect::count_zero_eigenvalues(block, expected);
        if zeros == expected {
            debug!("datum defect {expected} confirmed by the eigenvalues of N");
        } else {
            warn!("datum defect {expected} differs from {zeros} vanishing eigenvalues of N");
        }
    }

    /// Residuals, accuracies and tests at the final parameters. Ω and the tests use
    /// the a-priori deviations, the redundancies those of the last pass. `false` if
    /// interrupted.
    fn statistics(&mut self, rows: &mut FinalRows) -> bool {
        self.notify(EstimationStateType::EstimateStochasticParameters, 0.0, 0.0);
        let sigma = self.apriori_deviations();
        for (row, std) in rows
            .observations
            .iter_mut()
            .chain(rows.pseudo.iter_mut())
            .zip(sigma.iter())
        {
            row.rebase(*std);
        }
        let rows: &FinalRows = rows;

        let (omega, dof) = self.update_redundancies(rows);
        self.omega = omega;
        self.degrees_of_freedom = dof;
        let simulation = self.config.estimation_type == EstimationType::Simulation;
        self.variance_factor = if dof <= f64::EPSILON.sqrt()
            || omega <= 0.0
            || simulation
            || !self.config.apply_variance_of_unit_weight
        {
            1.0
        } else {
            omega / dof
        };

        let hypotheses = self.count_hypotheses(rows);
        self.build_test_parameters(hypotheses);
        self.point_accuracy(hypotheses);
        let point_max = self.largest_point_variance();
        if !self.observation_tests(rows, point_max) {
            return false;
        }
        self.estimate_variance_components(rows);
        if !self.point_tests(rows) {
            return false;
        }
        self.deflection_tests(rows);
        self.parameter_tests(rows);
        self.congruence_analysis(rows);
        true
    }

    /// Hands the results to the registered writer; a failure keeps the statistics.
    fn export(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        let report = self.report();
        match writer.write(&report) {
            Ok(()) => self.notify(EstimationStateType::ExportAdjustmentResults, 0.0, 1.0),
            Err(e) => {
                warn!("export of adjustment results failed: {e}");
                self.notify(EstimationStateType::ExportAdjustmentResultsFailed, 0.0, 0.0);
            }
        }
        self.writer = Some(writer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdjustmentConfig;
    use crate::model::{Network, Observation, ObservationKind, Point};

    fn free_leveling() -> NetworkAdjustment {
        let mut network = Network::new();
        let ids: Vec<_> = [100.0, 101.0, 102.5]
            .iter()
            .enumerate()
            .map(|(i, z)| network.add_point(Point::height(format!("H{i}"), *z)).unwrap())
            .collect();
        let g = network.add_group("leveling");
        for (s, e, value) in [(0, 1, 1.001), (1, 2, 1.499), (2, 0, -2.5)] {
            network
                .add_observation(Observation::new(ObservationKind::Leveling, g, ids[s], ids[e], value, 0.001))
                .unwrap();
        }
        let mut adjustment = NetworkAdjustment::new(network, AdjustmentConfig::default());
        for id in ids {
            adjustment.add_datum_point(id).unwrap();
        }
        adjustment
    }

    #[test]
    fn bordered_system_is_symmetric() {
        let mut adjustment = free_leveling();
        adjustment.rank_defect = adjustment.derive_rank_defect();
        let defect = adjustment.rank_defect.defect();
        assert_eq!(defect, 1);
        adjustment.layout = ParameterLayout::build(&adjustment.network, &adjustment.congruence, defect);

        let normal = adjustment.assemble(&IterationContext::default()).unwrap();
        assert_eq!(normal.size(), adjustment.layout.unknowns() + defect);
        assert!(normal.is_symmetric());
        let border = 1.0 / 3f64.sqrt();
        for column in 0..3 {
            assert!((normal.matrix()[(3, column)] - border).abs() < 1e-12);
        }
        assert_eq!(normal.matrix()[(3, 3)], 0.0);
    }

    #[test]
    fn loop_misclosure_is_distributed() {
        let mut adjustment = free_leveling();
        let state = adjustment.estimate_model().unwrap();
        assert_eq!(state, EstimationStateType::ErrorFreeEstimation);
        // the loop closes, so every observation is reproduced
        for obs in adjustment.network.observations() {
            assert!(obs.result.residual.abs() < 1e-9);
            assert!((obs.result.redundancy - 1.0 / 3.0).abs() < 1e-9);
        }
        assert!((adjustment.degrees_of_freedom - 1.0).abs() < 1e-9);
    }

    #[test]
    fn update_excludes_stochastic_points_in_final_pass() {
        let mut network = Network::new();
        let a = network
            .add_point(Point::height("A", 100.0).with_std(nalgebra::Vector3::new(0.0, 0.0, 0.01)))
            .unwrap();
        let b = network.add_point(Point::height("B", 101.0)).unwrap();
        let g = network.add_group("leveling");
        network
            .add_observation(Observation::new(ObservationKind::Leveling, g, a, b, 1.0, 0.001))
            .unwrap();
        let mut adjustment = NetworkAdjustment::new(network, AdjustmentConfig::default());
        adjustment.add_stochastic_point(a).unwrap();
        adjustment.add_new_point(b).unwrap();
        adjustment.layout = ParameterLayout::build(&adjustment.network, &adjustment.congruence, 0);

        let column = adjustment.layout.point_column(a).unwrap();
        let mut dx = DVector::zeros(adjustment.layout.unknowns());
        dx[column] = 0.5;
        assert_eq!(adjustment.apply_update(&dx, false), 0.5);
        assert_eq!(adjustment.apply_update(&dx, true), 0.0);
        assert!((adjustment.network.point(a).coordinates.z - 101.0).abs() < 1e-12);
    }
}
