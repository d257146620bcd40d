//! Least-squares adjustment of geodetic networks.
//!
//! [`NetworkAdjustment`] owns a [`Network`] together with the registration of
//! its points and parameters and runs the iterative Gauss-Markov estimation.
//! The work is split over several modules, each adding an `impl` block:
//!
//! * [`normal_equation`] assembles and inverts the bordered normal equations,
//! * [`controller`] drives iterations and the sigma-point steps,
//! * [`robust`] adapts weights for the L1 estimation,
//! * [`outer_accuracy`] derives redundancies and observation tests,
//! * [`significance`] tests points, deflections and parameters,
//! * [`congruence`] tests point ties and strain parameters,
//! * [`pca`] extracts principal components of the point covariance.

pub mod congruence;
pub mod controller;
pub mod layout;
pub mod normal_equation;
pub mod outer_accuracy;
pub mod pca;
pub mod rank_defect;
pub mod robust;
pub mod significance;
pub mod state;
pub mod strain;
pub mod unscented;
pub mod variance;

use log::info;
use nalgebra::{DMatrix, DVector};

use crate::config::AdjustmentConfig;
use crate::error::{AdjustError, AdjustResult};
use crate::io::ResultWriter;
use crate::model::{DeflectionMode, Network, ParameterId, PointId, PointRole, ProcessingType};
use crate::statistic::TestStatisticParameters;

pub use congruence::{CongruenceGroup, PointPair, TieResult};
pub use layout::{ParameterLayout, Slot, Unknown};
pub use normal_equation::{CofactorMatrix, NormalEquations};
pub use pca::PrincipalComponent;
pub use rank_defect::{DatumComponent, DefectType, RankDefect};
pub use state::{EstimationStateType, InterruptHandle, LogProgress, ProgressSink};
pub use strain::{RestrictionType, StrainAnalysis, StrainParameterResult};
pub use unscented::UnscentedTransformation;
pub use variance::{VarianceComponent, VarianceComponentType};

/// Inverse of the nuisance block and its coupling to the point coordinates,
/// kept from the final pass for the influence measures.
#[derive(Debug, Clone)]
pub(crate) struct NuisanceBlock {
    pub qzz: DMatrix<f64>,
    pub qzz_nzx: DMatrix<f64>,
}

/// Per-solve state passed through one pass of the estimation.
#[derive(Debug, Clone, Default)]
pub(crate) struct IterationContext {
    /// Perturbation of the observations and pseudo-observations of a sigma-point step.
    pub shift: Option<DVector<f64>>,
    /// The final pass must invert the normal equations.
    pub needs_cofactor: bool,
}

impl IterationContext {
    /// Perturbation of observation `index`; pseudo-observations follow the observations.
    pub fn shift(&self, index: usize) -> f64 {
        self.shift
            .as_ref()
            .and_then(|s| s.get(index).copied())
            .unwrap_or(0.0)
    }
}

pub struct NetworkAdjustment {
    pub(crate) network: Network,
    pub(crate) config: AdjustmentConfig,
    pub(crate) rank_defect: RankDefect,
    pub(crate) congruence: Vec<CongruenceGroup>,
    pub(crate) datum_points: Vec<PointId>,
    pub(crate) layout: ParameterLayout,
    pub(crate) cofactor: Option<CofactorMatrix>,
    pub(crate) nuisance: Option<NuisanceBlock>,
    pub(crate) variance_components: Vec<VarianceComponent>,
    pub(crate) test_parameters: Option<TestStatisticParameters>,
    pub(crate) principal_components: Vec<PrincipalComponent>,
    pub(crate) degrees_of_freedom: f64,
    pub(crate) omega: f64,
    pub(crate) variance_factor: f64,
    pub(crate) iterations: usize,
    pub(crate) max_dx: f64,
    pub(crate) state: EstimationStateType,
    progress: Option<Box<dyn ProgressSink>>,
    pub(crate) writer: Option<Box<dyn ResultWriter>>,
    pub(crate) interrupt: InterruptHandle,
}

impl NetworkAdjustment {
    pub fn new(network: Network, config: AdjustmentConfig) -> Self {
        Self {
            network,
            config,
            rank_defect: RankDefect::new(),
            congruence: Vec::new(),
            datum_points: Vec::new(),
            layout: ParameterLayout::default(),
            cofactor: None,
            nuisance: None,
            variance_components: Vec::new(),
            test_parameters: None,
            principal_components: Vec::new(),
            degrees_of_freedom: 0.0,
            omega: 0.0,
            variance_factor: 1.0,
            iterations: 0,
            max_dx: 0.0,
            state: EstimationStateType::Busy,
            progress: None,
            writer: None,
            interrupt: InterruptHandle::default(),
        }
    }

    pub fn set_progress_sink(&mut self, sink: impl ProgressSink + 'static) {
        self.progress = Some(Box::new(sink));
    }

    pub fn set_writer(&mut self, writer: impl ResultWriter + 'static) {
        self.writer = Some(Box::new(writer));
    }

    /// Handle to stop a running estimation from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub(crate) fn notify(&mut self, state: EstimationStateType, old_value: f64, new_value: f64) {
        if let Some(sink) = self.progress.as_mut() {
            sink.state_changed(state, old_value, new_value);
        }
    }

    fn unregistered(&self, id: PointId) -> AdjustResult<()> {
        let point = self
            .network
            .points()
            .get(id.0)
            .ok_or_else(|| AdjustError::invalid(format!("unknown point {}", id.0)))?;
        if point.role().is_some() {
            return Err(AdjustError::Duplicate {
                kind: "registered point",
                name: point.name.clone(),
            });
        }
        Ok(())
    }

    fn has_role(&self, roles: &[PointRole]) -> bool {
        self.network
            .points()
            .iter()
            .any(|p| p.role().is_some_and(|r| roles.contains(&r)))
    }

    fn register(&mut self, id: PointId, role: PointRole) -> AdjustResult<()> {
        let point = self.network.point(id);
        let deflection = &point.deflection;
        match deflection.mode {
            DeflectionMode::Fixed => {}
            _ if point.dimension != 3 => {
                return Err(AdjustError::invalid(format!(
                    "deflection of the vertical at `{}` needs a 3D point",
                    point.name
                )))
            }
            DeflectionMode::Stochastic => {
                if !matches!(role, PointRole::Reference | PointRole::Stochastic) {
                    return Err(AdjustError::invalid(format!(
                        "stochastic deflection at `{}` needs a reference or stochastic point",
                        point.name
                    )));
                }
                if !(deflection.std_apriori.min() > 0.0) {
                    return Err(AdjustError::invalid(format!(
                        "stochastic deflection at `{}` needs positive standard deviations",
                        point.name
                    )));
                }
            }
            DeflectionMode::Unknown => {
                if !matches!(role, PointRole::New | PointRole::Datum) {
                    return Err(AdjustError::invalid(format!(
                        "unknown deflection at `{}` needs a new or datum point",
                        point.name
                    )));
                }
            }
        }
        self.network.point_mut(id).role = Some(role);
        Ok(())
    }

    /// Registers a point with fixed coordinates.
    pub fn add_reference_point(&mut self, id: PointId) -> AdjustResult<()> {
        self.unregistered(id)?;
        if !self.datum_points.is_empty() {
            return Err(AdjustError::invalid(
                "reference points cannot be combined with datum points",
            ));
        }
        self.register(id, PointRole::Reference)
    }

    /// Registers a point whose approximate coordinates act as observations.
    pub fn add_stochastic_point(&mut self, id: PointId) -> AdjustResult<()> {
        self.unregistered(id)?;
        if !self.datum_points.is_empty() {
            return Err(AdjustError::invalid(
                "stochastic points cannot be combined with datum points",
            ));
        }
        let point = self.network.point(id);
        if point.axes().iter().any(|a| !(point.std_apriori[*a] > 0.0)) {
            return Err(AdjustError::invalid(format!(
                "stochastic point `{}` needs positive standard deviations",
                point.name
            )));
        }
        self.register(id, PointRole::Stochastic)
    }

    /// Registers a point defining the datum of a free network.
    pub fn add_datum_point(&mut self, id: PointId) -> AdjustResult<()> {
        self.unregistered(id)?;
        if self.has_role(&[PointRole::Reference, PointRole::Stochastic]) {
            return Err(AdjustError::invalid(
                "datum points need a network without reference or stochastic points",
            ));
        }
        self.register(id, PointRole::Datum)?;
        self.datum_points.push(id);
        Ok(())
    }

    /// Registers a point to be determined. It needs at least one observation per
    /// coordinate, two more with an unknown deflection.
    pub fn add_new_point(&mut self, id: PointId) -> AdjustResult<()> {
        self.unregistered(id)?;
        let point = self.network.point(id);
        let required = point.dimension + if point.has_unknown_deflection() { 2 } else { 0 };
        if point.observations().len() < required {
            return Err(AdjustError::invalid(format!(
                "new point `{}` has {} observations, {} required",
                point.name,
                point.observations().len(),
                required
            )));
        }
        self.register(id, PointRole::New)
    }

    /// Enables an additional parameter of the network.
    pub fn add_additional_parameter(
        &mut self,
        id: ParameterId,
        processing: ProcessingType,
    ) -> AdjustResult<()> {
        let parameter = self
            .network
            .parameters()
            .get(id.0)
            .ok_or_else(|| AdjustError::invalid(format!("unknown parameter {}", id.0)))?;
        let group = self.network.group(parameter.group);
        if parameter.processing != ProcessingType::Fixed {
            return Err(AdjustError::Duplicate {
                kind: "additional parameter",
                name: format!("{:?} of group `{}`", parameter.kind, group.name),
            });
        }
        let used = group.observations().iter().any(|o| {
            self.network
                .observation(*o)
                .kind
                .parameter_types()
                .contains(&parameter.kind)
        });
        if !used {
            return Err(AdjustError::invalid(format!(
                "group `{}` has no observation using {:?}",
                group.name, parameter.kind
            )));
        }
        self.network.parameter_mut(id).processing = processing;
        Ok(())
    }

    /// Adds a group of point ties between two epochs, returns its index.
    pub fn add_congruence_group(&mut self, group: CongruenceGroup) -> AdjustResult<usize> {
        if !(1..=3).contains(&group.dimension) {
            return Err(AdjustError::invalid(format!(
                "congruence group `{}` has unsupported dimension {}",
                group.name, group.dimension
            )));
        }
        if self.congruence.iter().any(|g| g.name == group.name) {
            return Err(AdjustError::Duplicate {
                kind: "congruence group",
                name: group.name,
            });
        }
        for tie in &group.ties {
            for id in [tie.start, tie.end] {
                let point = self
                    .network
                    .points()
                    .get(id.0)
                    .ok_or_else(|| AdjustError::invalid(format!("unknown point {}", id.0)))?;
                let covered = group
                    .axes()
                    .iter()
                    .all(|axis| point.axes().contains(axis));
                if !covered {
                    return Err(AdjustError::invalid(format!(
                        "point `{}` does not carry the coordinates of congruence group `{}`",
                        point.name, group.name
                    )));
                }
            }
            if tie.start == tie.end {
                return Err(AdjustError::invalid(format!(
                    "tie of congruence group `{}` connects a point with itself",
                    group.name
                )));
            }
        }
        if let Some(analysis) = &group.strain {
            let theta = strain::expectation(group.dimension);
            for r in &analysis.restrictions {
                if strain::restriction(group.dimension, *r, &theta).is_none() {
                    return Err(AdjustError::invalid(format!(
                        "restriction {r:?} does not apply to the {}D congruence group `{}`",
                        group.dimension, group.name
                    )));
                }
            }
        }
        self.congruence.push(group);
        Ok(self.congruence.len() - 1)
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn config(&self) -> &AdjustmentConfig {
        &self.config
    }

    /// Replaces the settings; they are validated when the next run starts.
    pub fn set_config(&mut self, config: AdjustmentConfig) {
        self.config = config;
    }

    pub fn rank_defect(&self) -> &RankDefect {
        &self.rank_defect
    }

    /// Detects the datum defect without running the adjustment.
    pub fn detect_rank_defect(&mut self) -> AdjustResult<&RankDefect> {
        self.check_registration()?;
        self.rank_defect = self.derive_rank_defect();
        Ok(&self.rank_defect)
    }

    pub fn congruence_groups(&self) -> &[CongruenceGroup] {
        &self.congruence
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    /// Cofactor matrix of the last complete pass, discarded by the principal component analysis.
    pub fn cofactor_matrix(&self) -> Option<&CofactorMatrix> {
        self.cofactor.as_ref()
    }

    pub fn variance_components(&self) -> &[VarianceComponent] {
        &self.variance_components
    }

    pub fn principal_components(&self) -> &[PrincipalComponent] {
        &self.principal_components
    }

    pub fn test_statistic_parameters(&self) -> Option<&TestStatisticParameters> {
        self.test_parameters.as_ref()
    }

    pub fn degrees_of_freedom(&self) -> f64 {
        self.degrees_of_freedom
    }

    /// Weighted sum of squared residuals.
    pub fn omega(&self) -> f64 {
        self.omega
    }

    /// A-posteriori variance of the unit weight.
    pub fn variance_factor(&self) -> f64 {
        self.variance_factor
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn state(&self) -> EstimationStateType {
        self.state
    }

    /// The network has no reference or stochastic points.
    pub fn is_free_network(&self) -> bool {
        !self.has_role(&[PointRole::Reference, PointRole::Stochastic])
    }

    /// All observations connect registered points; a free network needs datum points.
    pub(crate) fn check_registration(&self) -> AdjustResult<()> {
        for obs in self.network.observations() {
            for id in [obs.start, obs.end] {
                let point = self.network.point(id);
                if point.role().is_none() {
                    return Err(AdjustError::invalid(format!(
                        "point `{}` is observed but not registered",
                        point.name
                    )));
                }
            }
        }
        if self.is_free_network() && self.datum_points.is_empty() {
            return Err(AdjustError::invalid(
                "free network without datum points",
            ));
        }
        Ok(())
    }

    pub(crate) fn derive_rank_defect(&self) -> RankDefect {
        if let Some(defect) = &self.config.rank_defect {
            return defect.clone().user_defined();
        }
        if self.is_free_network() {
            return rank_defect::detect(&self.network, &self.datum_points);
        }
        let registered: Vec<PointId> = self
            .network
            .point_ids()
            .filter(|id| self.network.point(*id).role().is_some())
            .collect();
        let defect = rank_defect::anchored(&self.network, &registered);
        if defect.defect() > 0 {
            log::warn!(
                "network is held by reference points but {:?} remain undetermined",
                defect.free_components()
            );
        }
        defect
    }

    /// One-line summary of the last run.
    pub fn summary(&self) -> String {
        format!(
            "{:?}: {} iterations, dof {:.3}, omega {:.6}, sigma2 {:.6}",
            self.state, self.iterations, self.degrees_of_freedom, self.omega, self.variance_factor
        )
    }

    pub(crate) fn log_summary(&self) {
        info!("{}", self.summary());
    }
}
