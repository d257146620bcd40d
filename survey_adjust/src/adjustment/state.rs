use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AdjustError, AdjustResult};

/// States reported by the estimation controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EstimationStateType {
    Busy,
    Iterate,
    UnscentedTransformationStep,
    InvertNormalEquationMatrix,
    EstimateStochasticParameters,
    Convergence,
    NoConvergence,
    SingularMatrix,
    RobustEstimationFailed,
    Interrupt,
    OutOfMemory,
    PrincipalComponentAnalysis,
    ExportAdjustmentResults,
    ExportAdjustmentResultsFailed,
    ErrorFreeEstimation,
}

impl EstimationStateType {
    /// Final states of a run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::NoConvergence
                | Self::SingularMatrix
                | Self::RobustEstimationFailed
                | Self::Interrupt
                | Self::OutOfMemory
                | Self::ErrorFreeEstimation
        )
    }

    /// Turns the states without usable results into errors.
    pub fn check(self) -> AdjustResult<Self> {
        match self {
            Self::SingularMatrix => Err(AdjustError::SingularMatrix),
            Self::Interrupt => Err(AdjustError::Interrupted),
            state => Ok(state),
        }
    }
}

/// Receives state changes of the controller together with a pair of progress values,
/// e.g. `(iteration, max_iterations)` or `(previous, current)` largest update.
pub trait ProgressSink {
    fn state_changed(&mut self, state: EstimationStateType, old_value: f64, new_value: f64);
}

impl<F> ProgressSink for F
where
    F: FnMut(EstimationStateType, f64, f64),
{
    fn state_changed(&mut self, state: EstimationStateType, old_value: f64, new_value: f64) {
        self(state, old_value, new_value)
    }
}

/// Forwards every state change to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn state_changed(&mut self, state: EstimationStateType, old_value: f64, new_value: f64) {
        log::info!("{state:?} ({old_value}, {new_value})");
    }
}

/// Cooperative cancellation flag shared between the caller and the controller.
#[derive(Debug, Default, Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
