//! Settings that control a single adjustment run.

use serde::{Deserialize, Serialize};

use crate::adjustment::RankDefect;
use crate::error::{AdjustError, AdjustResult};
use crate::statistic::TestStatisticDefinition;

/// Estimation mode of the adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EstimationType {
    #[default]
    L2Norm,
    L1Norm,
    /// Pre-analysis: observations are not used, only the geometry.
    Simulation,
    ModifiedUnscentedTransformation,
    SphericalSimplexUnscentedTransformation,
}

impl EstimationType {
    pub fn is_unscented(self) -> bool {
        matches!(
            self,
            Self::ModifiedUnscentedTransformation | Self::SphericalSimplexUnscentedTransformation
        )
    }
}

/// Scaling of the sigma points of the unscented transformation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct UnscentedConfig {
    pub alpha: f64,
    pub beta: f64,
    pub weight_zero: f64,
}

impl Default for UnscentedConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 2.0,
            weight_zero: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdjustmentConfig {
    pub estimation_type: EstimationType,
    pub max_iterations: usize,
    /// Boundary of the normalized residual used by the L1 weight adaption.
    pub robust_limit: f64,
    pub unscented: UnscentedConfig,
    pub congruence_analysis: bool,
    /// Scale the cofactors with the estimated variance of unit weight.
    pub apply_variance_of_unit_weight: bool,
    /// User-defined datum defect, replaces the detected one when present.
    pub rank_defect: Option<RankDefect>,
    /// Test statistic used for outlier and significance tests.
    pub significance: TestStatisticDefinition,
    /// Test statistic used to scale the confidence regions.
    pub confidence_region: TestStatisticDefinition,
    pub number_of_principal_components: usize,
    /// Cross-check the datum defect against the eigenvalues of N.
    pub proof_datum_defect: bool,
}

impl Default for AdjustmentConfig {
    fn default() -> Self {
        Self {
            estimation_type: EstimationType::L2Norm,
            max_iterations: 50,
            robust_limit: 3.5,
            unscented: UnscentedConfig::default(),
            congruence_analysis: false,
            apply_variance_of_unit_weight: true,
            rank_defect: None,
            significance: TestStatisticDefinition::default(),
            confidence_region: TestStatisticDefinition::default(),
            number_of_principal_components: 0,
            proof_datum_defect: false,
        }
    }
}

impl AdjustmentConfig {
    /// Reads a configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: &str) -> AdjustResult<Self> {
        let contents = crate::io::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AdjustResult<()> {
        if !(self.robust_limit > 0.0) {
            return Err(AdjustError::InvalidArgument(format!(
                "robust limit must be positive, got {}",
                self.robust_limit
            )));
        }
        if self.estimation_type.is_unscented() {
            let ut = &self.unscented;
            if !(0.0..1.0).contains(&ut.weight_zero) {
                return Err(AdjustError::InvalidArgument(format!(
                    "weight of the central sigma point must lie in [0, 1), got {}",
                    ut.weight_zero
                )));
            }
            if !(ut.alpha > 0.0) {
                return Err(AdjustError::InvalidArgument(format!(
                    "scaling parameter alpha must be positive, got {}",
                    ut.alpha
                )));
            }
        }
        self.significance.validate()?;
        self.confidence_region.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AdjustmentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.estimation_type, EstimationType::L2Norm);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: AdjustmentConfig =
            serde_json::from_str(r#"{"estimation_type":"L1_NORM","max_iterations":10}"#).unwrap();
        assert_eq!(config.estimation_type, EstimationType::L1Norm);
        assert_eq!(config.max_iterations, 10);
        assert!((config.robust_limit - 3.5).abs() < 1e-12);
        assert!((config.unscented.beta - 2.0).abs() < 1e-12);
    }

    #[test]
    fn central_weight_out_of_range() {
        let mut config = AdjustmentConfig {
            estimation_type: EstimationType::SphericalSimplexUnscentedTransformation,
            ..Default::default()
        };
        config.unscented.weight_zero = 1.0;
        assert!(matches!(
            config.validate(),
            Err(AdjustError::InvalidArgument(_))
        ));
    }
}
