//! Test statistics for outlier and significance tests.
//!
//! A [`TestStatisticDefinition`] selects the family (Baarda, Šidák or
//! unadjusted) and the error probabilities. [`TestStatisticParameters`]
//! turns it into critical values for a numerator/denominator pair and caches
//! them for the remainder of the run.

pub mod distribution;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{AdjustError, AdjustResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatisticType {
    /// B-method: the non-centrality parameter of a one-dimensional test is
    /// shared by all tests.
    #[default]
    Baarda,
    /// Šidák correction over the hypotheses tested in a run.
    Sidak,
    /// Every test uses the plain probability value.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestStatisticDefinition {
    #[serde(rename = "type")]
    pub kind: TestStatisticType,
    /// Probability of a type I error in percent.
    pub probability_value: f64,
    /// Power of the test in percent.
    pub power_of_test: f64,
    /// Interpret the probability value as familywise error rate.
    pub familywise: bool,
}

impl Default for TestStatisticDefinition {
    fn default() -> Self {
        Self {
            kind: TestStatisticType::Baarda,
            probability_value: 0.1,
            power_of_test: 80.0,
            familywise: false,
        }
    }
}

impl TestStatisticDefinition {
    pub fn validate(&self) -> AdjustResult<()> {
        let in_range = |v: f64| v > 0.0 && v < 100.0;
        if !in_range(self.probability_value) || !in_range(self.power_of_test) {
            return Err(AdjustError::InvalidArgument(format!(
                "probability value and power of test must lie in (0, 100) %, got {} % and {} %",
                self.probability_value, self.power_of_test
            )));
        }
        Ok(())
    }
}

/// Critical values of one test dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestStatisticParameterSet {
    pub numerator_dof: f64,
    pub denominator_dof: f64,
    /// Probability value actually used, in percent.
    pub probability_value: f64,
    /// Power of the test, in percent.
    pub power_of_test: f64,
    pub quantile: f64,
    pub noncentrality_parameter: f64,
    pub global: bool,
}

#[derive(Debug, Clone)]
enum Family {
    Baarda {
        reference_dof: f64,
        ncp: f64,
    },
    Sidak {
        hypotheses: usize,
        alpha_local: f64,
        alpha_global: f64,
        ncp: f64,
    },
    Unadjusted,
}

/// Lazily evaluated quantiles for one adjustment run.
#[derive(Debug, Clone)]
pub struct TestStatisticParameters {
    definition: TestStatisticDefinition,
    family: Family,
    cache: HashMap<(u64, u64, bool), TestStatisticParameterSet>,
}

/// `χ²(1-α; n) / n` or `F(1-α; n, m)`, α in percent.
pub fn quantile(n: f64, m: f64, alpha: f64) -> f64 {
    if n <= 0.0 || m <= 0.0 {
        return f64::INFINITY;
    }
    let p = 1.0 - 0.01 * alpha;
    if m.is_infinite() {
        distribution::chi_square_quantile(p, n) / n
    } else {
        distribution::f_quantile(p, n, m)
    }
}

/// Probability value in percent belonging to the critical value `x`.
pub fn probability_value(x: f64, n: f64, m: f64) -> f64 {
    if !x.is_finite() || x < 0.0 || n <= 0.0 || m <= 0.0 {
        return 100.0;
    }
    let p = if m.is_infinite() {
        distribution::chi_square_sf(n * x, n)
    } else {
        distribution::f_sf(x, n, m)
    };
    100.0 * p
}

/// Power of the test in percent for the critical value `x` and the shift `ncp`.
pub fn power_of_test(x: f64, n: f64, m: f64, ncp: f64) -> f64 {
    if !x.is_finite() || x < 0.0 || n <= 0.0 || m <= 0.0 {
        return 100.0;
    }
    let cdf = if m.is_infinite() {
        distribution::noncentral_chi_square_cdf(n * x, n, ncp)
    } else {
        distribution::noncentral_f_cdf(x, n, m, ncp)
    };
    100.0 * (1.0 - cdf)
}

/// Critical value of dimension `n` sharing the non-centrality `ncp` at power β (percent).
fn quantile_via_ncp(n: f64, m: f64, ncp: f64, beta: f64) -> f64 {
    if n <= 0.0 || m <= 0.0 {
        return f64::INFINITY;
    }
    let p = 1.0 - 0.01 * beta;
    if m.is_infinite() || ncp.is_infinite() {
        distribution::noncentral_chi_square_quantile(p, n, ncp) / n
    } else {
        distribution::noncentral_f_quantile(p, n, m, ncp)
    }
}

fn ncp(n: f64, alpha: f64, beta: f64) -> f64 {
    distribution::noncentrality_parameter(n, 0.01 * alpha, 0.01 * beta)
}

impl TestStatisticParameters {
    /// `hypotheses` is the number of tests carried out in the run (Šidák),
    /// `degrees_of_freedom` the redundancy of the adjustment (familywise Baarda).
    pub fn new(
        definition: TestStatisticDefinition,
        hypotheses: usize,
        degrees_of_freedom: f64,
    ) -> Self {
        let alpha = definition.probability_value;
        let beta = definition.power_of_test;
        let family = match definition.kind {
            TestStatisticType::Baarda => {
                let reference_dof = if definition.familywise {
                    degrees_of_freedom.round().max(1.0)
                } else {
                    1.0
                };
                Family::Baarda {
                    reference_dof,
                    ncp: ncp(reference_dof, alpha, beta),
                }
            }
            TestStatisticType::Sidak => {
                let d = 1.0 - 0.01 * alpha;
                if hypotheses == 0 {
                    Family::Sidak {
                        hypotheses,
                        alpha_local: alpha,
                        alpha_global: alpha,
                        ncp: ncp(1.0, alpha, beta),
                    }
                } else if definition.familywise {
                    Family::Sidak {
                        hypotheses,
                        alpha_local: 100.0 * (1.0 - d.powf(1.0 / hypotheses as f64)),
                        alpha_global: alpha,
                        ncp: ncp(hypotheses as f64, alpha, beta),
                    }
                } else {
                    Family::Sidak {
                        hypotheses,
                        alpha_local: alpha,
                        alpha_global: 100.0 * (1.0 - d.powi(hypotheses as i32)),
                        ncp: ncp(1.0, alpha, beta),
                    }
                }
            }
            TestStatisticType::None => Family::Unadjusted,
        };
        Self {
            definition,
            family,
            cache: HashMap::new(),
        }
    }

    pub fn definition(&self) -> &TestStatisticDefinition {
        &self.definition
    }

    /// Parameter set of a test with `n` numerator and `m` denominator degrees of freedom.
    pub fn parameter_set(&mut self, n: f64, m: f64, global: bool) -> TestStatisticParameterSet {
        let key = (n.to_bits(), m.to_bits(), global);
        if let Some(set) = self.cache.get(&key) {
            return *set;
        }
        let set = self.evaluate(n, m, global);
        self.cache.insert(key, set);
        set
    }

    /// All parameter sets evaluated so far, ordered by dimension.
    pub fn parameter_sets(&self) -> Vec<TestStatisticParameterSet> {
        let mut sets: Vec<_> = self.cache.values().copied().collect();
        sets.sort_by(|a, b| {
            a.numerator_dof
                .total_cmp(&b.numerator_dof)
                .then(b.denominator_dof.total_cmp(&a.denominator_dof))
        });
        sets
    }

    fn evaluate(&self, n: f64, m: f64, global: bool) -> TestStatisticParameterSet {
        let alpha = self.definition.probability_value;
        let beta = self.definition.power_of_test;
        match self.family {
            Family::Baarda { reference_dof, ncp } => {
                let (quantile, alpha) = if n == reference_dof && m.is_infinite() {
                    (quantile(n, m, alpha), alpha)
                } else {
                    let q = quantile_via_ncp(n, m, ncp, beta);
                    (q, probability_value(q, n, m))
                };
                TestStatisticParameterSet {
                    numerator_dof: n,
                    denominator_dof: m,
                    probability_value: alpha.clamp(f64::EPSILON, 100.0 - f64::EPSILON.sqrt()),
                    power_of_test: beta,
                    quantile,
                    noncentrality_parameter: ncp,
                    global,
                }
            }
            Family::Sidak {
                hypotheses,
                alpha_local,
                alpha_global,
                ncp,
            } => {
                let alpha = if global || (hypotheses > 0 && n >= hypotheses as f64) {
                    alpha_global
                } else {
                    alpha_local
                };
                let q = quantile(n, m, alpha);
                TestStatisticParameterSet {
                    numerator_dof: n,
                    denominator_dof: m,
                    probability_value: alpha,
                    power_of_test: power_of_test(q, n, m, ncp),
                    quantile: q,
                    noncentrality_parameter: ncp,
                    global,
                }
            }
            Family::Unadjusted => TestStatisticParameterSet {
                numerator_dof: n,
                denominator_dof: m,
                probability_value: alpha,
                power_of_test: beta,
                quantile: quantile(n, m, alpha),
                noncentrality_parameter: ncp(n, alpha, beta),
                global,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unadjusted_one_dimensional_quantile() {
        let definition = TestStatisticDefinition {
            kind: TestStatisticType::None,
            probability_value: 5.0,
            ..Default::default()
        };
        let mut params = TestStatisticParameters::new(definition, 10, 10.0);
        let set = params.parameter_set(1.0, f64::INFINITY, false);
        assert!((set.quantile - 3.841_458_820_694_124).abs() < 1e-6);
        assert!((set.probability_value - 5.0).abs() < 1e-12);
    }

    #[test]
    fn baarda_keeps_power_across_dimensions() {
        let mut params = TestStatisticParameters::new(TestStatisticDefinition::default(), 0, 20.0);
        let one = params.parameter_set(1.0, f64::INFINITY, false);
        let three = params.parameter_set(3.0, f64::INFINITY, false);
        assert!((one.quantile - 10.827_566).abs() < 1e-4);
        assert!((one.noncentrality_parameter - three.noncentrality_parameter).abs() < 1e-12);
        // a larger dimension must tolerate a larger probability value at equal power
        assert!(three.probability_value > one.probability_value);
        let power = power_of_test(three.quantile, 3.0, f64::INFINITY, three.noncentrality_parameter);
        assert!((power - 80.0).abs() < 1e-3);
    }

    #[test]
    fn sidak_local_level_shrinks_with_hypotheses() {
        let definition = TestStatisticDefinition {
            kind: TestStatisticType::Sidak,
            probability_value: 5.0,
            familywise: true,
            ..Default::default()
        };
        let mut params = TestStatisticParameters::new(definition, 10, 10.0);
        let local = params.parameter_set(1.0, f64::INFINITY, false);
        let expected = 100.0 * (1.0 - 0.95f64.powf(0.1));
        assert!((local.probability_value - expected).abs() < 1e-10);
        let global = params.parameter_set(10.0, f64::INFINITY, true);
        assert!((global.probability_value - 5.0).abs() < 1e-12);
        assert_eq!(params.parameter_sets().len(), 2);
    }

    #[test]
    fn degenerate_dimensions_never_reject() {
        assert!(quantile(0.0, f64::INFINITY, 0.1).is_infinite());
        assert!(quantile(2.0, 0.0, 0.1).is_infinite());
    }
}
