use serde::{Deserialize, Serialize};

use super::point::TestResult;
use super::{GroupId, ObservationId, ParameterId};

/// Nuisance parameters shared by the observations of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterType {
    Orientation,
    Scale,
    ZeroPointOffset,
    RefractionIndex,
    RotationX,
    RotationY,
    RotationZ,
}

impl ParameterType {
    /// Value of the parameter if it had no effect.
    pub fn expectation(self) -> f64 {
        match self {
            ParameterType::Scale => 1.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingType {
    /// Held at its approximate value.
    #[default]
    Fixed,
    /// Estimated as unknown.
    Adjusted,
    /// Held at its approximate value during the adjustment, estimated afterwards from the residuals of its group.
    Postprocessing,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterResult {
    pub std: f64,
    pub gross_error: f64,
    pub minimal_detectable_bias: f64,
    pub test: TestResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditionalParameter {
    pub kind: ParameterType,
    pub group: GroupId,
    pub approx: f64,
    pub value: f64,
    pub processing: ProcessingType,
    pub visible: bool,
    #[serde(default)]
    pub result: ParameterResult,
}

impl AdditionalParameter {
    pub fn is_unknown(&self) -> bool {
        self.processing == ProcessingType::Adjusted
    }

    pub fn expectation(&self) -> f64 {
        self.kind.expectation()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationGroup {
    pub name: String,
    #[serde(skip)]
    pub(crate) observations: Vec<ObservationId>,
    #[serde(skip)]
    pub(crate) parameters: Vec<ParameterId>,
}

impl ObservationGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            observations: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn observations(&self) -> &[ObservationId] {
        &self.observations
    }

    pub fn parameters(&self) -> &[ParameterId] {
        &self.parameters
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}
