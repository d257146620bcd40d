//! Export of adjustment results.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::adjustment::{
    CongruenceGroup, EstimationStateType, NetworkAdjustment, RankDefect, VarianceComponent,
};
use crate::config::EstimationType;
use crate::error::{AdjustError, AdjustResult};
use crate::model::{
    ObservationKind, ObservationResult, ParameterResult, ParameterType, Point, PointId,
    ProcessingType,
};
use crate::statistic::TestStatisticParameterSet;

/// Receives the results once after the statistics of a run are complete.
pub trait ResultWriter {
    fn write(&mut self, report: &AdjustmentReport) -> AdjustResult<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ObservationReport {
    pub kind: ObservationKind,
    pub group: String,
    pub start: String,
    pub end: String,
    pub value: f64,
    pub std_apriori: f64,
    pub result: ObservationResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterReport {
    pub kind: ParameterType,
    pub group: String,
    pub approx: f64,
    pub value: f64,
    pub processing: ProcessingType,
    pub result: ParameterResult,
}

/// Snapshot of the adjustment handed to a [`ResultWriter`].
#[derive(Debug, Clone, Serialize)]
pub struct AdjustmentReport {
    pub created: DateTime<Utc>,
    pub estimation_type: EstimationType,
    pub state: EstimationStateType,
    pub iterations: usize,
    pub degrees_of_freedom: f64,
    pub omega: f64,
    pub variance_factor: f64,
    pub rank_defect: RankDefect,
    pub points: Vec<Point>,
    pub observations: Vec<ObservationReport>,
    pub parameters: Vec<ParameterReport>,
    pub variance_components: Vec<VarianceComponent>,
    pub congruence: Vec<CongruenceGroup>,
    pub test_statistics: Vec<TestStatisticParameterSet>,
}

impl NetworkAdjustment {
    pub fn report(&self) -> AdjustmentReport {
        let network = &self.network;
        let name = |id: PointId| network.point(id).name.clone();
        AdjustmentReport {
            created: Utc::now(),
            estimation_type: self.config.estimation_type,
            state: self.state,
            iterations: self.iterations,
            degrees_of_freedom: self.degrees_of_freedom,
            omega: self.omega,
            variance_factor: self.variance_factor,
            rank_defect: self.rank_defect.clone(),
            points: network
                .points()
                .iter()
                .filter(|p| p.role().is_some())
                .cloned()
                .collect(),
            observations: network
                .observations()
                .iter()
                .map(|o| ObservationReport {
                    kind: o.kind,
                    group: network.group(o.group).name.clone(),
                    start: name(o.start),
                    end: name(o.end),
                    value: o.value,
                    std_apriori: o.std_apriori,
                    result: o.result.clone(),
                })
                .collect(),
            parameters: network
                .parameters()
                .iter()
                .filter(|p| p.visible)
                .map(|p| ParameterReport {
                    kind: p.kind,
                    group: network.group(p.group).name.clone(),
                    approx: p.approx,
                    value: p.value,
                    processing: p.processing,
                    result: p.result.clone(),
                })
                .collect(),
            variance_components: self.variance_components.clone(),
            congruence: self.congruence.clone(),
            test_statistics: self
                .test_parameters
                .as_ref()
                .map(|t| t.parameter_sets())
                .unwrap_or_default(),
        }
    }
}

/// Writes the report as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonResultWriter {
    path: String,
}

impl JsonResultWriter {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl ResultWriter for JsonResultWriter {
    fn write(&mut self, report: &AdjustmentReport) -> AdjustResult<()> {
        let json = serde_json::to_string_pretty(report)?;
        crate::io::write_string(&self.path, &json)
            .map_err(|e| AdjustError::Export(format!("{}: {e}", self.path)))
    }
}
