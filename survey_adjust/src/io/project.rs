//! JSON project files describing an observation network.
//!
//! Points and observations are referenced by name. Each point carries its role
//! in the adjustment; observation groups carry their observations, GNSS
//! baselines and additional parameters.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::adjustment::{CongruenceGroup, NetworkAdjustment, RestrictionType};
use crate::config::AdjustmentConfig;
use crate::error::{AdjustError, AdjustResult};
use crate::model::{
    Deflection, DeflectionMode, Network, Observation, ObservationKind, ParameterType, Point,
    PointId, PointRole, ProcessingType,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointDescription {
    pub name: String,
    pub role: PointRole,
    /// `[z]`, `[x, y]` or `[x, y, z]`.
    pub coordinates: Vec<f64>,
    #[serde(default)]
    pub std: Vec<f64>,
    #[serde(default)]
    pub deflection: Option<DeflectionDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeflectionDescription {
    pub mode: DeflectionMode,
    #[serde(default)]
    pub value: [f64; 2],
    #[serde(default)]
    pub std: [f64; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationDescription {
    pub kind: ObservationKind,
    pub start: String,
    pub end: String,
    pub value: f64,
    pub std: f64,
    #[serde(default)]
    pub instrument_height: f64,
    #[serde(default)]
    pub target_height: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineDescription {
    pub start: String,
    pub end: String,
    /// One (Z), two (X, Y) or three components.
    pub values: Vec<f64>,
    pub std: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDescription {
    pub kind: ParameterType,
    #[serde(default)]
    pub approx: Option<f64>,
    #[serde(default = "adjusted")]
    pub processing: ProcessingType,
    #[serde(default = "visible")]
    pub visible: bool,
}

fn adjusted() -> ProcessingType {
    ProcessingType::Adjusted
}

fn visible() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDescription {
    pub name: String,
    #[serde(default)]
    pub observations: Vec<ObservationDescription>,
    #[serde(default)]
    pub baselines: Vec<BaselineDescription>,
    #[serde(default)]
    pub parameters: Vec<ParameterDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CongruenceDescription {
    pub name: String,
    pub dimension: usize,
    /// Pairs of reference-epoch and control-epoch point names.
    pub ties: Vec<(String, String)>,
    /// Strain parameters are estimated when present.
    #[serde(default)]
    pub strain: Option<Vec<RestrictionType>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    pub points: Vec<PointDescription>,
    #[serde(default)]
    pub groups: Vec<GroupDescription>,
    #[serde(default)]
    pub congruence: Vec<CongruenceDescription>,
    /// Settings stored with the project; a separate configuration file takes precedence.
    #[serde(default)]
    pub config: Option<AdjustmentConfig>,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the network, registers points and parameters and returns the adjustment.
    pub fn into_adjustment(self, config: Option<AdjustmentConfig>) -> AdjustResult<NetworkAdjustment> {
        let mut network = Network::new();
        let mut roles = Vec::with_capacity(self.points.len());
        for description in &self.points {
            let id = network.add_point(point(description)?)?;
            roles.push((id, description.role));
        }

        let mut parameters = Vec::new();
        for group in &self.groups {
            let g = network.add_group(group.name.clone());
            for o in &group.observations {
                if o.kind.is_gnss() {
                    return Err(AdjustError::invalid(format!(
                        "GNSS observations of group `{}` must be given as baselines",
                        group.name
                    )));
                }
                let observation = Observation::new(
                    o.kind,
                    g,
                    lookup(&network, &o.start)?,
                    lookup(&network, &o.end)?,
                    o.value,
                    o.std,
                )
                .with_heights(o.instrument_height, o.target_height);
                network.add_observation(observation)?;
            }
            for b in &group.baselines {
                let (start, end) = (lookup(&network, &b.start)?, lookup(&network, &b.end)?);
                network.add_gnss_baseline(g, start, end, &b.values, &b.std)?;
            }
            for p in &group.parameters {
                let approx = p.approx.unwrap_or_else(|| p.kind.expectation());
                let id = network.add_parameter(g, p.kind, approx)?;
                network.parameter_mut(id).visible = p.visible;
                parameters.push((id, p.processing));
            }
        }

        let mut congruence = Vec::with_capacity(self.congruence.len());
        for c in &self.congruence {
            let mut group = CongruenceGroup::new(c.name.clone(), c.dimension);
            for (start, end) in &c.ties {
                group.add_tie(lookup(&network, start)?, lookup(&network, end)?);
            }
            if let Some(restrictions) = &c.strain {
                group = group.with_strain(restrictions.clone());
            }
            congruence.push(group);
        }

        let config = config.or(self.config).unwrap_or_default();
        let mut adjustment = NetworkAdjustment::new(network, config);
        for (id, role) in roles {
            match role {
                PointRole::Reference => adjustment.add_reference_point(id)?,
                PointRole::Stochastic => adjustment.add_stochastic_point(id)?,
                PointRole::Datum => adjustment.add_datum_point(id)?,
                PointRole::New => adjustment.add_new_point(id)?,
            }
        }
        for (id, processing) in parameters {
            if processing != ProcessingType::Fixed {
                adjustment.add_additional_parameter(id, processing)?;
            }
        }
        for group in congruence {
            adjustment.add_congruence_group(group)?;
        }
        Ok(adjustment)
    }
}

fn lookup(network: &Network, name: &str) -> AdjustResult<PointId> {
    network.point_id(name).ok_or_else(|| AdjustError::NotFound {
        kind: "point",
        name: name.to_string(),
    })
}

fn point(description: &PointDescription) -> AdjustResult<Point> {
    let c = &description.coordinates;
    let mut point = match c.len() {
        1 => Point::height(description.name.clone(), c[0]),
        2 => Point::planar(description.name.clone(), c[0], c[1]),
        3 => Point::spatial(description.name.clone(), c[0], c[1], c[2]),
        n => {
            return Err(AdjustError::invalid(format!(
                "point `{}` has {n} coordinates",
                description.name
            )))
        }
    };
    if !description.std.is_empty() {
        if description.std.len() != c.len() {
            return Err(AdjustError::invalid(format!(
                "point `{}` needs one standard deviation per coordinate",
                description.name
            )));
        }
        let mut std = Vector3::zeros();
        for (axis, value) in point.axes().iter().zip(&description.std) {
            std[*axis] = *value;
        }
        point = point.with_std(std);
    }
    if let Some(d) = &description.deflection {
        let value = Vector2::new(d.value[0], d.value[1]);
        point = point.with_deflection(Deflection {
            mode: d.mode,
            approx: value,
            value,
            std_apriori: Vector2::new(d.std[0], d.std[1]),
            ..Default::default()
        });
    }
    Ok(point)
}

pub fn read_project_json(path: &str) -> AdjustResult<Project> {
    let contents = crate::io::read_to_string(path)?;
    let project: Project = serde_json::from_str(&contents)?;
    Ok(project)
}

pub fn write_project_json(path: &str, project: &Project) -> AdjustResult<()> {
    let json = serde_json::to_string_pretty(project)?;
    crate::io::write_string(path, &json)?;
    Ok(())
}
