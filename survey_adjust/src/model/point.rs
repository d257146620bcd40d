use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::ObservationId;

/// Role of a point inside the adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PointRole {
    /// Fixed coordinates, not estimated.
    Reference,
    /// Estimated, with the approximate coordinates as pseudo-observations.
    Stochastic,
    /// Estimated and part of the datum of a free network.
    Datum,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeflectionMode {
    #[default]
    Fixed,
    Stochastic,
    Unknown,
}

/// Vertical deflection at a point, components as rotations about X and Y (radian).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deflection {
    pub mode: DeflectionMode,
    pub approx: Vector2<f64>,
    pub value: Vector2<f64>,
    pub std_apriori: Vector2<f64>,
    #[serde(skip)]
    pub(crate) adapted_std: Option<Vector2<f64>>,
    #[serde(default)]
    pub result: DeflectionResult,
}

impl Default for Deflection {
    fn default() -> Self {
        Self {
            mode: DeflectionMode::Fixed,
            approx: Vector2::zeros(),
            value: Vector2::zeros(),
            std_apriori: Vector2::zeros(),
            adapted_std: None,
            result: DeflectionResult::default(),
        }
    }
}

impl Deflection {
    pub fn is_estimated(&self) -> bool {
        self.mode != DeflectionMode::Fixed
    }

    /// Standard deviation currently used to weight the pseudo-observations.
    pub fn std_used(&self) -> Vector2<f64> {
        self.adapted_std.unwrap_or(self.std_apriori)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeflectionResult {
    pub std: Vector2<f64>,
    pub redundancy: Vector2<f64>,
    pub gross_error: Vector2<f64>,
    pub minimal_detectable_bias: Vector2<f64>,
    pub omega: f64,
    pub test: TestResult,
}

/// Outcome of a hypothesis test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub t_prio: f64,
    pub t_post: f64,
    pub p_prio: f64,
    pub p_post: f64,
    pub significant: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceRegion {
    /// Semi-axes in decreasing order.
    pub semi_axes: Vec<f64>,
    /// Orientation of the major axis in the XY plane (radian), 2D and 3D points only.
    pub angle: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointResult {
    pub std: Vector3<f64>,
    pub redundancy: Vector3<f64>,
    pub residual: Vector3<f64>,
    pub gross_error: Vector3<f64>,
    pub minimal_detectable_bias: Vector3<f64>,
    pub omega: f64,
    pub test: Option<TestResult>,
    pub confidence_region: ConfidenceRegion,
    pub first_principal_component: Vector3<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    pub name: String,
    /// 1 (height), 2 (position) or 3.
    pub dimension: usize,
    /// Approximate coordinates; the pseudo-observations of stochastic points.
    pub approx: Vector3<f64>,
    pub coordinates: Vector3<f64>,
    pub std_apriori: Vector3<f64>,
    #[serde(default)]
    pub deflection: Deflection,
    #[serde(skip)]
    pub(crate) role: Option<PointRole>,
    #[serde(skip)]
    pub(crate) observations: Vec<ObservationId>,
    #[serde(skip)]
    pub(crate) adapted_std: Option<Vector3<f64>>,
    #[serde(default)]
    pub result: PointResult,
}

impl Point {
    pub fn new(name: impl Into<String>, dimension: usize, approx: Vector3<f64>) -> Self {
        Self {
            name: name.into(),
            dimension,
            approx,
            coordinates: approx,
            std_apriori: Vector3::zeros(),
            deflection: Deflection::default(),
            role: None,
            observations: Vec::new(),
            adapted_std: None,
            result: PointResult::default(),
        }
    }

    pub fn height(name: impl Into<String>, z: f64) -> Self {
        Self::new(name, 1, Vector3::new(0.0, 0.0, z))
    }

    pub fn planar(name: impl Into<String>, x: f64, y: f64) -> Self {
        Self::new(name, 2, Vector3::new(x, y, 0.0))
    }

    pub fn spatial(name: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self::new(name, 3, Vector3::new(x, y, z))
    }

    pub fn with_std(mut self, std: Vector3<f64>) -> Self {
        self.std_apriori = std;
        self
    }

    pub fn with_deflection(mut self, deflection: Deflection) -> Self {
        self.deflection = deflection;
        self
    }

    pub fn role(&self) -> Option<PointRole> {
        self.role
    }

    /// Coordinate axes carried by a point of this dimension.
    pub fn axes(&self) -> &'static [usize] {
        axes_of(self.dimension)
    }

    pub fn observations(&self) -> &[ObservationId] {
        &self.observations
    }

    /// Coordinates and deflections are estimated.
    pub fn is_unknown(&self) -> bool {
        matches!(
            self.role,
            Some(PointRole::Stochastic | PointRole::Datum | PointRole::New)
        )
    }

    pub fn has_unknown_deflection(&self) -> bool {
        self.deflection.mode == DeflectionMode::Unknown
    }

    pub fn std_used(&self) -> Vector3<f64> {
        self.adapted_std.unwrap_or(self.std_apriori)
    }

    pub(crate) fn reset(&mut self) {
        self.coordinates = self.approx;
        self.deflection.value = self.deflection.approx;
    }
}

pub(crate) fn axes_of(dimension: usize) -> &'static [usize] {
    match dimension {
        1 => &[2],
        2 => &[0, 1],
        _ => &[0, 1, 2],
    }
}
