//! Observation types and their functional model.
//!
//! Every observation is evaluated at the current state of its points and group
//! parameters and returns the calculated value together with the partial
//! derivatives the normal equations are built from.

use std::f64::consts::{PI, TAU};

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::parameter::ParameterType;
use super::point::{Point, TestResult};
use super::{GroupId, PointId};

/// Mean earth radius used for the refraction correction of zenith angles.
pub const EARTH_RADIUS: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GnssComponent {
    X,
    Y,
    Z,
}

impl GnssComponent {
    fn index(self) -> usize {
        match self {
            GnssComponent::X => 0,
            GnssComponent::Y => 1,
            GnssComponent::Z => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObservationKind {
    Leveling,
    Direction,
    HorizontalDistance,
    SlopeDistance,
    ZenithAngle,
    Gnss1D,
    Gnss2D(GnssComponent),
    Gnss3D(GnssComponent),
}

impl ObservationKind {
    pub fn is_gnss(self) -> bool {
        matches!(self, Self::Gnss1D | Self::Gnss2D(_) | Self::Gnss3D(_))
    }

    /// Directions and zenith angles.
    pub fn is_angle(self) -> bool {
        matches!(self, Self::Direction | Self::ZenithAngle)
    }

    /// Group parameters that enter the functional model of this type.
    pub fn parameter_types(self) -> &'static [ParameterType] {
        use ParameterType::*;
        match self {
            Self::Leveling => &[Scale],
            Self::Direction => &[Orientation],
            Self::HorizontalDistance | Self::SlopeDistance => &[Scale, ZeroPointOffset],
            Self::ZenithAngle => &[RefractionIndex],
            Self::Gnss1D => &[Scale, RotationX, RotationY],
            Self::Gnss2D(_) => &[Scale, RotationZ],
            Self::Gnss3D(_) => &[Scale, RotationX, RotationY, RotationZ],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationResult {
    pub calculated: f64,
    /// Calculated minus observed value.
    pub residual: f64,
    pub redundancy: f64,
    pub omega: f64,
    pub std: f64,
    pub gross_error: f64,
    pub minimal_detectable_bias: f64,
    /// Effect of the gross error on the point positions.
    pub influence_on_position: f64,
    /// Effect of the gross error on the network distortion.
    pub influence_on_network_distortion: f64,
    pub test: TestResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub kind: ObservationKind,
    pub start: PointId,
    pub end: PointId,
    pub instrument_height: f64,
    pub target_height: f64,
    pub value: f64,
    pub std_apriori: f64,
    pub group: GroupId,
    #[serde(skip)]
    pub(crate) baseline: Option<usize>,
    #[serde(skip)]
    pub(crate) adapted_std: Option<f64>,
    #[serde(default)]
    pub result: ObservationResult,
}

impl Observation {
    pub fn new(
        kind: ObservationKind,
        group: GroupId,
        start: PointId,
        end: PointId,
        value: f64,
        std_apriori: f64,
    ) -> Self {
        Self {
            kind,
            start,
            end,
            instrument_height: 0.0,
            target_height: 0.0,
            value,
            std_apriori,
            group,
            baseline: None,
            adapted_std: None,
            result: ObservationResult::default(),
        }
    }

    pub fn with_heights(mut self, instrument_height: f64, target_height: f64) -> Self {
        self.instrument_height = instrument_height;
        self.target_height = target_height;
        self
    }

    /// Standard deviation currently used for weighting (may be inflated by the L1 step).
    pub fn std_used(&self) -> f64 {
        self.adapted_std.unwrap_or(self.std_apriori)
    }

    pub fn baseline(&self) -> Option<usize> {
        self.baseline
    }

    /// Observed minus calculated value. Directions are wrapped to (-π, π] and
    /// zenith angles measured in face two are reduced to face one.
    pub fn misclosure(&self, observed: f64, calculated: f64) -> f64 {
        match self.kind {
            ObservationKind::Direction => wrap_angle(observed - calculated),
            ObservationKind::ZenithAngle => {
                let face_two = TAU - observed;
                if (face_two - calculated).abs() < (observed - calculated).abs() {
                    face_two - calculated
                } else {
                    observed - calculated
                }
            }
            _ => observed - calculated,
        }
    }

    pub(crate) fn evaluate(&self, start: &Point, end: &Point, values: &GroupValues) -> Linearization {
        let ih = self.instrument_height;
        let th = self.target_height;
        match self.kind {
            ObservationKind::Leveling => leveling(start, end, ih, th, values),
            ObservationKind::Gnss1D => gnss(start, end, ih, th, values, GnssComponent::Z, values.rotation),
            ObservationKind::Gnss2D(c) => {
                let rotation = Vector3::new(0.0, 0.0, values.rotation.z);
                gnss(start, end, ih, th, values, c, rotation)
            }
            ObservationKind::Gnss3D(c) => gnss(start, end, ih, th, values, c, values.rotation),
            kind => terrestrial(kind, start, end, ih, th, values),
        }
    }
}

fn wrap_angle(mut a: f64) -> f64 {
    a %= TAU;
    if a > PI {
        a -= TAU;
    } else if a <= -PI {
        a += TAU;
    }
    a
}

/// Current values of the group parameters; missing parameters keep their neutral value.
#[derive(Debug, Clone, Copy)]
pub struct GroupValues {
    pub orientation: f64,
    pub scale: f64,
    pub zero_point_offset: f64,
    pub refraction: f64,
    pub rotation: Vector3<f64>,
}

impl Default for GroupValues {
    fn default() -> Self {
        Self {
            orientation: 0.0,
            scale: 1.0,
            zero_point_offset: 0.0,
            refraction: 0.0,
            rotation: Vector3::zeros(),
        }
    }
}

impl GroupValues {
    pub(crate) fn set(&mut self, kind: ParameterType, value: f64) {
        match kind {
            ParameterType::Orientation => self.orientation = value,
            ParameterType::Scale => self.scale = value,
            ParameterType::ZeroPointOffset => self.zero_point_offset = value,
            ParameterType::RefractionIndex => self.refraction = value,
            ParameterType::RotationX => self.rotation.x = value,
            ParameterType::RotationY => self.rotation.y = value,
            ParameterType::RotationZ => self.rotation.z = value,
        }
    }
}

/// Calculated value and partial derivatives of one observation.
#[derive(Debug, Clone, Default)]
pub struct Linearization {
    pub value: f64,
    pub start: Vector3<f64>,
    pub end: Vector3<f64>,
    pub start_deflection: Vector2<f64>,
    pub end_deflection: Vector2<f64>,
    pub orientation: f64,
    pub scale: f64,
    pub zero_point_offset: f64,
    pub refraction: f64,
    pub rotation: Vector3<f64>,
    /// Lever arm converting an angular error into a position error.
    pub distance: f64,
}

impl Linearization {
    pub fn parameter(&self, kind: ParameterType) -> f64 {
        match kind {
            ParameterType::Orientation => self.orientation,
            ParameterType::Scale => self.scale,
            ParameterType::ZeroPointOffset => self.zero_point_offset,
            ParameterType::RefractionIndex => self.refraction,
            ParameterType::RotationX => self.rotation.x,
            ParameterType::RotationY => self.rotation.y,
            ParameterType::RotationZ => self.rotation.z,
        }
    }
}

/// Rotation into the local horizon of a station and its derivatives w.r.t. both components.
#[rustfmt::skip]
fn deflection_rotation(d: &Vector2<f64>) -> (Matrix3<f64>, Matrix3<f64>, Matrix3<f64>) {
    let (sx, cx) = d.x.sin_cos();
    let (sy, cy) = d.y.sin_cos();
    let r = Matrix3::new(
        cy, 0.0, sy,
        sx * sy, cx, -sx * cy,
        -cx * sy, sx, cx * cy,
    );
    let dx = Matrix3::new(
        0.0, 0.0, 0.0,
        cx * sy, -sx, -cx * cy,
        sx * sy, cx, -sx * cy,
    );
    let dy = Matrix3::new(
        -sy, 0.0, cy,
        sx * cy, 0.0, sx * sy,
        -cx * cy, 0.0, -cx * sy,
    );
    (r, dx, dy)
}

/// Rotation of a GNSS baseline and its derivatives w.r.t. the three angles.
#[rustfmt::skip]
fn baseline_rotation(r: &Vector3<f64>) -> [Matrix3<f64>; 4] {
    let (sx, cx) = r.x.sin_cos();
    let (sy, cy) = r.y.sin_cos();
    let (sz, cz) = r.z.sin_cos();
    [
        Matrix3::new(
            cy * cz, cx * sz + sx * sy * cz, sx * sz - cx * sy * cz,
            -cy * sz, cx * cz - sx * sy * sz, sx * cz + cx * sy * sz,
            sy, -sx * cy, cx * cy,
        ),
        Matrix3::new(
            0.0, -sx * sz + cx * sy * cz, cx * sz + sx * sy * cz,
            0.0, -sx * cz - cx * sy * sz, cx * cz - sx * sy * sz,
            0.0, -cx * cy, -sx * cy,
        ),
        Matrix3::new(
            -sy * cz, sx * cy * cz, -cx * cy * cz,
            sy * sz, -sx * cy * sz, cx * cy * sz,
            cy, sx * sy, -cx * sy,
        ),
        Matrix3::new(
            -cy * sz, cx * cz - sx * sy * sz, sx * cz + cx * sy * sz,
            -cy * cz, -cx * sz - sx * sy * cz, -sx * sz + cx * sy * cz,
            0.0, 0.0, 0.0,
        ),
    ]
}

fn terrestrial(
    kind: ObservationKind,
    start: &Point,
    end: &Point,
    ih: f64,
    th: f64,
    values: &GroupValues,
) -> Linearization {
    let (rs, rs_dx, rs_dy) = deflection_rotation(&start.deflection.value);
    let (re, re_dx, re_dy) = deflection_rotation(&end.deflection.value);
    let up = Vector3::z();
    let target = end.coordinates - start.coordinates + th * re.row(2).transpose();
    let local = rs * target - ih * up;
    let (u, v, w) = (local.x, local.y, local.z);
    let horizontal2 = u * u + v * v;
    let horizontal = horizontal2.sqrt();
    let slope = local.norm();

    let mut lin = Linearization::default();
    let gradient = match kind {
        ObservationKind::Direction => {
            lin.value = (v.atan2(u) - values.orientation).rem_euclid(TAU);
            lin.orientation = -1.0;
            lin.distance = horizontal;
            Vector3::new(-v / horizontal2, u / horizontal2, 0.0)
        }
        ObservationKind::HorizontalDistance => {
            let m = values.scale;
            lin.value = (horizontal - values.zero_point_offset) / m;
            lin.zero_point_offset = -1.0 / m;
            lin.scale = -(horizontal - values.zero_point_offset) / (m * m);
            lin.distance = 1.0;
            Vector3::new(u / horizontal, v / horizontal, 0.0) / m
        }
        ObservationKind::SlopeDistance => {
            let m = values.scale;
            lin.value = (slope - values.zero_point_offset) / m;
            lin.zero_point_offset = -1.0 / m;
            lin.scale = -(slope - values.zero_point_offset) / (m * m);
            lin.distance = 1.0;
            local / (slope * m)
        }
        _ => {
            let k = values.refraction;
            let s2 = slope * slope;
            let bending = k / (2.0 * EARTH_RADIUS);
            lin.value = horizontal.atan2(w) - bending * horizontal;
            lin.refraction = -horizontal / (2.0 * EARTH_RADIUS);
            lin.distance = slope;
            Vector3::new(
                u * w / (horizontal * s2) - bending * u / horizontal,
                v * w / (horizontal * s2) - bending * v / horizontal,
                -horizontal / s2,
            )
        }
    };

    lin.end = rs.transpose() * gradient;
    lin.start = -lin.end;
    lin.start_deflection = Vector2::new(
        gradient.dot(&(rs_dx * target)),
        gradient.dot(&(rs_dy * target)),
    );
    lin.end_deflection = Vector2::new(
        th * gradient.dot(&(rs * re_dx.row(2).transpose())),
        th * gradient.dot(&(rs * re_dy.row(2).transpose())),
    );
    lin
}

fn leveling(start: &Point, end: &Point, ih: f64, th: f64, values: &GroupValues) -> Linearization {
    let (rs, rs_dx, rs_dy) = deflection_rotation(&start.deflection.value);
    let (re, re_dx, re_dy) = deflection_rotation(&end.deflection.value);
    let ps = start.coordinates;
    let pe = end.coordinates;
    let ws = rs.row(2).transpose().dot(&ps) + ih;
    let we = re.row(2).transpose().dot(&pe) + th;
    let m = values.scale;
    Linearization {
        value: (we - ws) / m,
        start: -rs.row(2).transpose() / m,
        end: re.row(2).transpose() / m,
        start_deflection: -Vector2::new(
            rs_dx.row(2).transpose().dot(&ps),
            rs_dy.row(2).transpose().dot(&ps),
        ) / m,
        end_deflection: Vector2::new(
            re_dx.row(2).transpose().dot(&pe),
            re_dy.row(2).transpose().dot(&pe),
        ) / m,
        scale: -(we - ws) / (m * m),
        distance: 1.0,
        ..Default::default()
    }
}

fn gnss(
    start: &Point,
    end: &Point,
    ih: f64,
    th: f64,
    values: &GroupValues,
    component: GnssComponent,
    rotation: Vector3<f64>,
) -> Linearization {
    let c = component.index();
    let [r, dx, dy, dz] = baseline_rotation(&rotation);
    let baseline = end.coordinates - start.coordinates + Vector3::z() * (th - ih);
    let m = values.scale;
    let row = r.row(c).transpose();
    Linearization {
        value: m * row.dot(&baseline),
        start: -m * row,
        end: m * row,
        scale: row.dot(&baseline),
        rotation: Vector3::new(
            m * dx.row(c).transpose().dot(&baseline),
            m * dy.row(c).transpose().dot(&baseline),
            m * dz.row(c).transpose().dot(&baseline),
        ),
        distance: 1.0,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupId, PointId};

    fn numeric_gradient(
        obs: &Observation,
        start: &Point,
        end: &Point,
        values: &GroupValues,
        axis: usize,
    ) -> f64 {
        let h = 1.0e-5;
        let mut plus = end.clone();
        plus.coordinates[axis] += h;
        let mut minus = end.clone();
        minus.coordinates[axis] -= h;
        let fp = obs.evaluate(start, &plus, values).value;
        let fm = obs.evaluate(start, &minus, values).value;
        obs.misclosure(fp, fm) / (2.0 * h)
    }

    #[test]
    fn partial_derivatives_match_finite_differences() {
        let mut start = Point::spatial("S", 10.0, 20.0, 5.0);
        start.deflection.value = Vector2::new(2.0e-5, -3.0e-5);
        let mut end = Point::spatial("E", 130.0, 95.0, 12.0);
        end.deflection.value = Vector2::new(-1.0e-5, 4.0e-5);
        let mut values = GroupValues::default();
        values.orientation = 0.3;
        values.scale = 1.00002;
        values.refraction = 0.13;
        let kinds = [
            ObservationKind::Direction,
            ObservationKind::HorizontalDistance,
            ObservationKind::SlopeDistance,
            ObservationKind::ZenithAngle,
            ObservationKind::Leveling,
            ObservationKind::Gnss3D(GnssComponent::Y),
        ];
        for kind in kinds {
            let obs = Observation::new(kind, GroupId(0), PointId(0), PointId(1), 0.0, 1.0)
                .with_heights(1.5, 1.7);
            let lin = obs.evaluate(&start, &end, &values);
            for axis in 0..3 {
                let numeric = numeric_gradient(&obs, &start, &end, &values, axis);
                assert!(
                    (numeric - lin.end[axis]).abs() < 1e-6,
                    "{kind:?} axis {axis}: {numeric} vs {}",
                    lin.end[axis]
                );
                assert!((lin.start[axis] + lin.end[axis]).abs() < 1e-12 || kind == ObservationKind::Leveling);
            }
        }
    }

    #[test]
    fn zenith_angle_in_face_two_is_reduced() {
        let obs = Observation::new(ObservationKind::ZenithAngle, GroupId(0), PointId(0), PointId(1), 0.0, 1.0);
        let calculated = 1.5;
        let misclosure = obs.misclosure(TAU - 1.5001, calculated);
        assert!((misclosure - 1.0e-4).abs() < 1e-9);
    }

    #[test]
    fn direction_misclosure_wraps() {
        let obs = Observation::new(ObservationKind::Direction, GroupId(0), PointId(0), PointId(1), 0.0, 1.0);
        let misclosure = obs.misclosure(0.0001, TAU - 0.0001);
        assert!((misclosure - 0.0002).abs() < 1e-12);
    }
}
