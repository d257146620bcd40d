//! Strain models relating the points of a reference epoch to a control epoch.
//!
//! Coordinates are reduced to the centroid of the reference-epoch points so that
//! the translation parameters describe the shift of that centroid.
//!
//! * 1D: `Z2 = tz + mz·Z1`
//! * 2D: `X2 = tx + a11·X1 - a12·Y1`, `Y2 = ty + a21·X1 + a22·Y1`
//! * 3D: `P2 = t + A·P1` with a general 3×3 matrix `A`

use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::model::point::axes_of;

/// Restrictions imposed on the strain parameters of a congruence group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestrictionType {
    FixedTranslationX,
    FixedTranslationY,
    FixedTranslationZ,
    FixedRotationX,
    FixedRotationY,
    FixedRotationZ,
    FixedShearX,
    FixedShearY,
    FixedShearZ,
    FixedScaleX,
    FixedScaleY,
    FixedScaleZ,
    IdentScalesXY,
    IdentScalesXZ,
    IdentScalesYZ,
}

const NAMES_1D: [&str; 2] = ["TRANSLATION_Z", "SCALE_Z"];
const NAMES_2D: [&str; 6] = ["TRANSLATION_X", "TRANSLATION_Y", "A11", "A12", "A21", "A22"];
const NAMES_3D: [&str; 12] = [
    "TRANSLATION_X",
    "TRANSLATION_Y",
    "TRANSLATION_Z",
    "A11",
    "A12",
    "A13",
    "A21",
    "A22",
    "A23",
    "A31",
    "A32",
    "A33",
];

pub fn parameter_names(dimension: usize) -> &'static [&'static str] {
    match dimension {
        1 => &NAMES_1D,
        2 => &NAMES_2D,
        _ => &NAMES_3D,
    }
}

pub fn number_of_parameters(dimension: usize) -> usize {
    parameter_names(dimension).len()
}

/// Parameter values of the identity transformation.
pub fn expectation(dimension: usize) -> DVector<f64> {
    match dimension {
        1 => DVector::from_vec(vec![0.0, 1.0]),
        2 => DVector::from_vec(vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0]),
        _ => {
            let mut v = DVector::zeros(12);
            v[3] = 1.0;
            v[7] = 1.0;
            v[11] = 1.0;
            v
        }
    }
}

/// One linearized condition `f(θ, P1) - P2[axis] = 0`.
#[derive(Debug, Clone)]
pub struct ConditionRow {
    pub axis: usize,
    /// `f(θ, P1)` in reduced coordinates.
    pub value: f64,
    /// Derivatives w.r.t. the start point coordinates `(axis, value)`.
    pub start: Vec<(usize, f64)>,
    /// Derivatives w.r.t. the strain parameters `(index, value)`.
    pub parameters: Vec<(usize, f64)>,
}

/// Conditions of one tie with reduced start coordinates `p1`.
pub fn conditions(dimension: usize, theta: &DVector<f64>, p1: &Vector3<f64>) -> Vec<ConditionRow> {
    match dimension {
        1 => vec![ConditionRow {
            axis: 2,
            value: theta[0] + theta[1] * p1.z,
            start: vec![(2, theta[1])],
            parameters: vec![(0, 1.0), (1, p1.z)],
        }],
        2 => {
            let (tx, ty, a11, a12, a21, a22) =
                (theta[0], theta[1], theta[2], theta[3], theta[4], theta[5]);
            vec![
                ConditionRow {
                    axis: 0,
                    value: tx + a11 * p1.x - a12 * p1.y,
                    start: vec![(0, a11), (1, -a12)],
                    parameters: vec![(0, 1.0), (2, p1.x), (3, -p1.y)],
                },
                ConditionRow {
                    axis: 1,
                    value: ty + a21 * p1.x + a22 * p1.y,
                    start: vec![(0, a21), (1, a22)],
                    parameters: vec![(1, 1.0), (4, p1.x), (5, p1.y)],
                },
            ]
        }
        _ => (0..3)
            .map(|i| {
                let row = |j: usize| theta[3 + 3 * i + j];
                ConditionRow {
                    axis: i,
                    value: theta[i] + (0..3).map(|j| row(j) * p1[j]).sum::<f64>(),
                    start: (0..3).map(|j| (j, row(j))).collect(),
                    parameters: std::iter::once((i, 1.0))
                        .chain((0..3).map(|j| (3 + 3 * i + j, p1[j])))
                        .collect(),
                }
            })
            .collect(),
    }
}

/// Value and gradient of a restriction, `None` if it does not apply to `dimension`.
pub fn restriction(
    dimension: usize,
    restriction: RestrictionType,
    theta: &DVector<f64>,
) -> Option<(f64, Vec<(usize, f64)>)> {
    use RestrictionType::*;
    match dimension {
        1 => match restriction {
            FixedTranslationZ => Some((theta[0], vec![(0, 1.0)])),
            FixedScaleZ => Some((theta[1] - 1.0, vec![(1, 1.0)])),
            _ => None,
        },
        2 => {
            let (a11, a12, a21, a22) = (theta[2], theta[3], theta[4], theta[5]);
            match restriction {
                FixedTranslationX => Some((theta[0], vec![(0, 1.0)])),
                FixedTranslationY => Some((theta[1], vec![(1, 1.0)])),
                FixedRotationZ => Some((a21, vec![(4, 1.0)])),
                FixedShearZ => Some((
                    -a11 * a12 + a21 * a22,
                    vec![(2, -a12), (3, -a11), (4, a22), (5, a21)],
                )),
                FixedScaleX => Some((
                    a11 * a11 + a21 * a21 - 1.0,
                    vec![(2, 2.0 * a11), (4, 2.0 * a21)],
                )),
                FixedScaleY => Some((
                    a12 * a12 + a22 * a22 - 1.0,
                    vec![(3, 2.0 * a12), (5, 2.0 * a22)],
                )),
                IdentScalesXY => Some((
                    a11 * a11 + a21 * a21 - a12 * a12 - a22 * a22,
                    vec![(2, 2.0 * a11), (3, -2.0 * a12), (4, 2.0 * a21), (5, -2.0 * a22)],
                )),
                _ => None,
            }
        }
        _ => {
            let idx = |i: usize, j: usize| 3 + 3 * i + j;
            let a = |i: usize, j: usize| theta[idx(i, j)];
            let norm2 = |j: usize| -> (f64, Vec<(usize, f64)>) {
                (
                    (0..3).map(|i| a(i, j) * a(i, j)).sum(),
                    (0..3).map(|i| (idx(i, j), 2.0 * a(i, j))).collect(),
                )
            };
            let dot = |j: usize, k: usize| -> (f64, Vec<(usize, f64)>) {
                (
                    (0..3).map(|i| a(i, j) * a(i, k)).sum(),
                    (0..3)
                        .flat_map(|i| [(idx(i, j), a(i, k)), (idx(i, k), a(i, j))])
                        .collect(),
                )
            };
            let difference = |(v1, g1): (f64, Vec<(usize, f64)>), (v2, g2): (f64, Vec<(usize, f64)>)| {
                let mut gradient = g1;
                gradient.extend(g2.into_iter().map(|(c, v)| (c, -v)));
                (v1 - v2, gradient)
            };
            let antisymmetric =
                |(i, j): (usize, usize)| (a(i, j) - a(j, i), vec![(idx(i, j), 1.0), (idx(j, i), -1.0)]);
            match restriction {
                FixedTranslationX => Some((theta[0], vec![(0, 1.0)])),
                FixedTranslationY => Some((theta[1], vec![(1, 1.0)])),
                FixedTranslationZ => Some((theta[2], vec![(2, 1.0)])),
                FixedScaleX | FixedScaleY | FixedScaleZ => {
                    let j = match restriction {
                        FixedScaleX => 0,
                        FixedScaleY => 1,
                        _ => 2,
                    };
                    let (v, g) = norm2(j);
                    Some((v - 1.0, g))
                }
                IdentScalesXY => Some(difference(norm2(0), norm2(1))),
                IdentScalesXZ => Some(difference(norm2(0), norm2(2))),
                IdentScalesYZ => Some(difference(norm2(1), norm2(2))),
                FixedShearX => Some(dot(1, 2)),
                FixedShearY => Some(dot(0, 2)),
                FixedShearZ => Some(dot(0, 1)),
                FixedRotationX => Some(antisymmetric((2, 1))),
                FixedRotationY => Some(antisymmetric((0, 2))),
                FixedRotationZ => Some(antisymmetric((1, 0))),
            }
        }
    }
}

/// Strain analysis of one congruence group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrainAnalysis {
    pub restrictions: Vec<RestrictionType>,
    #[serde(skip, default = "unset_values")]
    pub(crate) values: DVector<f64>,
    #[serde(skip)]
    pub(crate) centroid: Vector3<f64>,
    #[serde(skip)]
    pub(crate) active: bool,
    #[serde(default)]
    pub results: Vec<StrainParameterResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrainParameterResult {
    pub name: String,
    pub value: f64,
    pub expectation: f64,
    pub std: f64,
    pub gross_error: f64,
    pub minimal_detectable_bias: f64,
    pub test: crate::model::TestResult,
}

fn unset_values() -> DVector<f64> {
    DVector::zeros(0)
}

impl StrainAnalysis {
    pub fn new(dimension: usize, restrictions: Vec<RestrictionType>) -> Self {
        Self {
            restrictions,
            values: expectation(dimension),
            centroid: Vector3::zeros(),
            active: false,
            results: Vec::new(),
        }
    }

    /// The strain parameters entered the last adjustment as unknowns.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    /// Number of rows added to the normal equations for `ties` point pairs.
    pub(crate) fn number_of_rows(&self, dimension: usize, ties: usize) -> usize {
        ties * axes_of(dimension).len() + self.restrictions.len()
    }

    /// Enough ties and at least one unconstrained parameter.
    pub(crate) fn is_solvable(&self, dimension: usize, ties: usize) -> bool {
        let nou = number_of_parameters(dimension);
        let nor = self.restrictions.len();
        nor < nou && ties * axes_of(dimension).len() + nor >= nou
    }
}
