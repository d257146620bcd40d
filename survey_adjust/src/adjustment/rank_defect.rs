//! Datum defect of free networks and the datum conditions that remove it.

use std::collections::{BTreeMap, HashSet};

use nalgebra::{DMatrix, SymmetricEigen, Vector3};
use serde::{Deserialize, Serialize};

use crate::model::{Network, ObservationKind, ParameterType, PointId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefectType {
    #[default]
    NotSet,
    Fixed,
    Free,
}

/// Similarity and affine components a network datum can leave undetermined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatumComponent {
    TranslationX,
    TranslationY,
    TranslationZ,
    RotationX,
    RotationY,
    RotationZ,
    ShearX,
    ShearY,
    ShearZ,
    ScaleX,
    ScaleY,
    ScaleZ,
    ScaleXY,
    ScaleXYZ,
}

impl DatumComponent {
    pub const ALL: [DatumComponent; 14] = [
        Self::TranslationX,
        Self::TranslationY,
        Self::TranslationZ,
        Self::RotationX,
        Self::RotationY,
        Self::RotationZ,
        Self::ShearX,
        Self::ShearY,
        Self::ShearZ,
        Self::ScaleX,
        Self::ScaleY,
        Self::ScaleZ,
        Self::ScaleXY,
        Self::ScaleXYZ,
    ];

    /// Effect of an infinitesimal change of this component on a centroid-reduced position.
    fn coefficients(self, p: &Vector3<f64>) -> Vector3<f64> {
        let (x, y, z) = (p.x, p.y, p.z);
        match self {
            Self::TranslationX => Vector3::new(1.0, 0.0, 0.0),
            Self::TranslationY => Vector3::new(0.0, 1.0, 0.0),
            Self::TranslationZ => Vector3::new(0.0, 0.0, 1.0),
            Self::RotationX => Vector3::new(0.0, z, -y),
            Self::RotationY => Vector3::new(-z, 0.0, x),
            Self::RotationZ => Vector3::new(y, -x, 0.0),
            Self::ShearX => Vector3::new(0.0, z, y),
            Self::ShearY => Vector3::new(z, 0.0, x),
            Self::ShearZ => Vector3::new(y, x, 0.0),
            Self::ScaleX => Vector3::new(x, 0.0, 0.0),
            Self::ScaleY => Vector3::new(0.0, y, 0.0),
            Self::ScaleZ => Vector3::new(0.0, 0.0, z),
            Self::ScaleXY => Vector3::new(x, y, 0.0),
            Self::ScaleXYZ => Vector3::new(x, y, z),
        }
    }
}

/// State of every datum component; the defect is the number of free ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RankDefect {
    components: BTreeMap<DatumComponent, DefectType>,
    #[serde(skip)]
    user_defined: bool,
}

impl RankDefect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a defect supplied by the user; it replaces the detected one.
    pub fn user_defined(mut self) -> Self {
        self.user_defined = true;
        self
    }

    pub fn is_user_defined(&self) -> bool {
        self.user_defined
    }

    pub fn get(&self, component: DatumComponent) -> DefectType {
        self.components.get(&component).copied().unwrap_or_default()
    }

    /// Sets a component. Combined scales replace the per-axis scales they cover and vice versa.
    pub fn set(&mut self, component: DatumComponent, value: DefectType) {
        use DatumComponent::*;
        let covered: &[DatumComponent] = match component {
            ScaleXY => &[ScaleX, ScaleY],
            ScaleXYZ => &[ScaleX, ScaleY, ScaleZ, ScaleXY],
            ScaleX | ScaleY => &[ScaleXY, ScaleXYZ],
            ScaleZ => &[ScaleXYZ],
            _ => &[],
        };
        for c in covered {
            self.components.remove(c);
        }
        self.components.insert(component, value);
    }

    /// A fixed component never becomes free again.
    pub fn fix(&mut self, component: DatumComponent) {
        if self.get(component) != DefectType::Fixed {
            self.set(component, DefectType::Fixed);
        }
    }

    pub fn free(&mut self, component: DatumComponent) {
        if self.get(component) != DefectType::Fixed {
            self.set(component, DefectType::Free);
        }
    }

    pub fn defect(&self) -> usize {
        self.components
            .values()
            .filter(|v| **v == DefectType::Free)
            .count()
    }

    pub fn free_components(&self) -> Vec<DatumComponent> {
        DatumComponent::ALL
            .into_iter()
            .filter(|c| self.get(*c) == DefectType::Free)
            .collect()
    }

    /// Components with an explicit state, in canonical order.
    pub fn components(&self) -> impl Iterator<Item = (DatumComponent, DefectType)> + '_ {
        self.components.iter().map(|(c, v)| (*c, *v))
    }
}

/// Derives the datum defect of a free network from its datum points and observations.
pub(crate) fn detect(network: &Network, datum_points: &[PointId]) -> RankDefect {
    use DatumComponent::*;
    let mut defect = RankDefect::new();
    let (mut is3d, mut is2d, mut is1d) = (false, false, false);
    for id in datum_points {
        let dimension = network.point(*id).dimension;
        if dimension != 1 {
            defect.free(TranslationX);
            defect.free(TranslationY);
        }
        if dimension != 2 {
            defect.free(TranslationZ);
        }
        match dimension {
            3 => is3d = true,
            2 => is2d = true,
            _ => is1d = true,
        }
    }
    // spatial datum points carry heights and positions in one frame
    if is3d {
        is2d = false;
        is1d = false;
    }
    if is1d {
        defect.free(ScaleZ);
        defect.free(RotationX);
        defect.free(RotationY);
    }
    if is2d {
        defect.free(ScaleXY);
        defect.free(RotationZ);
    }
    if is3d {
        defect.free(ScaleXYZ);
        defect.free(RotationX);
        defect.free(RotationY);
        defect.free(RotationZ);
    }
    let height_scale = if is3d { ScaleXYZ } else { ScaleZ };
    let planar_scale = if is3d { ScaleXYZ } else { ScaleXY };

    let enabled = |group, kind| network.unknown_parameter(group, kind).is_some();
    let mut gnss_counts = [0usize; 3];
    let mut gnss_fixes: [HashSet<DatumComponent>; 3] = Default::default();
    let mut zenith_stations = 0usize;
    let mut leveling_count = 0usize;
    let mut leveling_points = HashSet::new();

    for obs in network.observations() {
        let group = network.group(obs.group);
        if group.len() <= network.number_of_unknown_parameters(obs.group) {
            continue;
        }
        let start = network.point(obs.start);
        let end = network.point(obs.end);
        match obs.kind {
            ObservationKind::Leveling => {
                if start.dimension == 3
                    && end.dimension == 3
                    && (!start.has_unknown_deflection() || !end.has_unknown_deflection())
                {
                    leveling_count += 1;
                    if !start.has_unknown_deflection() {
                        leveling_points.insert(obs.start);
                    }
                    if !end.has_unknown_deflection() {
                        leveling_points.insert(obs.end);
                    }
                }
                if !is3d {
                    defect.fix(RotationX);
                    defect.fix(RotationY);
                }
                if !enabled(obs.group, ParameterType::Scale) {
                    defect.fix(height_scale);
                }
            }
            ObservationKind::Direction => {
                if !enabled(obs.group, ParameterType::Orientation) {
                    defect.fix(RotationZ);
                }
            }
            ObservationKind::HorizontalDistance => {
                if !enabled(obs.group, ParameterType::Scale) {
                    defect.fix(planar_scale);
                }
            }
            ObservationKind::SlopeDistance => {
                if !enabled(obs.group, ParameterType::Scale) {
                    defect.fix(ScaleXYZ);
                }
            }
            ObservationKind::ZenithAngle => {
                if start.dimension == 3 && !start.has_unknown_deflection() {
                    zenith_stations += 1;
                }
            }
            kind => {
                let (slot, scale) = match kind {
                    ObservationKind::Gnss1D => (0, height_scale),
                    ObservationKind::Gnss2D(_) => (1, planar_scale),
                    _ => (2, ScaleXYZ),
                };
                gnss_counts[slot] += 1;
                if !enabled(obs.group, ParameterType::Scale) {
                    gnss_fixes[slot].insert(scale);
                }
                for (parameter, component) in [
                    (ParameterType::RotationX, RotationX),
                    (ParameterType::RotationY, RotationY),
                    (ParameterType::RotationZ, RotationZ),
                ] {
                    if kind.parameter_types().contains(&parameter) && !enabled(obs.group, parameter) {
                        gnss_fixes[slot].insert(component);
                    }
                }
            }
        }
    }

    for (slot, threshold) in [2usize, 1, 3].into_iter().enumerate() {
        if gnss_counts[slot] > threshold {
            let mut fixes: Vec<_> = gnss_fixes[slot].iter().copied().collect();
            fixes.sort();
            for component in fixes {
                defect.fix(component);
            }
        }
    }

    let tilt = zenith_stations + leveling_count.min(leveling_points.len());
    if tilt > 1 {
        defect.fix(RotationX);
        defect.fix(RotationY);
    } else if tilt == 1 {
        if let Some(c) = [RotationX, RotationY]
            .into_iter()
            .find(|c| defect.get(*c) == DefectType::Free)
        {
            defect.fix(c);
        }
    }

    defect
}

/// Networks held by reference or stochastic points carry no datum rows. Only the
/// scale is taken from the observations, as a diagnostic.
pub(crate) fn anchored(network: &Network, points: &[PointId]) -> RankDefect {
    use DatumComponent::*;
    let mut defect = detect(network, points);
    for c in [
        TranslationX,
        TranslationY,
        TranslationZ,
        RotationX,
        RotationY,
        RotationZ,
        ShearX,
        ShearY,
        ShearZ,
    ] {
        defect.fix(c);
    }
    defect
}

/// One normalized datum condition per free component over the columns of the datum points.
pub(crate) fn datum_rows(
    network: &Network,
    defect: &RankDefect,
    datum_points: &[(PointId, usize)],
) -> Vec<Vec<(usize, f64)>> {
    if datum_points.is_empty() {
        return Vec::new();
    }
    let centroid = datum_points
        .iter()
        .map(|(id, _)| network.point(*id).coordinates)
        .sum::<Vector3<f64>>()
        / datum_points.len() as f64;
    defect
        .free_components()
        .into_iter()
        .map(|component| {
            let mut row = Vec::new();
            for (id, column) in datum_points {
                let point = network.point(*id);
                let c = component.coefficients(&(point.coordinates - centroid));
                for (i, axis) in point.axes().iter().enumerate() {
                    row.push((column + i, c[*axis]));
                }
            }
            let norm = row.iter().map(|(_, v)| v * v).sum::<f64>().sqrt();
            if norm > 0.0 {
                for (_, v) in &mut row {
                    *v /= norm;
                }
            }
            row
        })
        .collect()
}

/// Number of eigenvalues of the unconstrained normal matrix that are numerically zero.
pub(crate) fn count_zero_eigenvalues(matrix: DMatrix<f64>, expected: usize) -> usize {
    let mut eigenvalues: Vec<f64> = SymmetricEigen::new(matrix)
        .eigenvalues
        .iter()
        .map(|v| v.abs())
        .collect();
    if eigenvalues.is_empty() {
        return 0;
    }
    eigenvalues.sort_by(f64::total_cmp);
    let threshold = if expected > 0 && expected <= eigenvalues.len() {
        10.0 * eigenvalues[..expected].iter().sum::<f64>() / expected as f64
    } else {
        f64::EPSILON.sqrt() * eigenvalues[eigenvalues.len() - 1]
    };
    eigenvalues.iter().filter(|v| **v <= threshold).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Observation, Point};

    #[test]
    fn combined_scale_clears_axis_scales() {
        let mut defect = RankDefect::new();
        defect.set(DatumComponent::ScaleX, DefectType::Free);
        defect.set(DatumComponent::ScaleY, DefectType::Free);
        assert_eq!(defect.defect(), 2);
        defect.set(DatumComponent::ScaleXY, DefectType::Free);
        assert_eq!(defect.defect(), 1);
        assert_eq!(defect.get(DatumComponent::ScaleX), DefectType::NotSet);
        defect.fix(DatumComponent::ScaleXY);
        defect.free(DatumComponent::ScaleXY);
        assert_eq!(defect.defect(), 0);
    }

    #[test]
    fn leveling_network_has_height_defect() {
        let mut network = Network::new();
        let a = network.add_point(Point::height("A", 100.0)).unwrap();
        let b = network.add_point(Point::height("B", 101.0)).unwrap();
        let g = network.add_group("leveling");
        network
            .add_observation(Observation::new(ObservationKind::Leveling, g, a, b, 1.0, 0.001))
            .unwrap();
        let defect = detect(&network, &[a, b]);
        assert_eq!(defect.free_components(), vec![DatumComponent::TranslationZ]);
    }

    #[test]
    fn planar_distance_network_lacks_translation_and_rotation() {
        let mut network = Network::new();
        let ids: Vec<_> = [(0.0, 0.0), (100.0, 0.0), (0.0, 100.0)]
            .iter()
            .enumerate()
            .map(|(i, (x, y))| network.add_point(Point::planar(format!("P{i}"), *x, *y)).unwrap())
            .collect();
        let g = network.add_group("distances");
        for (s, e) in [(0, 1), (1, 2), (2, 0)] {
            network
                .add_observation(Observation::new(
                    ObservationKind::HorizontalDistance,
                    g,
                    ids[s],
                    ids[e],
                    100.0,
                    0.001,
                ))
                .unwrap();
        }
        let defect = detect(&network, &ids);
        assert_eq!(defect.defect(), 3);
        assert_eq!(defect.get(DatumComponent::ScaleXY), DefectType::Fixed);

        let rows = datum_rows(&network, &defect, &[(ids[0], 0), (ids[1], 2), (ids[2], 4)]);
        assert_eq!(rows.len(), 3);
        for row in &rows {
            let norm: f64 = row.iter().map(|(_, v)| v * v).sum();
            assert!((norm - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn planar_and_height_datum_points_stay_separate() {
        let mut network = Network::new();
        let mut ids: Vec<_> = [(0.0, 0.0), (100.0, 0.0), (0.0, 100.0)]
            .iter()
            .enumerate()
            .map(|(i, (x, y))| network.add_point(Point::planar(format!("P{i}"), *x, *y)).unwrap())
            .collect();
        let h0 = network.add_point(Point::height("H0", 100.0)).unwrap();
        let h1 = network.add_point(Point::height("H1", 101.0)).unwrap();
        let distances = network.add_group("distances");
        for (s, e) in [(0, 1), (1, 2), (2, 0)] {
            network
                .add_observation(Observation::new(
                    ObservationKind::HorizontalDistance,
                    distances,
                    ids[s],
                    ids[e],
                    100.0,
                    0.001,
                ))
                .unwrap();
        }
        let leveling = network.add_group("leveling");
        network
            .add_observation(Observation::new(ObservationKind::Leveling, leveling, h0, h1, 1.0, 0.001))
            .unwrap();
        ids.extend([h0, h1]);

        let defect = detect(&network, &ids);
        assert_eq!(
            defect.free_components(),
            vec![
                DatumComponent::TranslationX,
                DatumComponent::TranslationY,
                DatumComponent::TranslationZ,
                DatumComponent::RotationZ,
            ]
        );
        assert_eq!(defect.get(DatumComponent::ScaleXY), DefectType::Fixed);
        assert_eq!(defect.get(DatumComponent::ScaleZ), DefectType::Fixed);
        assert_eq!(defect.get(DatumComponent::ScaleXYZ), DefectType::NotSet);
    }

    #[test]
    fn leveling_with_one_deflected_end_still_fixes_the_tilt() {
        use crate::model::{Deflection, DeflectionMode};
        let mut network = Network::new();
        let deflected = Deflection {
            mode: DeflectionMode::Unknown,
            ..Deflection::default()
        };
        let ids: Vec<_> = [(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)]
            .iter()
            .enumerate()
            .map(|(i, (x, y))| {
                let point = Point::spatial(format!("P{i}"), *x, *y, 10.0);
                let point = if i == 0 { point.with_deflection(deflected.clone()) } else { point };
                network.add_point(point).unwrap()
            })
            .collect();
        let g = network.add_group("leveling");
        for (s, e) in [(0, 1), (2, 3)] {
            network
                .add_observation(Observation::new(ObservationKind::Leveling, g, ids[s], ids[e], 0.0, 0.001))
                .unwrap();
        }

        let defect = detect(&network, &ids);
        assert_eq!(defect.get(DatumComponent::RotationX), DefectType::Fixed);
        assert_eq!(defect.get(DatumComponent::RotationY), DefectType::Fixed);
        assert_eq!(defect.get(DatumComponent::ScaleXYZ), DefectType::Fixed);
        assert_eq!(defect.defect(), 4);
    }

    #[test]
    fn eigenvalue_count_matches_defect() {
        let matrix = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![
            1.0e-14, 2.0e-14, 5.0, 7.0,
        ]));
        assert_eq!(count_zero_eigenvalues(matrix, 2), 2);
    }
}
