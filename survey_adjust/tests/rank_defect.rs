use survey_adjust::adjustment::{DatumComponent, DefectType};
use survey_adjust::model::{Deflection, DeflectionMode, ParameterType, ProcessingType};
use survey_adjust::{
    AdjustmentConfig, EstimationStateType, NetworkAdjustment, Network, Observation,
    ObservationKind, Point, PointId, RankDefect,
};

const CORNERS: [(f64, f64, f64); 4] = [
    (0.0, 0.0, 10.0),
    (100.0, 0.0, 12.0),
    (100.0, 100.0, 9.0),
    (0.0, 100.0, 11.0),
];

fn spatial_points(network: &mut Network) -> Vec<PointId> {
    CORNERS
        .iter()
        .enumerate()
        .map(|(i, (x, y, z))| network.add_point(Point::spatial(format!("P{i}"), *x, *y, *z)).unwrap())
        .collect()
}

fn free(network: Network, ids: &[PointId], config: AdjustmentConfig) -> NetworkAdjustment {
    let mut adjustment = NetworkAdjustment::new(network, config);
    for id in ids {
        adjustment.add_datum_point(*id).unwrap();
    }
    adjustment
}

#[test]
fn slope_distances_leave_six_components() {
    let mut network = Network::new();
    let ids = spatial_points(&mut network);
    let g = network.add_group("distances");
    for (s, e) in [(0, 1), (1, 2), (2, 3), (3, 0), (0, 2), (1, 3)] {
        network
            .add_observation(Observation::new(ObservationKind::SlopeDistance, g, ids[s], ids[e], 100.0, 0.002))
            .unwrap();
    }
    let mut adjustment = free(network, &ids, AdjustmentConfig::default());
    let defect = adjustment.detect_rank_defect().unwrap();
    assert_eq!(defect.defect(), 6);
    assert_eq!(defect.get(DatumComponent::ScaleXYZ), DefectType::Fixed);
}

#[test]
fn oriented_directions_leave_a_similarity_transformation() {
    let mut network = Network::new();
    let ids = spatial_points(&mut network);
    let g = network.add_group("directions");
    let orientation = network.add_parameter(g, ParameterType::Orientation, 0.0).unwrap();
    for e in 1..4 {
        network
            .add_observation(Observation::new(ObservationKind::Direction, g, ids[0], ids[e], 0.5, 0.0001))
            .unwrap();
    }
    let mut adjustment = free(network, &ids, AdjustmentConfig::default());
    adjustment
        .add_additional_parameter(orientation, ProcessingType::Adjusted)
        .unwrap();
    let defect = adjustment.detect_rank_defect().unwrap();
    assert_eq!(defect.defect(), 7);
    assert_eq!(
        defect.free_components(),
        vec![
            DatumComponent::TranslationX,
            DatumComponent::TranslationY,
            DatumComponent::TranslationZ,
            DatumComponent::RotationX,
            DatumComponent::RotationY,
            DatumComponent::RotationZ,
            DatumComponent::ScaleXYZ,
        ]
    );
}

#[test]
fn zenith_angles_from_two_stations_fix_the_tilt() {
    let mut network = Network::new();
    let ids = spatial_points(&mut network);
    let directions = network.add_group("directions");
    let orientation = network
        .add_parameter(directions, ParameterType::Orientation, 0.0)
        .unwrap();
    let zenith = network.add_group("zenith angles");
    for e in 1..4 {
        network
            .add_observation(Observation::new(ObservationKind::Direction, directions, ids[0], ids[e], 0.5, 0.0001))
            .unwrap();
    }
    for (s, e) in [(0, 1), (0, 2), (1, 3)] {
        network
            .add_observation(Observation::new(ObservationKind::ZenithAngle, zenith, ids[s], ids[e], 1.55, 0.0001))
            .unwrap();
    }
    let mut adjustment = free(network, &ids, AdjustmentConfig::default());
    adjustment
        .add_additional_parameter(orientation, ProcessingType::Adjusted)
        .unwrap();
    let defect = adjustment.detect_rank_defect().unwrap();
    assert_eq!(defect.defect(), 5);
    assert_eq!(defect.get(DatumComponent::RotationX), DefectType::Fixed);
    assert_eq!(defect.get(DatumComponent::RotationY), DefectType::Fixed);
    assert_eq!(defect.get(DatumComponent::RotationZ), DefectType::Free);
    assert_eq!(defect.get(DatumComponent::ScaleXYZ), DefectType::Free);
}

#[test]
fn scaled_distances_and_deflected_zenith_angles_leave_seven_components() {
    let mut network = Network::new();
    let mut deflected = Deflection::default();
    deflected.mode = DeflectionMode::Unknown;
    let ids: Vec<_> = CORNERS
        .iter()
        .enumerate()
        .map(|(i, (x, y, z))| {
            let point = Point::spatial(format!("P{i}"), *x, *y, *z).with_deflection(deflected.clone());
            network.add_point(point).unwrap()
        })
        .collect();
    let directions = network.add_group("directions");
    let distances = network.add_group("distances");
    let zenith = network.add_group("zenith angles");
    let orientation = network
        .add_parameter(directions, ParameterType::Orientation, 0.0)
        .unwrap();
    let scale = network.add_parameter(distances, ParameterType::Scale, 1.0).unwrap();
    for e in 1..4 {
        network
            .add_observation(Observation::new(ObservationKind::Direction, directions, ids[0], ids[e], 0.5, 0.0001))
            .unwrap();
    }
    for (s, e) in [(0, 1), (1, 2), (2, 3), (3, 0), (0, 2), (1, 3)] {
        network
            .add_observation(Observation::new(ObservationKind::SlopeDistance, distances, ids[s], ids[e], 100.0, 0.002))
            .unwrap();
    }
    for (s, e) in [(0, 1), (0, 2), (1, 3)] {
        network
            .add_observation(Observation::new(ObservationKind::ZenithAngle, zenith, ids[s], ids[e], 1.55, 0.0001))
            .unwrap();
    }
    let mut adjustment = free(network, &ids, AdjustmentConfig::default());
    for parameter in [orientation, scale] {
        adjustment
            .add_additional_parameter(parameter, ProcessingType::Adjusted)
            .unwrap();
    }
    let defect = adjustment.detect_rank_defect().unwrap();
    assert_eq!(defect.defect(), 7);
    assert_eq!(defect.get(DatumComponent::RotationX), DefectType::Free);
    assert_eq!(defect.get(DatumComponent::RotationY), DefectType::Free);
    assert_eq!(defect.get(DatumComponent::ScaleXYZ), DefectType::Free);
}

#[test]
fn reference_points_remove_the_defect() {
    let mut network = Network::new();
    let ids = spatial_points(&mut network);
    let g = network.add_group("distances");
    for (s, e) in [(0, 1), (1, 2), (2, 3), (3, 0), (0, 2), (1, 3)] {
        network
            .add_observation(Observation::new(ObservationKind::SlopeDistance, g, ids[s], ids[e], 100.0, 0.002))
            .unwrap();
    }
    let mut adjustment = NetworkAdjustment::new(network, AdjustmentConfig::default());
    for id in &ids {
        adjustment.add_reference_point(*id).unwrap();
    }
    assert_eq!(adjustment.detect_rank_defect().unwrap().defect(), 0);
    assert!(!adjustment.is_free_network());
}

#[test]
fn anchored_directions_leave_only_the_scale() {
    let mut network = Network::new();
    let ids = spatial_points(&mut network);
    let g = network.add_group("directions");
    let orientation = network.add_parameter(g, ParameterType::Orientation, 0.0).unwrap();
    for e in 1..4 {
        network
            .add_observation(Observation::new(ObservationKind::Direction, g, ids[0], ids[e], 0.5, 0.0001))
            .unwrap();
    }
    let mut adjustment = NetworkAdjustment::new(network, AdjustmentConfig::default());
    for id in &ids {
        adjustment.add_reference_point(*id).unwrap();
    }
    adjustment
        .add_additional_parameter(orientation, ProcessingType::Adjusted)
        .unwrap();
    let defect = adjustment.detect_rank_defect().unwrap();
    assert_eq!(defect.free_components(), vec![DatumComponent::ScaleXYZ]);
}

#[test]
fn user_defined_defect_replaces_detection() {
    let mut network = Network::new();
    let a = network.add_point(Point::height("A", 100.0)).unwrap();
    let b = network.add_point(Point::height("B", 101.0)).unwrap();
    let g = network.add_group("leveling");
    network
        .add_observation(Observation::new(ObservationKind::Leveling, g, a, b, 1.0, 0.001))
        .unwrap();
    let mut defect = RankDefect::new();
    defect.free(DatumComponent::TranslationZ);
    defect.free(DatumComponent::ScaleZ);
    let config = AdjustmentConfig {
        rank_defect: Some(defect),
        ..Default::default()
    };
    let mut adjustment = free(network, &[a, b], config);
    let detected = adjustment.detect_rank_defect().unwrap();
    assert!(detected.is_user_defined());
    assert_eq!(detected.defect(), 2);
}

#[test]
fn datum_points_cannot_be_mixed_with_reference_points() {
    let mut network = Network::new();
    let ids = spatial_points(&mut network);
    let mut adjustment = NetworkAdjustment::new(network, AdjustmentConfig::default());
    adjustment.add_datum_point(ids[0]).unwrap();
    assert!(adjustment.add_reference_point(ids[1]).is_err());
    assert!(adjustment.add_stochastic_point(ids[1]).is_err());
}

#[test]
fn free_network_keeps_the_centroid_of_its_datum_points() {
    let approx = [(0.02, -0.01), (100.01, 0.03), (99.98, 100.02), (-0.01, 99.99)];
    let mut network = Network::new();
    let ids: Vec<_> = approx
        .iter()
        .enumerate()
        .map(|(i, (x, y))| network.add_point(Point::planar(format!("Q{i}"), *x, *y)).unwrap())
        .collect();
    let g = network.add_group("distances");
    let diagonal = 2f64.sqrt() * 100.0;
    for (s, e, d) in [
        (0, 1, 100.0),
        (1, 2, 100.0),
        (2, 3, 100.0),
        (3, 0, 100.0),
        (0, 2, diagonal),
        (1, 3, diagonal),
    ] {
        network
            .add_observation(Observation::new(ObservationKind::HorizontalDistance, g, ids[s], ids[e], d, 0.001))
            .unwrap();
    }
    let config = AdjustmentConfig {
        proof_datum_defect: true,
        ..Default::default()
    };
    let mut adjustment = free(network, &ids, config);
    let state = adjustment.estimate_model().unwrap();
    assert_eq!(state, EstimationStateType::ErrorFreeEstimation);
    assert_eq!(adjustment.rank_defect().defect(), 3);
    assert_eq!(adjustment.layout().unknowns(), 8);
    assert_eq!(adjustment.layout().size(), 11);
    assert!((adjustment.degrees_of_freedom() - 1.0).abs() < 1e-9);
    assert!(adjustment.omega() < 1e-9);

    let n = approx.len() as f64;
    let (cx, cy) = approx.iter().fold((0.0, 0.0), |(x, y), p| (x + p.0 / n, y + p.1 / n));
    let points = adjustment.network().points();
    let x = points.iter().map(|p| p.coordinates.x).sum::<f64>() / n;
    let y = points.iter().map(|p| p.coordinates.y).sum::<f64>() / n;
    assert!((x - cx).abs() < 1e-9);
    assert!((y - cy).abs() < 1e-9);

    // the adjusted square has its nominal shape
    let d = (points[0].coordinates - points[2].coordinates).norm();
    assert!((d - diagonal).abs() < 1e-6);
}
