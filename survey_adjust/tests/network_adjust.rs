use std::cell::RefCell;
use std::f64::consts::FRAC_PI_4;
use std::rc::Rc;

use survey_adjust::adjustment::VarianceComponentType;
use nalgebra::{Vector2, Vector3};
use survey_adjust::model::{Deflection, DeflectionMode, ParameterType};
use survey_adjust::{
    AdjustmentConfig, EstimationStateType, EstimationType, NetworkAdjustment, Network,
    Observation, ObservationKind, Point, PointId,
};

fn leveling(config: AdjustmentConfig) -> (NetworkAdjustment, PointId) {
    let mut network = Network::new();
    let a = network.add_point(Point::height("A", 100.0)).unwrap();
    let b = network.add_point(Point::height("B", 100.9)).unwrap();
    let g = network.add_group("leveling");
    for value in [1.002, 0.998] {
        network
            .add_observation(Observation::new(ObservationKind::Leveling, g, a, b, value, 0.001))
            .unwrap();
    }
    let mut adjustment = NetworkAdjustment::new(network, config);
    adjustment.add_reference_point(a).unwrap();
    adjustment.add_new_point(b).unwrap();
    (adjustment, b)
}

/// Two fixed points and one new point observed by directions and distances.
fn intersection(approx: (f64, f64), config: AdjustmentConfig) -> (NetworkAdjustment, PointId) {
    let mut network = Network::new();
    let a = network.add_point(Point::planar("A", 0.0, 0.0)).unwrap();
    let b = network.add_point(Point::planar("B", 100.0, 0.0)).unwrap();
    let p = network.add_point(Point::planar("P", approx.0, approx.1)).unwrap();
    let directions = network.add_group("directions");
    let distances = network.add_group("distances");
    let orientation = network
        .add_parameter(directions, ParameterType::Orientation, 0.0)
        .unwrap();
    let d = 5000f64.sqrt();
    let observations = [
        (ObservationKind::Direction, directions, a, b, 0.0, 0.0001),
        (ObservationKind::Direction, directions, a, p, FRAC_PI_4, 0.0001),
        (ObservationKind::HorizontalDistance, distances, a, p, d, 0.002),
        (ObservationKind::HorizontalDistance, distances, b, p, d, 0.002),
    ];
    for (kind, g, s, e, value, std) in observations {
        network
            .add_observation(Observation::new(kind, g, s, e, value, std))
            .unwrap();
    }
    let mut adjustment = NetworkAdjustment::new(network, config);
    adjustment.add_reference_point(a).unwrap();
    adjustment.add_reference_point(b).unwrap();
    adjustment.add_new_point(p).unwrap();
    adjustment
        .add_additional_parameter(orientation, survey_adjust::model::ProcessingType::Adjusted)
        .unwrap();
    (adjustment, p)
}

/// A reference point and a new point tied by two repeated 3D GNSS baselines.
fn baselines(deflection: Option<Deflection>) -> (NetworkAdjustment, PointId, PointId) {
    let mut network = Network::new();
    let mut reference = Point::spatial("A", 0.0, 0.0, 0.0);
    if let Some(deflection) = deflection {
        reference = reference.with_deflection(deflection);
    }
    let a = network.add_point(reference).unwrap();
    let b = network.add_point(Point::spatial("B", 100.01, 49.99, 10.02)).unwrap();
    let g = network.add_group("gnss");
    for x in [100.002, 99.998] {
        network
            .add_gnss_baseline(g, a, b, &[x, 50.0, 10.0], &[0.002; 3])
            .unwrap();
    }
    let mut adjustment = NetworkAdjustment::new(network, AdjustmentConfig::default());
    adjustment.add_reference_point(a).unwrap();
    adjustment.add_new_point(b).unwrap();
    (adjustment, a, b)
}

#[test]
fn leveling_weighted_mean() {
    let (mut adjustment, b) = leveling(AdjustmentConfig::default());
    let state = adjustment.estimate_model().unwrap();
    assert_eq!(state, EstimationStateType::ErrorFreeEstimation);

    let point = adjustment.network().point(b);
    assert!((point.coordinates.z - 101.0).abs() < 1e-9);
    assert!((adjustment.degrees_of_freedom() - 1.0).abs() < 1e-9);
    assert!((adjustment.omega() - 8.0).abs() < 1e-6);
    assert!((adjustment.variance_factor() - 8.0).abs() < 1e-6);
    // sqrt(8 * 0.5e-6)
    assert!((point.result.std.z - 0.002).abs() < 1e-9);

    for obs in adjustment.network().observations() {
        assert!((obs.result.redundancy - 0.5).abs() < 1e-9);
        assert!((obs.result.residual.abs() - 0.002).abs() < 1e-9);
    }
}

#[test]
fn redundancies_sum_to_degrees_of_freedom() {
    let (mut adjustment, _) = intersection((50.3, 49.8), AdjustmentConfig::default());
    adjustment.estimate_model().unwrap();
    let sum: f64 = adjustment
        .network()
        .observations()
        .iter()
        .map(|o| o.result.redundancy)
        .sum();
    assert!((adjustment.degrees_of_freedom() - 1.0).abs() < 1e-9);
    assert!((sum - adjustment.degrees_of_freedom()).abs() < 1e-9);
    for obs in adjustment.network().observations() {
        assert!(obs.result.redundancy >= 0.0 && obs.result.redundancy <= 1.0);
    }
}

#[test]
fn noiseless_network_reproduces_geometry() {
    let (mut adjustment, p) = intersection((50.3, 49.8), AdjustmentConfig::default());
    let state = adjustment.estimate_model().unwrap();
    assert_eq!(state, EstimationStateType::ErrorFreeEstimation);
    let c = adjustment.network().point(p).coordinates;
    assert!((c.x - 50.0).abs() < 1e-6);
    assert!((c.y - 50.0).abs() < 1e-6);
    assert!(adjustment.omega() < 1e-9);
    assert!(adjustment.iterations() >= 2);
    for obs in adjustment.network().observations() {
        assert!(obs.result.residual.abs() < 1e-6);
    }
    let orientation = &adjustment.network().parameters()[0];
    assert!(orientation.value.abs() < 1e-9);
}

#[test]
fn zero_redundancy_keeps_unit_variance() {
    let mut network = Network::new();
    let a = network.add_point(Point::planar("A", 0.0, 0.0)).unwrap();
    let b = network.add_point(Point::planar("B", 100.0, 0.0)).unwrap();
    let p = network.add_point(Point::planar("P", 50.2, 49.9)).unwrap();
    let g = network.add_group("distances");
    let d = 5000f64.sqrt();
    for s in [a, b] {
        network
            .add_observation(Observation::new(ObservationKind::HorizontalDistance, g, s, p, d, 0.002))
            .unwrap();
    }
    let mut adjustment = NetworkAdjustment::new(network, AdjustmentConfig::default());
    adjustment.add_reference_point(a).unwrap();
    adjustment.add_reference_point(b).unwrap();
    adjustment.add_new_point(p).unwrap();

    let state = adjustment.estimate_model().unwrap();
    assert_eq!(state, EstimationStateType::ErrorFreeEstimation);
    assert!(adjustment.degrees_of_freedom().abs() < 1e-9);
    assert_eq!(adjustment.variance_factor(), 1.0);
    let c = adjustment.network().point(p).coordinates;
    assert!((c.x - 50.0).abs() < 1e-6);
    assert!((c.y - 50.0).abs() < 1e-6);
}

#[test]
fn exhausted_iterations_report_no_convergence() {
    let config = AdjustmentConfig {
        max_iterations: 1,
        ..Default::default()
    };
    let (mut adjustment, _) = intersection((60.0, 40.0), config);
    let state = adjustment.estimate_model().unwrap();
    assert_eq!(state, EstimationStateType::NoConvergence);
    assert_eq!(adjustment.state(), EstimationStateType::NoConvergence);
    assert_eq!(adjustment.iterations(), 2);
    // statistics are still derived from the last pass
    assert!((adjustment.degrees_of_freedom() - 1.0).abs() < 1e-6);
}

#[test]
fn collinear_distances_are_singular() {
    let mut network = Network::new();
    let a = network.add_point(Point::planar("A", 0.0, 0.0)).unwrap();
    let p = network.add_point(Point::planar("P", 100.0, 0.0)).unwrap();
    let g = network.add_group("distances");
    for value in [100.001, 99.999] {
        network
            .add_observation(Observation::new(ObservationKind::HorizontalDistance, g, a, p, value, 0.001))
            .unwrap();
    }
    let mut adjustment = NetworkAdjustment::new(network, AdjustmentConfig::default());
    adjustment.add_reference_point(a).unwrap();
    adjustment.add_new_point(p).unwrap();
    let state = adjustment.estimate_model().unwrap();
    assert_eq!(state, EstimationStateType::SingularMatrix);
}

#[test]
fn simulation_ignores_observed_values() {
    let config = AdjustmentConfig {
        estimation_type: EstimationType::Simulation,
        ..Default::default()
    };
    let (mut adjustment, b) = leveling(config);
    let state = adjustment.estimate_model().unwrap();
    assert_eq!(state, EstimationStateType::ErrorFreeEstimation);
    assert_eq!(adjustment.iterations(), 1);
    assert_eq!(adjustment.omega(), 0.0);
    assert_eq!(adjustment.variance_factor(), 1.0);

    let point = adjustment.network().point(b);
    assert!((point.coordinates.z - 100.9).abs() < 1e-12);
    assert!((point.result.std.z - 0.5e-6f64.sqrt()).abs() < 1e-9);
    for obs in adjustment.network().observations() {
        assert_eq!(obs.result.residual, 0.0);
    }
}

#[test]
fn variance_components_cover_global_and_types() {
    let (mut adjustment, _) = leveling(AdjustmentConfig::default());
    adjustment.estimate_model().unwrap();
    let components = adjustment.variance_components();
    let global = components
        .iter()
        .find(|c| c.kind == VarianceComponentType::Global)
        .unwrap();
    assert!((global.omega - 8.0).abs() < 1e-6);
    assert!((global.redundancy - 1.0).abs() < 1e-9);
    assert_eq!(global.number_of_observations, 2);
    assert!((global.variance_factor() - 8.0).abs() < 1e-6);
    let leveling = components
        .iter()
        .find(|c| c.kind == VarianceComponentType::Leveling)
        .unwrap();
    assert!((leveling.omega - global.omega).abs() < 1e-9);
}

#[test]
fn interrupt_stops_the_next_pass() {
    let (mut adjustment, b) = leveling(AdjustmentConfig::default());
    adjustment.interrupt_handle().interrupt();
    let state = adjustment.estimate_model().unwrap();
    assert_eq!(state, EstimationStateType::Interrupt);
    assert!((adjustment.network().point(b).coordinates.z - 100.9).abs() < 1e-12);

    // the flag is cleared so the adjustment can be restarted
    let state = adjustment.estimate_model().unwrap();
    assert_eq!(state, EstimationStateType::ErrorFreeEstimation);
}

#[test]
fn progress_sink_sees_every_stage() {
    let (mut adjustment, _) = leveling(AdjustmentConfig::default());
    let states = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&states);
    adjustment.set_progress_sink(move |state: EstimationStateType, _: f64, _: f64| {
        sink.borrow_mut().push(state);
    });
    adjustment.estimate_model().unwrap();

    let states = states.borrow();
    assert_eq!(states.first(), Some(&EstimationStateType::Busy));
    assert_eq!(states.last(), Some(&EstimationStateType::ErrorFreeEstimation));
    for expected in [
        EstimationStateType::Iterate,
        EstimationStateType::Convergence,
        EstimationStateType::InvertNormalEquationMatrix,
        EstimationStateType::EstimateStochasticParameters,
    ] {
        assert!(states.contains(&expected), "missing {expected:?}");
    }
}

#[test]
fn unregistered_point_is_rejected() {
    let mut network = Network::new();
    let a = network.add_point(Point::height("A", 100.0)).unwrap();
    let b = network.add_point(Point::height("B", 101.0)).unwrap();
    let g = network.add_group("leveling");
    network
        .add_observation(Observation::new(ObservationKind::Leveling, g, a, b, 1.0, 0.001))
        .unwrap();
    let mut adjustment = NetworkAdjustment::new(network, AdjustmentConfig::default());
    adjustment.add_reference_point(a).unwrap();
    assert!(adjustment.estimate_model().is_err());
    assert!(adjustment.add_reference_point(a).is_err());
}

#[test]
fn principal_components_release_the_cofactor_matrix() {
    let config = AdjustmentConfig {
        number_of_principal_components: 2,
        ..Default::default()
    };
    let (mut adjustment, p) = intersection((50.3, 49.8), config);
    adjustment.estimate_model().unwrap();
    let components = adjustment.principal_components();
    assert_eq!(components.len(), 2);
    assert!(components[0].value >= components[1].value);
    assert!(adjustment.cofactor_matrix().is_none());

    let first = adjustment.network().point(p).result.first_principal_component;
    assert!((first.norm_squared() - components[0].value).abs() < 1e-12 + 1e-9 * components[0].value);
}

#[test]
fn cofactor_matrix_is_kept_without_principal_components() {
    let (mut adjustment, p) = intersection((50.3, 49.8), AdjustmentConfig::default());
    adjustment.estimate_model().unwrap();
    assert!(adjustment.principal_components().is_empty());
    let cofactor = adjustment.cofactor_matrix().expect("Qxx after the adjustment");
    let column = adjustment.layout().point_column(p).unwrap();
    let qxx = cofactor.matrix()[(column, column)];
    assert!(qxx > 0.0);
    let std = adjustment.network().point(p).result.std.x;
    assert!(((adjustment.variance_factor() * qxx).sqrt() - std).abs() < 1e-12);
}

#[test]
fn benchmark_paths_give_the_weighted_mean() {
    let mut network = Network::new();
    let benchmarks: Vec<_> = [("BM1", 100.0), ("BM2", 105.0), ("BM3", 98.5)]
        .iter()
        .map(|(name, z)| network.add_point(Point::height(*name, *z)).unwrap())
        .collect();
    let n = network.add_point(Point::height("N", 101.5)).unwrap();
    let g = network.add_group("leveling");
    network
        .add_observation(Observation::new(ObservationKind::Leveling, g, benchmarks[0], n, 2.003, 0.001))
        .unwrap();
    network
        .add_observation(Observation::new(ObservationKind::Leveling, g, n, benchmarks[1], 2.999, 0.002))
        .unwrap();
    let mut adjustment = NetworkAdjustment::new(network, AdjustmentConfig::default());
    for id in &benchmarks {
        adjustment.add_reference_point(*id).unwrap();
    }
    adjustment.add_new_point(n).unwrap();

    let state = adjustment.estimate_model().unwrap();
    assert_eq!(state, EstimationStateType::ErrorFreeEstimation);
    assert!((adjustment.degrees_of_freedom() - 1.0).abs() < 1e-9);

    // paths give 102.003 (weight 4) and 102.001 (weight 1)
    let expected = (4.0 * 102.003 + 102.001) / 5.0;
    let z = adjustment.network().point(n).coordinates.z;
    assert!((z - expected).abs() < 1e-9);
    assert!((z - 102.0).abs() < 0.005);
}

#[test]
fn gnss_baselines_give_the_mean_vector() {
    let (mut adjustment, _, b) = baselines(None);
    let state = adjustment.estimate_model().unwrap();
    assert_eq!(state, EstimationStateType::ErrorFreeEstimation);
    assert_eq!(adjustment.network().observations().len(), 6);

    let point = adjustment.network().point(b);
    assert!((point.coordinates - Vector3::new(100.0, 50.0, 10.0)).norm() < 1e-9);
    assert!((adjustment.degrees_of_freedom() - 3.0).abs() < 1e-9);
    assert!((adjustment.omega() - 2.0).abs() < 1e-6);
    // two baselines of 2 mm, scaled by sigma² = 2/3
    let std = (2.0 / 3.0 * 2.0e-6f64).sqrt();
    assert!((point.result.std.x - std).abs() < 1e-9);

    for obs in adjustment.network().observations() {
        assert!(obs.baseline().is_some());
        assert!((obs.result.redundancy - 0.5).abs() < 1e-9);
    }
}

#[test]
fn stochastic_deflection_enters_as_pseudo_observation() {
    let mut deflection = Deflection::default();
    deflection.mode = DeflectionMode::Stochastic;
    deflection.std_apriori = Vector2::new(1.0e-5, 1.0e-5);
    let (mut adjustment, a, _) = baselines(Some(deflection));
    let state = adjustment.estimate_model().unwrap();
    assert_eq!(state, EstimationStateType::ErrorFreeEstimation);
    assert!(adjustment.layout().deflection_column(a).is_some());
    assert_eq!(adjustment.layout().unknowns(), 5);
    // baselines carry no deflection, so the two pseudo-observations add no redundancy
    assert!((adjustment.degrees_of_freedom() - 3.0).abs() < 1e-9);

    let deflection = &adjustment.network().point(a).deflection;
    assert!(deflection.value.norm() < 1e-12);
    let std = (2.0f64 / 3.0).sqrt() * 1.0e-5;
    for c in 0..2 {
        assert!((deflection.result.std[c] - std).abs() < 1e-12);
        assert!(deflection.result.redundancy[c].abs() < 1e-9);
    }
}

#[test]
fn stochastic_point_shares_the_misclosure() {
    let mut network = Network::new();
    let a = network.add_point(Point::height("A", 100.0)).unwrap();
    let s = network
        .add_point(Point::height("S", 101.0).with_std(Vector3::new(0.0, 0.0, 0.001)))
        .unwrap();
    let g = network.add_group("leveling");
    network
        .add_observation(Observation::new(ObservationKind::Leveling, g, a, s, 1.004, 0.001))
        .unwrap();
    let mut adjustment = NetworkAdjustment::new(network, AdjustmentConfig::default());
    adjustment.add_reference_point(a).unwrap();
    adjustment.add_stochastic_point(s).unwrap();

    let state = adjustment.estimate_model().unwrap();
    assert_eq!(state, EstimationStateType::ErrorFreeEstimation);
    assert!((adjustment.degrees_of_freedom() - 1.0).abs() < 1e-9);
    assert!((adjustment.omega() - 8.0).abs() < 1e-6);

    let point = adjustment.network().point(s);
    assert!((point.coordinates.z - 101.002).abs() < 1e-9);
    assert!((point.result.redundancy.z - 0.5).abs() < 1e-9);
    assert!((point.result.residual.z.abs() - 0.002).abs() < 1e-9);
    let obs = &adjustment.network().observations()[0];
    assert!((obs.result.redundancy - 0.5).abs() < 1e-9);
}
