//! Least-squares adjustment of geodetic observation networks.
//!
//! A [`Network`] holds points, observations and group parameters. A
//! [`NetworkAdjustment`] registers the role of every point, runs the
//! iterative estimation and derives accuracies, outlier tests, variance
//! components and an optional congruence analysis between two epochs.

pub mod adjustment;
pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod statistic;

pub use adjustment::{EstimationStateType, NetworkAdjustment, RankDefect};
pub use config::{AdjustmentConfig, EstimationType};
pub use error::{AdjustError, AdjustResult};
pub use model::{Network, Observation, ObservationKind, Point, PointId};
