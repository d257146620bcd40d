//! Principal components of the point covariance.

use log::debug;
use nalgebra::{DMatrix, SymmetricEigen, Vector3};
use serde::{Deserialize, Serialize};

use crate::adjustment::{EstimationStateType, NetworkAdjustment};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrincipalComponent {
    /// Rank of the component, zero for the largest.
    pub index: usize,
    /// Variance along the component, `σ²·λ`.
    pub value: f64,
}

/// Eigenvalues in decreasing order together with the permutation of the eigenvectors.
fn sorted_eigen(matrix: DMatrix<f64>) -> (Vec<f64>, DMatrix<f64>) {
    let eigen = SymmetricEigen::new(matrix);
    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    order.sort_by(|a, b| eigen.eigenvalues[*b].total_cmp(&eigen.eigenvalues[*a]));
    let values = order.iter().map(|i| eigen.eigenvalues[*i]).collect();
    let vectors = DMatrix::from_fn(eigen.eigenvectors.nrows(), order.len(), |r, c| {
        eigen.eigenvectors[(r, order[c])]
    });
    (values, vectors)
}

impl NetworkAdjustment {
    /// Extracts the largest principal components of the point block of `Qxx` and
    /// stores the first component per point. The cofactor matrix is released afterwards.
    /// Without requested components `Qxx` stays available.
    pub(crate) fn principal_component_analysis(&mut self) {
        let count = self.config.number_of_principal_components;
        if count == 0 {
            return;
        }
        let Some(cofactor) = self.cofactor.take() else {
            return;
        };
        self.nuisance = None;
        let points = self.layout.point_columns();
        if points.is_empty() {
            return;
        }
        self.notify(EstimationStateType::PrincipalComponentAnalysis, 0.0, count as f64);
        let sigma2 = self.variance_factor;
        let block = cofactor
            .matrix()
            .view((points.start, points.start), (points.len(), points.len()))
            .into_owned();
        let (values, vectors) = sorted_eigen(block);
        self.principal_components = values
            .iter()
            .take(count)
            .enumerate()
            .map(|(index, value)| PrincipalComponent {
                index,
                value: sigma2 * value.max(0.0),
            })
            .collect();
        debug!("principal components {:?}", self.principal_components);

        let factor = (sigma2 * values.first().copied().unwrap_or(0.0).max(0.0)).sqrt();
        for id in self.network.point_ids().collect::<Vec<_>>() {
            let Some(offset) = self.layout.point_column(id) else {
                continue;
            };
            let point = self.network.point_mut(id);
            let mut component = Vector3::zeros();
            for (i, axis) in point.axes().iter().enumerate() {
                component[*axis] = factor * vectors[(offset + i - points.start, 0)];
            }
            point.result.first_principal_component = component;
        }
    }
}
