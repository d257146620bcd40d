// Normal equation system of the bordered Gauss-Markov model and its inverse.
// Observations are accumulated into the upper triangle, constraint rows into
// the border; the lower triangle is mirrored once before solving.

use nalgebra::{DMatrix, DVector, SVD};

use crate::adjustment::layout::DesignRow;

#[derive(Debug, Clone)]
pub struct NormalEquations {
    matrix: DMatrix<f64>,
    vector: DVector<f64>,
    unknowns: usize,
    symmetric: bool,
}

impl NormalEquations {
    pub fn new(size: usize, unknowns: usize) -> Self {
        Self {
            matrix: DMatrix::zeros(size, size),
            vector: DVector::zeros(size),
            unknowns,
            symmetric: false,
        }
    }

    pub fn size(&self) -> usize {
        self.vector.len()
    }

    pub fn unknowns(&self) -> usize {
        self.unknowns
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn vector(&self) -> &DVector<f64> {
        &self.vector
    }

    /// Adds `aᵀ·p·a` and `aᵀ·p·l` of one uncorrelated observation.
    pub(crate) fn add_row(&mut self, row: &DesignRow) {
        self.add_weighted(&row.entries, row.weight, row.misclosure);
    }

    pub(crate) fn add_weighted(&mut self, entries: &[(usize, f64)], weight: f64, misclosure: f64) {
        for (i, (ci, ai)) in entries.iter().enumerate() {
            let wa = weight * ai;
            self.vector[*ci] += wa * misclosure;
            for (cj, aj) in &entries[i..] {
                let (r, c) = if ci <= cj { (*ci, *cj) } else { (*cj, *ci) };
                self.matrix[(r, c)] += wa * aj;
            }
        }
        self.symmetric = false;
    }

    /// Border row `row` with coefficients over the unknown columns and right-hand side `rhs`.
    pub(crate) fn add_constraint(&mut self, row: usize, entries: &[(usize, f64)], rhs: f64) {
        for (column, value) in entries {
            self.matrix[(*column, row)] += value;
        }
        self.vector[row] = rhs;
        self.symmetric = false;
    }

    /// Clears the right-hand side of the unknowns, used for simulations.
    pub(crate) fn clear_vector(&mut self) {
        self.vector.rows_mut(0, self.unknowns).fill(0.0);
    }

    pub(crate) fn symmetrize(&mut self) {
        if !self.symmetric {
            self.matrix.fill_lower_triangle_with_upper_triangle();
            self.symmetric = true;
        }
    }

    pub fn is_symmetric(&self) -> bool {
        let n = self.size();
        (0..n).all(|i| (0..i).all(|j| self.matrix[(i, j)] == self.matrix[(j, i)]))
    }

    /// Block of `N` over the given unknown columns.
    pub(crate) fn block(&mut self, rows: &[usize], columns: &[usize]) -> DMatrix<f64> {
        self.symmetrize();
        DMatrix::from_fn(rows.len(), columns.len(), |i, j| {
            self.matrix[(rows[i], columns[j])]
        })
    }

    /// Solves for the update of the unknowns. `None` if the system is singular.
    pub fn solve(mut self) -> Option<DVector<f64>> {
        self.symmetrize();
        let unknowns = self.unknowns;
        let x = self.matrix.lu().solve(&self.vector)?;
        let x = x.rows(0, unknowns).into_owned();
        x.iter().all(|v| v.is_finite()).then_some(x)
    }

    /// Inverts the system into the cofactor matrix of the unknowns and returns the update.
    pub fn invert(mut self) -> Option<(CofactorMatrix, DVector<f64>)> {
        self.symmetrize();
        let unknowns = self.unknowns;
        let inverse = self.matrix.try_inverse()?;
        if inverse.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let dx = (&inverse * &self.vector).rows(0, unknowns).into_owned();
        let qxx = inverse.view((0, 0), (unknowns, unknowns)).into_owned();
        Some((CofactorMatrix { matrix: qxx }, dx))
    }
}

/// Inverse via SVD; singular values below `tol` are discarded.
pub(crate) fn pseudoinverse(m: &DMatrix<f64>, tol: f64) -> Option<DMatrix<f64>> {
    let svd = SVD::new(m.clone(), true, true);
    let mut s_inv = svd.singular_values.clone();
    let largest = s_inv.iter().copied().fold(0.0, f64::max);
    for val in s_inv.iter_mut() {
        if *val > tol * largest.max(1.0) {
            *val = 1.0 / *val;
        } else {
            *val = 0.0;
        }
    }
    let u = svd.u?;
    let vt = svd.v_t?;
    Some(vt.transpose() * DMatrix::from_diagonal(&s_inv) * u.transpose())
}

/// Inverse of a symmetric matrix with pseudo-inverse fallback.
pub(crate) fn invert_symmetric(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if m.is_empty() {
        return Some(DMatrix::zeros(0, 0));
    }
    m.clone()
        .cholesky()
        .map(|c| c.inverse())
        .or_else(|| pseudoinverse(m, 1e-12))
}

/// Cofactor matrix `Qxx` of the unknowns.
#[derive(Debug, Clone)]
pub struct CofactorMatrix {
    matrix: DMatrix<f64>,
}

impl CofactorMatrix {
    pub(crate) fn from_matrix(matrix: DMatrix<f64>) -> Self {
        Self { matrix }
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn get(&self, row: usize, column: usize) -> f64 {
        self.matrix[(row, column)]
    }

    pub fn block(&self, rows: &[usize], columns: &[usize]) -> DMatrix<f64> {
        DMatrix::from_fn(rows.len(), columns.len(), |i, j| {
            self.matrix[(rows[i], columns[j])]
        })
    }

    /// `Σ aᵢ·Qxx·bⱼ` for two sparse rows.
    pub(crate) fn quadratic(&self, a: &[(usize, f64)], b: &[(usize, f64)]) -> f64 {
        a.iter()
            .map(|(i, ai)| ai * b.iter().map(|(j, bj)| self.matrix[(*i, *j)] * bj).sum::<f64>())
            .sum()
    }

    pub fn size(&self) -> usize {
        self.matrix.nrows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(entries: Vec<(usize, f64)>, misclosure: f64, weight: f64) -> DesignRow {
        DesignRow {
            entries,
            misclosure,
            weight,
            distance: 1.0,
        }
    }

    #[test]
    fn accumulation_is_symmetric() {
        let mut n = NormalEquations::new(2, 2);
        n.add_row(&row(vec![(1, 2.0), (0, -1.0)], 0.5, 4.0));
        n.add_row(&row(vec![(0, 1.0)], 1.0, 1.0));
        n.symmetrize();
        assert!(n.is_symmetric());
        assert_eq!(n.matrix()[(0, 1)], -8.0);
        assert_eq!(n.matrix()[(1, 1)], 16.0);
        assert_eq!(n.vector()[1], 4.0);
    }

    #[test]
    fn bordered_system_fixes_the_mean() {
        // two heights with one difference observed, datum: mean update zero
        let mut n = NormalEquations::new(3, 2);
        n.add_row(&row(vec![(0, -1.0), (1, 1.0)], 0.2, 1.0));
        n.add_constraint(2, &[(0, 1.0), (1, 1.0)], 0.0);
        let (q, dx) = n.invert().unwrap();
        assert!((dx[0] + 0.1).abs() < 1e-12);
        assert!((dx[1] - 0.1).abs() < 1e-12);
        assert!((q.get(0, 0) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn singular_system_is_reported() {
        let mut n = NormalEquations::new(2, 2);
        n.add_row(&row(vec![(0, -1.0), (1, 1.0)], 0.2, 1.0));
        assert!(n.solve().is_none());
    }
}
