//! Residuals, redundancies and outlier tests of the observations.
//!
//! Design rows and the cofactor matrix `Qxx` both belong to the linearization of
//! the last complete pass; residuals are evaluated at the updated parameters.
//! Redundancies keep the weights `Qxx` was computed with, while residuals and
//! tests use the a-priori deviations. The cofactor matrix of
//! the residuals is never formed; its elements are evaluated on demand as
//! `Qvv(i, j) = δij·σi² - ai·Qxx·ajᵀ`.

use nalgebra::{DMatrix, DVector};

use crate::adjustment::layout::{DesignRow, PseudoRow};
use crate::adjustment::normal_equation::pseudoinverse;
use crate::adjustment::{IterationContext, NetworkAdjustment};
use crate::config::EstimationType;
use crate::model::{Linearization, ObservationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RowRef {
    Observation(usize),
    Pseudo(usize),
}

#[derive(Debug, Clone)]
pub(crate) struct FinalRow {
    pub design: DesignRow,
    pub std: f64,
    /// Calculated minus observed value.
    pub residual: f64,
    /// `a·Qxx·aᵀ`
    pub cofactor: f64,
    /// Redundancy at the weights `Qxx` was computed with.
    redundancy: f64,
}

impl FinalRow {
    fn new(design: DesignRow, adjustment: &NetworkAdjustment) -> Self {
        let cofactor = adjustment
            .cofactor
            .as_ref()
            .map_or(0.0, |q| q.quadratic(&design.entries, &design.entries));
        let std = 1.0 / design.weight.sqrt();
        let q = std * std - cofactor;
        let redundancy = if q < f64::EPSILON {
            0.0
        } else {
            (q * design.weight).clamp(0.0, 1.0)
        };
        Self {
            std,
            residual: -design.misclosure,
            cofactor,
            redundancy,
            design,
        }
    }

    fn weight(&self) -> f64 {
        self.design.weight
    }

    /// Diagonal element of `Qvv`, `r·σ²`.
    pub fn residual_cofactor(&self) -> f64 {
        self.redundancy * self.std * self.std
    }

    pub fn redundancy(&self) -> f64 {
        self.redundancy
    }

    /// Switches the row to the deviation `std`; the redundancy is kept.
    pub fn rebase(&mut self, std: f64) {
        if std > 0.0 {
            self.std = std;
            self.design.weight = 1.0 / (std * std);
        }
    }
}

/// Design rows of all observations and pseudo-observations at the final state.
#[derive(Debug, Clone, Default)]
pub(crate) struct FinalRows {
    pub observations: Vec<FinalRow>,
    pub linearizations: Vec<Linearization>,
    pub pseudo: Vec<FinalRow>,
}

impl FinalRows {
    pub fn row(&self, r: RowRef) -> &FinalRow {
        match r {
            RowRef::Observation(i) => &self.observations[i],
            RowRef::Pseudo(i) => &self.pseudo[i],
        }
    }
}

/// Gross error of a group of rows projected onto the columns `B`:
/// `∇ = -(BᵀPQvvPB)⁺·BᵀPv`.
#[derive(Debug, Clone)]
pub(crate) struct ExternalTest {
    pub nabla: DVector<f64>,
    /// `BᵀPQvvPB`
    pub matrix: DMatrix<f64>,
    /// `∇ᵀ·BᵀPQvvPB·∇`
    pub npn: f64,
}

impl NetworkAdjustment {
    /// Evaluates every row at the current parameters. `None` if interrupted.
    pub(crate) fn final_rows(&self, ctx: &IterationContext) -> Option<FinalRows> {
        let count = self.network.observations().len();
        let simulation = self.config.estimation_type == EstimationType::Simulation;
        let row = |design: DesignRow| {
            let mut row = FinalRow::new(design, self);
            if simulation {
                row.residual = 0.0;
            }
            row
        };
        let mut rows = FinalRows {
            observations: Vec::with_capacity(count),
            linearizations: Vec::with_capacity(count),
            pseudo: Vec::with_capacity(self.layout.pseudo_rows().len()),
        };
        for i in 0..count {
            if self.interrupt.is_interrupted() {
                return None;
            }
            let (design, lin) = self
                .layout
                .design_row(&self.network, ObservationId(i), ctx.shift(i));
            rows.observations.push(row(design));
            rows.linearizations.push(lin);
        }
        for (k, pseudo) in self.layout.pseudo_rows().iter().enumerate() {
            let design = self
                .layout
                .pseudo_design_row(&self.network, *pseudo, ctx.shift(count + k));
            rows.pseudo.push(row(design));
        }
        Some(rows)
    }

    /// Re-evaluates the residuals at the current parameters. Design rows, cofactors
    /// and redundancies stay those of the linearization `Qxx` belongs to.
    /// `false` if interrupted.
    pub(crate) fn refresh_residuals(&self, rows: &mut FinalRows, ctx: &IterationContext) -> bool {
        let count = self.network.observations().len();
        let simulation = self.config.estimation_type == EstimationType::Simulation;
        for i in 0..count {
            if self.interrupt.is_interrupted() {
                return false;
            }
            let (design, lin) = self
                .layout
                .design_row(&self.network, ObservationId(i), ctx.shift(i));
            rows.observations[i].residual = if simulation { 0.0 } else { -design.misclosure };
            rows.linearizations[i] = lin;
        }
        for (k, pseudo) in self.layout.pseudo_rows().iter().enumerate() {
            let design = self
                .layout
                .pseudo_design_row(&self.network, *pseudo, ctx.shift(count + k));
            rows.pseudo[k].residual = if simulation { 0.0 } else { -design.misclosure };
        }
        true
    }

    /// Stores residuals, redundancies and weighted squared residuals of all rows.
    /// Returns `(Ω, Σr)`.
    pub(crate) fn update_redundancies(&mut self, rows: &FinalRows) -> (f64, f64) {
        let mut omega = 0.0;
        let mut dof = 0.0;
        for (i, row) in rows.observations.iter().enumerate() {
            let r = row.redundancy();
            let o = row.residual * row.residual * row.weight();
            let result = &mut self.network.observation_mut(ObservationId(i)).result;
            result.calculated = rows.linearizations[i].value;
            result.residual = row.residual;
            result.redundancy = r;
            result.omega = o;
            omega += o;
            dof += r;
        }
        for id in self.network.point_ids().collect::<Vec<_>>() {
            let point = self.network.point_mut(id);
            point.result.omega = 0.0;
            point.result.redundancy = Default::default();
            point.result.residual = Default::default();
            point.deflection.result.omega = 0.0;
        }
        for (k, pseudo) in self.layout.pseudo_rows().to_vec().into_iter().enumerate() {
            let row = &rows.pseudo[k];
            let r = row.redundancy();
            let o = row.residual * row.residual * row.weight();
            match pseudo {
                PseudoRow::Point { point, axis, .. } => {
                    let result = &mut self.network.point_mut(point).result;
                    result.residual[axis] = row.residual;
                    result.redundancy[axis] = r;
                    result.omega += o;
                }
                PseudoRow::Deflection {
                    point, component, ..
                } => {
                    let result = &mut self.network.point_mut(point).deflection.result;
                    result.redundancy[component] = r;
                    result.omega += o;
                }
            }
            omega += o;
            dof += r;
        }
        (omega, dof)
    }

    /// `Qvv(a, b)`
    pub(crate) fn residual_cofactor(&self, rows: &FinalRows, a: RowRef, b: RowRef) -> f64 {
        let (ra, rb) = (rows.row(a), rows.row(b));
        if a == b {
            return ra.residual_cofactor();
        }
        self.cofactor
            .as_ref()
            .map_or(0.0, |q| -q.quadratic(&ra.design.entries, &rb.design.entries))
    }

    pub(crate) fn external_test(
        &self,
        rows: &FinalRows,
        entries: &[(RowRef, DVector<f64>)],
    ) -> ExternalTest {
        let dim = entries.first().map_or(0, |(_, b)| b.len());
        if dim == 0 {
            return ExternalTest {
                nabla: DVector::zeros(0),
                matrix: DMatrix::zeros(0, 0),
                npn: 0.0,
            };
        }
        let mut w = DVector::zeros(dim);
        let mut m = DMatrix::zeros(dim, dim);
        for (ri, bi) in entries {
            let row = rows.row(*ri);
            let pi = row.weight();
            w += bi * (pi * row.residual);
            for (rj, bj) in entries {
                let pj = rows.row(*rj).weight();
                let q = self.residual_cofactor(rows, *ri, *rj);
                if q != 0.0 {
                    m += bi * bj.transpose() * (pi * q * pj);
                }
            }
        }
        let inverse = pseudoinverse(&m, 1e-12).unwrap_or_else(|| DMatrix::zeros(dim, dim));
        let nabla = -(&inverse * &w);
        let npn = w.dot(&(&inverse * &w)).max(0.0);
        ExternalTest {
            nabla,
            matrix: m,
            npn,
        }
    }

    /// Gross errors, detectable biases, influence measures and tests of every
    /// observation block. `point_max` is the largest point variance of the network.
    /// Returns `false` if interrupted.
    pub(crate) fn observation_tests(&mut self, rows: &FinalRows, point_max: f64) -> bool {
        let sigma2 = self.variance_factor;
        let apply = self.config.apply_variance_of_unit_weight;
        for block in self.network.observation_blocks() {
            if self.interrupt.is_interrupted() {
                return false;
            }
            let k = block.len();
            let refs: Vec<RowRef> = block.iter().map(|o| RowRef::Observation(o.0)).collect();
            let qvv = DMatrix::from_fn(k, k, |i, j| self.residual_cofactor(rows, refs[i], refs[j]));
            let p = DVector::from_iterator(k, refs.iter().map(|r| rows.row(*r).weight()));
            let pqvvp = DMatrix::from_fn(k, k, |i, j| p[i] * qvv[(i, j)] * p[j]);
            let pv = DVector::from_iterator(k, refs.iter().map(|r| rows.row(*r).weight() * rows.row(*r).residual));
            let redundancy: f64 = refs.iter().map(|r| rows.row(*r).redundancy()).sum();
            let lambda = self.noncentrality(k as f64);

            let mut nabla = DVector::zeros(k);
            let mut npn = 0.0;
            let tested = redundancy > f64::EPSILON.sqrt();
            if tested {
                if let Some(inverse) = pseudoinverse(&pqvvp, 1e-12) {
                    nabla = -(&inverse * &pv);
                    npn = pv.dot(&(&inverse * &pv)).max(0.0);
                }
            }
            let influence = self.influence_on_position(rows, &refs, &p);
            let ep = &influence * &nabla;
            let distortion = self.influence_on_distortion(rows, &refs, &p, &nabla, point_max);

            let t_prio = if tested { npn / k as f64 } else { 0.0 };
            let denominator = self.degrees_of_freedom - k as f64;
            let sigma2_obs = if denominator > 0.0 {
                (self.omega - npn) / denominator
            } else {
                0.0
            };
            let t_post = if tested && apply && sigma2_obs > 0.0 {
                t_prio / sigma2_obs
            } else {
                0.0
            };
            let adapted = block
                .iter()
                .any(|o| self.network.observation(*o).adapted_std.is_some());
            let test = if tested {
                self.test_result(k as f64, t_prio, t_post, denominator, adapted)
            } else {
                Default::default()
            };

            for (i, id) in block.iter().enumerate() {
                let row = rows.row(refs[i]);
                let angle = self.network.observation(*id).kind.is_angle();
                let result = &mut self.network.observation_mut(*id).result;
                result.std = (sigma2 * row.cofactor.max(0.0)).sqrt();
                result.gross_error = nabla[i];
                result.minimal_detectable_bias = if pqvvp[(i, i)] > 0.0 {
                    (lambda * sigma2 / pqvvp[(i, i)]).sqrt()
                } else {
                    f64::INFINITY
                };
                result.influence_on_position = if angle { ep[i] * row.design.distance } else { ep[i] };
                result.influence_on_network_distortion = distortion;
                result.test = test;
            }
        }
        true
    }

    /// `P·(A·Qxx_x)·(A_x - A_z·QzzNzx)ᵀ` of one block.
    fn influence_on_position(&self, rows: &FinalRows, refs: &[RowRef], p: &DVector<f64>) -> DMatrix<f64> {
        let k = refs.len();
        let Some(cofactor) = self.cofactor.as_ref() else {
            return DMatrix::zeros(k, k);
        };
        let points = self.layout.point_columns();
        let nuisance = self.layout.nuisance_columns();
        let width = points.len();
        let qxx = cofactor.matrix();
        let mut projected = Vec::with_capacity(k);
        let mut reduced = Vec::with_capacity(k);
        for r in refs {
            let design = &rows.row(*r).design;
            let mut g = DVector::zeros(width);
            let mut a = DVector::zeros(width);
            for (c, v) in &design.entries {
                g += qxx.row(*c).columns(points.start, width).transpose() * *v;
            }
            for (c, v) in design.within(&points) {
                a[c - points.start] += v;
            }
            if let Some(block) = self.nuisance.as_ref() {
                for (c, v) in design.within(&nuisance) {
                    let z = c - nuisance.start;
                    if z < block.qzz_nzx.nrows() {
                        a -= block.qzz_nzx.row(z).transpose() * v;
                    }
                }
            }
            projected.push(g);
            reduced.push(a);
        }
        DMatrix::from_fn(k, k, |i, j| p[i] * projected[i].dot(&reduced[j]))
    }

    /// `√(σ²_max·|du² - uz²|)` with the part `uz²` absorbed by deflections and additional parameters.
    fn influence_on_distortion(
        &self,
        rows: &FinalRows,
        refs: &[RowRef],
        p: &DVector<f64>,
        nabla: &DVector<f64>,
        point_max: f64,
    ) -> f64 {
        let Some(cofactor) = self.cofactor.as_ref() else {
            return 0.0;
        };
        let k = refs.len();
        let pqp = DMatrix::from_fn(k, k, |i, j| {
            p[i] * cofactor.quadratic(&rows.row(refs[i]).design.entries, &rows.row(refs[j]).design.entries) * p[j]
        });
        let du2 = (nabla.transpose() * pqp * nabla)[(0, 0)];
        let uz2 = match self.nuisance.as_ref() {
            Some(block) if block.qzz.nrows() > 0 => {
                let nuisance = self.layout.nuisance_columns();
                let az: Vec<DVector<f64>> = refs
                    .iter()
                    .map(|r| {
                        let mut a = DVector::zeros(block.qzz.nrows());
                        for (c, v) in rows.row(*r).design.within(&nuisance) {
                            a[c - nuisance.start] += v;
                        }
                        a
                    })
                    .collect();
                let efsp = DMatrix::from_fn(k, k, |i, j| p[i] * (az[i].transpose() * &block.qzz * &az[j])[(0, 0)] * p[j]);
                (nabla.transpose() * efsp * nabla)[(0, 0)]
            }
            _ => 0.0,
        };
        (point_max * (du2 - uz2).abs()).sqrt()
    }
}
