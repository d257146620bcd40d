//! Column layout of the normal equations.
//!
//! Unknowns are laid out once per solve in the order point coordinates,
//! deflections, additional parameters, strain parameters. The bordered system
//! appends one row per datum condition and per strain condition.

use std::collections::HashMap;
use std::ops::Range;

use crate::adjustment::congruence::CongruenceGroup;
use crate::adjustment::strain;
use crate::model::{
    DeflectionMode, Linearization, Network, ObservationId, ParameterId, PointId, PointRole,
};

/// Unknown of the adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unknown {
    Point(PointId),
    Deflection(PointId),
    Additional(ParameterId),
    Strain { group: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: usize,
    pub width: usize,
}

/// Direct observation of an unknown, added for stochastic points and deflections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PseudoRow {
    Point { point: PointId, axis: usize, column: usize },
    Deflection { point: PointId, component: usize, column: usize },
}

/// One row of the design matrix in sparse form.
#[derive(Debug, Clone, Default)]
pub(crate) struct DesignRow {
    pub entries: Vec<(usize, f64)>,
    /// Observed minus calculated value.
    pub misclosure: f64,
    pub weight: f64,
    pub distance: f64,
}

impl DesignRow {
    fn push(&mut self, column: usize, value: f64) {
        match self.entries.iter_mut().find(|(c, _)| *c == column) {
            Some((_, v)) => *v += value,
            None => self.entries.push((column, value)),
        }
    }

    /// Entries restricted to a column range.
    pub fn within(&self, columns: &Range<usize>) -> impl Iterator<Item = (usize, f64)> + '_ {
        let columns = columns.clone();
        self.entries
            .iter()
            .copied()
            .filter(move |(c, _)| columns.contains(c))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterLayout {
    slots: Vec<(Unknown, Slot)>,
    index: HashMap<Unknown, Slot>,
    point_end: usize,
    nuisance_end: usize,
    unknowns: usize,
    datum_rows: usize,
    strain_rows: Vec<(usize, usize)>,
    pseudo_rows: Vec<PseudoRow>,
}

impl ParameterLayout {
    pub(crate) fn build(network: &Network, groups: &[CongruenceGroup], datum_rows: usize) -> Self {
        let mut layout = Self::default();

        for id in network.point_ids() {
            let point = network.point(id);
            if !point.is_unknown() {
                continue;
            }
            let slot = layout.push(Unknown::Point(id), point.dimension);
            if point.role() == Some(PointRole::Stochastic) {
                for (i, axis) in point.axes().iter().enumerate() {
                    layout.pseudo_rows.push(PseudoRow::Point {
                        point: id,
                        axis: *axis,
                        column: slot.offset + i,
                    });
                }
            }
        }
        layout.point_end = layout.unknowns;

        for id in network.point_ids() {
            let point = network.point(id);
            if point.role().is_none() || !point.deflection.is_estimated() {
                continue;
            }
            let slot = layout.push(Unknown::Deflection(id), 2);
            if point.deflection.mode == DeflectionMode::Stochastic {
                for component in 0..2 {
                    layout.pseudo_rows.push(PseudoRow::Deflection {
                        point: id,
                        component,
                        column: slot.offset + component,
                    });
                }
            }
        }
        for (i, parameter) in network.parameters().iter().enumerate() {
            if parameter.is_unknown() {
                layout.push(Unknown::Additional(ParameterId(i)), 1);
            }
        }
        layout.nuisance_end = layout.unknowns;

        for (g, group) in groups.iter().enumerate() {
            if let Some(analysis) = group.strain.as_ref().filter(|s| s.active) {
                layout.push(
                    Unknown::Strain { group: g },
                    strain::number_of_parameters(group.dimension),
                );
                layout
                    .strain_rows
                    .push((g, analysis.number_of_rows(group.dimension, group.ties.len())));
            }
        }
        layout.datum_rows = datum_rows;
        layout
    }

    fn push(&mut self, unknown: Unknown, width: usize) -> Slot {
        let slot = Slot {
            offset: self.unknowns,
            width,
        };
        self.slots.push((unknown, slot));
        self.index.insert(unknown, slot);
        self.unknowns += width;
        slot
    }

    pub fn slots(&self) -> &[(Unknown, Slot)] {
        &self.slots
    }

    pub fn slot(&self, unknown: Unknown) -> Option<Slot> {
        self.index.get(&unknown).copied()
    }

    pub fn point_column(&self, id: PointId) -> Option<usize> {
        self.slot(Unknown::Point(id)).map(|s| s.offset)
    }

    pub fn deflection_column(&self, id: PointId) -> Option<usize> {
        self.slot(Unknown::Deflection(id)).map(|s| s.offset)
    }

    pub fn parameter_column(&self, id: ParameterId) -> Option<usize> {
        self.slot(Unknown::Additional(id)).map(|s| s.offset)
    }

    /// Number of unknowns.
    pub fn unknowns(&self) -> usize {
        self.unknowns
    }

    /// Dimension of the bordered normal equation system.
    pub fn size(&self) -> usize {
        self.unknowns + self.datum_rows + self.strain_rows.iter().map(|(_, n)| n).sum::<usize>()
    }

    pub fn point_columns(&self) -> Range<usize> {
        0..self.point_end
    }

    /// Deflections and additional parameters.
    pub fn nuisance_columns(&self) -> Range<usize> {
        self.point_end..self.nuisance_end
    }

    pub fn datum_rows(&self) -> Range<usize> {
        self.unknowns..self.unknowns + self.datum_rows
    }

    /// First bordered row of each active strain group.
    pub(crate) fn strain_rows(&self) -> Vec<(usize, usize)> {
        let mut row = self.unknowns + self.datum_rows;
        self.strain_rows
            .iter()
            .map(|(g, n)| {
                let first = row;
                row += n;
                (*g, first)
            })
            .collect()
    }

    pub(crate) fn pseudo_rows(&self) -> &[PseudoRow] {
        &self.pseudo_rows
    }

    /// Linearizes an observation; `shift` perturbs the observed value.
    pub(crate) fn design_row(
        &self,
        network: &Network,
        id: ObservationId,
        shift: f64,
    ) -> (DesignRow, Linearization) {
        let obs = network.observation(id);
        let lin = network.linearize(id);
        let mut row = DesignRow {
            misclosure: obs.misclosure(obs.value + shift, lin.value),
            weight: 1.0 / obs.std_used().powi(2),
            distance: lin.distance,
            ..Default::default()
        };
        for (point, gradient, deflection) in [
            (obs.start, &lin.start, &lin.start_deflection),
            (obs.end, &lin.end, &lin.end_deflection),
        ] {
            if let Some(column) = self.point_column(point) {
                for (i, axis) in network.point(point).axes().iter().enumerate() {
                    row.push(column + i, gradient[*axis]);
                }
            }
            if let Some(column) = self.deflection_column(point) {
                row.push(column, deflection.x);
                row.push(column + 1, deflection.y);
            }
        }
        for kind in obs.kind.parameter_types() {
            if let Some(column) = network
                .unknown_parameter(obs.group, *kind)
                .and_then(|p| self.parameter_column(p))
            {
                row.push(column, lin.parameter(*kind));
            }
        }
        (row, lin)
    }

    /// Pseudo-observation row; `shift` perturbs the a-priori value.
    pub(crate) fn pseudo_design_row(&self, network: &Network, pseudo: PseudoRow, shift: f64) -> DesignRow {
        let (column, misclosure, std) = match pseudo {
            PseudoRow::Point { point, axis, column } => {
                let p = network.point(point);
                (column, p.approx[axis] + shift - p.coordinates[axis], p.std_used()[axis])
            }
            PseudoRow::Deflection { point, component, column } => {
                let d = &network.point(point).deflection;
                (column, d.approx[component] + shift - d.value[component], d.std_used()[component])
            }
        };
        DesignRow {
            entries: vec![(column, 1.0)],
            misclosure,
            weight: 1.0 / (std * std),
            distance: 1.0,
        }
    }
}
