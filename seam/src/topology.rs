//! The per-process view of the Cartesian process grid.
//!
//! Grid construction belongs to the surrounding system; the exchanger only
//! consumes the neighbour table. [`Topology::cartesian`] builds one for
//! demos and tests.

use crate::{NDIMS, NNEIGHBORS_PER_DIM};

pub type Rank = i32;

/// Low or high neighbour along a dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Low = 0,
    High = 1,
}

impl Side {
    pub const BOTH: [Side; NNEIGHBORS_PER_DIM] = [Side::Low, Side::High];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The side a locally looped-back message lands on.
    pub fn opposite(self) -> Side {
        match self {
            Side::Low => Side::High,
            Side::High => Side::Low,
        }
    }
}

/// Neighbour table for one process.
#[derive(Clone, Debug)]
pub struct Topology {
    me: Rank,
    neighbors: [[Option<Rank>; NNEIGHBORS_PER_DIM]; NDIMS],
}

impl Topology {
    /// Builds a topology from an externally computed neighbour table.
    pub fn new(me: Rank, neighbors: [[Option<Rank>; NNEIGHBORS_PER_DIM]; NDIMS]) -> Self {
        Self { me, neighbors }
    }

    /// Neighbour table of rank `me` in a `dims` grid, row-major rank order.
    /// Periodic dimensions wrap; on non-periodic boundaries the neighbour
    /// is absent. A periodic dimension of extent 1 neighbours itself.
    pub fn cartesian(dims: [usize; NDIMS], periods: [bool; NDIMS], me: Rank) -> Self {
        let nprocs: usize = dims.iter().product();
        assert!((me as usize) < nprocs, "rank outside the process grid");

        let mut coords = [0usize; NDIMS];
        let mut rest = me as usize;
        for d in (0..NDIMS).rev() {
            coords[d] = rest % dims[d];
            rest /= dims[d];
        }

        let rank_of = |c: [usize; NDIMS]| -> Rank {
            let mut r = 0usize;
            for d in 0..NDIMS {
                r = r * dims[d] + c[d];
            }
            r as Rank
        };

        let mut neighbors = [[None; NNEIGHBORS_PER_DIM]; NDIMS];
        for d in 0..NDIMS {
            for side in Side::BOTH {
                let step: isize = match side {
                    Side::Low => -1,
                    Side::High => 1,
                };
                let c = coords[d] as isize + step;
                let c = if c < 0 || c as usize >= dims[d] {
                    if periods[d] {
                        (c.rem_euclid(dims[d] as isize)) as usize
                    } else {
                        continue;
                    }
                } else {
                    c as usize
                };
                let mut nc = coords;
                nc[d] = c;
                neighbors[d][side.index()] = Some(rank_of(nc));
            }
        }
        Self { me, neighbors }
    }

    pub fn me(&self) -> Rank {
        self.me
    }

    pub fn neighbor(&self, side: Side, dim: usize) -> Option<Rank> {
        self.neighbors[dim][side.index()]
    }

    pub fn has_neighbor(&self, side: Side, dim: usize) -> bool {
        self.neighbors[dim][side.index()].is_some()
    }
}
