//! Plane geometry: which slab of a field is sent, and where a received
//! slab lands.

use crate::topology::Side;
use crate::NDIMS;

/// An axis-aligned slab of a field, one element thick along the exchange
/// dimension and spanning the full extent everywhere else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Plane {
    pub start: [usize; NDIMS],
    pub extent: [usize; NDIMS],
}

impl Plane {
    pub fn len(&self) -> usize {
        self.extent.iter().product()
    }
}

/// Number of elements in the plane orthogonal to `dim`.
pub fn halosize(dim: usize, shape: [usize; NDIMS]) -> usize {
    let mut n = 1;
    for (a, &s) in shape.iter().enumerate() {
        if a != dim {
            n *= s;
        }
    }
    n
}

/// The plane that is sent towards `side`: the interior row adjacent to the
/// halo, so the neighbour's halo row ends up mirroring interior data.
pub fn send_plane(side: Side, dim: usize, shape: [usize; NDIMS], ol: usize) -> Plane {
    debug_assert!(ol >= 2);
    let row = match side {
        Side::Low => ol - 1,
        Side::High => shape[dim] - ol,
    };
    plane_at(dim, row, shape)
}

/// The plane a received message is unpacked into: the halo row itself.
pub fn recv_plane(side: Side, dim: usize, shape: [usize; NDIMS]) -> Plane {
    let row = match side {
        Side::Low => 0,
        Side::High => shape[dim] - 1,
    };
    plane_at(dim, row, shape)
}

fn plane_at(dim: usize, row: usize, shape: [usize; NDIMS]) -> Plane {
    let mut start = [0; NDIMS];
    let mut extent = shape;
    start[dim] = row;
    extent[dim] = 1;
    Plane { start, extent }
}

/// Upper bound on the halo plane size over all dimensions: the product of
/// every axis but the smallest one (1 for 1-D fields). Scratch slots are
/// sized against this so one slot serves every dimension of the field.
pub fn max_halo_elems(shape: [usize; NDIMS], ndim: usize) -> usize {
    if ndim <= 1 {
        return 1;
    }
    let dims = &shape[..ndim];
    let total: usize = dims.iter().product();
    let min = *dims.iter().min().expect("empty shape");
    if min == 0 {
        0
    } else {
        total / min
    }
}

/// The axis whose elements are adjacent in memory. Planes orthogonal to it
/// degenerate into per-element strided accesses and get the gather/scatter
/// treatment everywhere (host copy cases, device kernel shapes).
pub fn fast_axis(shape: [usize; NDIMS]) -> usize {
    (0..NDIMS).rev().find(|&a| shape[a] > 1).unwrap_or(NDIMS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_rows_hug_the_halo() {
        // Length 10, ol = 2: low side sends row 1, high side sends row 8.
        let shape = [10, 1, 1];
        assert_eq!(send_plane(Side::Low, 0, shape, 2).start, [1, 0, 0]);
        assert_eq!(send_plane(Side::High, 0, shape, 2).start, [8, 0, 0]);
        assert_eq!(recv_plane(Side::Low, 0, shape).start, [0, 0, 0]);
        assert_eq!(recv_plane(Side::High, 0, shape).start, [9, 0, 0]);
    }

    #[test]
    fn planes_span_other_axes() {
        let shape = [6, 4, 5];
        let p = send_plane(Side::High, 1, shape, 3);
        assert_eq!(p.start, [0, 1, 0]);
        assert_eq!(p.extent, [6, 1, 5]);
        assert_eq!(p.len(), 30);
        assert_eq!(halosize(1, shape), 30);
    }

    #[test]
    fn max_halo_drops_smallest_axis() {
        assert_eq!(max_halo_elems([10, 1, 1], 1), 1);
        assert_eq!(max_halo_elems([6, 4, 1], 2), 6);
        assert_eq!(max_halo_elems([4, 6, 5], 3), 30);
        assert_eq!(max_halo_elems([7, 7, 7], 3), 49);
    }

    #[test]
    fn fast_axis_skips_padded_axes() {
        assert_eq!(fast_axis([8, 8, 8]), 2);
        assert_eq!(fast_axis([8, 8, 1]), 1);
        assert_eq!(fast_axis([8, 1, 1]), 0);
        assert_eq!(fast_axis([1, 1, 1]), 2);
    }
}
