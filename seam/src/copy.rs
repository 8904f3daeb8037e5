//! Host-side pack/unpack between a strided field slab and contiguous
//! scratch, specialized by which axis the plane is orthogonal to.

use rayon::prelude::*;

use crate::field::Elem;
use crate::range::Plane;
use crate::NDIMS;

/// Copies the plane orthogonal to `dim` out of `src` into `dst`.
///
/// `dst` must hold exactly `plane.len()` elements. Contiguous work at or
/// above `par_threshold` elements is split across the rayon pool.
pub fn pack_plane<T: Elem>(
    src: &[T],
    shape: [usize; NDIMS],
    dim: usize,
    plane: Plane,
    dst: &mut [T],
    par_threshold: usize,
) {
    debug_assert_eq!(dst.len(), plane.len());
    let [_, n1, n2] = shape;
    let full = plane.extent[1] == shape[1] && plane.extent[2] == shape[2];
    match dim {
        // Plane orthogonal to the slow axis is one contiguous run.
        0 if full => {
            let off = plane.start[0] * n1 * n2;
            copy_contiguous(&src[off..off + dst.len()], dst, par_threshold);
        }
        // One contiguous row of the fast axis per slow index.
        1 if plane.extent[0] == shape[0] && plane.extent[2] == shape[2] => {
            let s1 = plane.start[1];
            let body = |(i0, row): (usize, &mut [T])| {
                let off = (i0 * n1 + s1) * n2;
                row.copy_from_slice(&src[off..off + n2]);
            };
            if dst.len() >= par_threshold {
                dst.par_chunks_mut(n2).enumerate().for_each(body);
            } else {
                dst.chunks_mut(n2).enumerate().for_each(body);
            }
        }
        // Fast-axis plane: a pure gather, one strided element per point.
        2 if plane.extent[0] == shape[0] && plane.extent[1] == shape[1] => {
            let s2 = plane.start[2];
            let body = |(i0, row): (usize, &mut [T])| {
                for (i1, out) in row.iter_mut().enumerate() {
                    *out = src[(i0 * n1 + i1) * n2 + s2];
                }
            };
            if dst.len() >= par_threshold {
                dst.par_chunks_mut(n1).enumerate().for_each(body);
            } else {
                dst.chunks_mut(n1).enumerate().for_each(body);
            }
        }
        _ => {
            let mut out = dst.iter_mut();
            for i0 in 0..plane.extent[0] {
                for i1 in 0..plane.extent[1] {
                    for i2 in 0..plane.extent[2] {
                        let off = ((plane.start[0] + i0) * n1 + plane.start[1] + i1) * n2
                            + plane.start[2]
                            + i2;
                        *out.next().expect("dst too short") = src[off];
                    }
                }
            }
        }
    }
}

/// Inverse of [`pack_plane`]: scatters `src` into the plane of `dst`.
pub fn unpack_plane<T: Elem>(
    src: &[T],
    dst: &mut [T],
    shape: [usize; NDIMS],
    dim: usize,
    plane: Plane,
    par_threshold: usize,
) {
    debug_assert_eq!(src.len(), plane.len());
    let [_, n1, n2] = shape;
    match dim {
        0 if plane.extent[1] == shape[1] && plane.extent[2] == shape[2] => {
            let off = plane.start[0] * n1 * n2;
            copy_contiguous(src, &mut dst[off..off + src.len()], par_threshold);
        }
        // Slabs of dst along the slow axis are disjoint, so both strided
        // cases parallelize per slab.
        1 if plane.extent[0] == shape[0] && plane.extent[2] == shape[2] => {
            let s1 = plane.start[1];
            let body = |(i0, slab): (usize, &mut [T])| {
                slab[s1 * n2..(s1 + 1) * n2].copy_from_slice(&src[i0 * n2..(i0 + 1) * n2]);
            };
            if src.len() >= par_threshold {
                dst.par_chunks_mut(n1 * n2).enumerate().for_each(body);
            } else {
                dst.chunks_mut(n1 * n2).enumerate().for_each(body);
            }
        }
        2 if plane.extent[0] == shape[0] && plane.extent[1] == shape[1] => {
            let s2 = plane.start[2];
            let body = |(i0, slab): (usize, &mut [T])| {
                for (i1, &v) in src[i0 * n1..(i0 + 1) * n1].iter().enumerate() {
                    slab[i1 * n2 + s2] = v;
                }
            };
            if src.len() >= par_threshold {
                dst.par_chunks_mut(n1 * n2).enumerate().for_each(body);
            } else {
                dst.chunks_mut(n1 * n2).enumerate().for_each(body);
            }
        }
        _ => {
            let mut inp = src.iter();
            for i0 in 0..plane.extent[0] {
                for i1 in 0..plane.extent[1] {
                    for i2 in 0..plane.extent[2] {
                        let off = ((plane.start[0] + i0) * n1 + plane.start[1] + i1) * n2
                            + plane.start[2]
                            + i2;
                        dst[off] = *inp.next().expect("src too short");
                    }
                }
            }
        }
    }
}

/// Straight copy, parallel above the threshold.
pub fn copy_contiguous<T: Elem>(src: &[T], dst: &mut [T], par_threshold: usize) {
    debug_assert_eq!(src.len(), dst.len());
    if src.len() >= par_threshold && par_threshold > 0 {
        let chunk = par_threshold.max(1);
        dst.par_chunks_mut(chunk)
            .zip(src.par_chunks(chunk))
            .for_each(|(d, s)| d.copy_from_slice(s));
    } else {
        dst.copy_from_slice(src);
    }
}

/// Byte-level plane gather for runtimes that move untyped storage.
///
/// # Safety
/// `src` must cover `shape` elements of `elem_size` bytes, `dst` must hold
/// `plane.len() * elem_size` bytes, and the regions must not overlap.
pub(crate) unsafe fn pack_plane_raw(
    src: *const u8,
    shape: [usize; NDIMS],
    plane: Plane,
    elem_size: usize,
    dst: *mut u8,
) {
    let [_, n1, n2] = shape;
    let run = plane.extent[2] * elem_size;
    let mut out = dst;
    for i0 in 0..plane.extent[0] {
        for i1 in 0..plane.extent[1] {
            let off = ((plane.start[0] + i0) * n1 + plane.start[1] + i1) * n2 + plane.start[2];
            std::ptr::copy_nonoverlapping(src.add(off * elem_size), out, run);
            out = out.add(run);
        }
    }
}

/// Inverse of [`pack_plane_raw`].
///
/// # Safety
/// Same contract with `src` and `dst` roles swapped.
pub(crate) unsafe fn unpack_plane_raw(
    src: *const u8,
    shape: [usize; NDIMS],
    plane: Plane,
    elem_size: usize,
    dst: *mut u8,
) {
    let [_, n1, n2] = shape;
    let run = plane.extent[2] * elem_size;
    let mut inp = src;
    for i0 in 0..plane.extent[0] {
        for i1 in 0..plane.extent[1] {
            let off = ((plane.start[0] + i0) * n1 + plane.start[1] + i1) * n2 + plane.start[2];
            std::ptr::copy_nonoverlapping(inp, dst.add(off * elem_size), run);
            inp = inp.add(run);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{recv_plane, send_plane};
    use crate::topology::Side;

    fn filled(shape: [usize; NDIMS]) -> Vec<f64> {
        (0..shape.iter().product::<usize>()).map(|i| i as f64).collect()
    }

    fn naive_pack(src: &[f64], shape: [usize; NDIMS], plane: Plane) -> Vec<f64> {
        let mut out = Vec::with_capacity(plane.len());
        for i0 in 0..plane.extent[0] {
            for i1 in 0..plane.extent[1] {
                for i2 in 0..plane.extent[2] {
                    let off = ((plane.start[0] + i0) * shape[1] + plane.start[1] + i1) * shape[2]
                        + plane.start[2]
                        + i2;
                    out.push(src[off]);
                }
            }
        }
        out
    }

    #[test]
    fn pack_matches_naive_on_every_axis() {
        let shape = [5, 4, 3];
        let src = filled(shape);
        for dim in 0..NDIMS {
            for side in Side::BOTH {
                let plane = send_plane(side, dim, shape, 2);
                let mut fast = vec![0.0; plane.len()];
                pack_plane(&src, shape, dim, plane, &mut fast, usize::MAX);
                assert_eq!(fast, naive_pack(&src, shape, plane), "dim {dim}");
            }
        }
    }

    #[test]
    fn pack_parallel_path_agrees() {
        let shape = [8, 9, 7];
        let src = filled(shape);
        for dim in 0..NDIMS {
            let plane = send_plane(Side::High, dim, shape, 2);
            let mut serial = vec![0.0; plane.len()];
            let mut parallel = vec![0.0; plane.len()];
            pack_plane(&src, shape, dim, plane, &mut serial, usize::MAX);
            pack_plane(&src, shape, dim, plane, &mut parallel, 1);
            assert_eq!(serial, parallel);
        }
    }

    #[test]
    fn unpack_round_trips() {
        let shape = [4, 5, 6];
        let src = filled(shape);
        for dim in 0..NDIMS {
            let plane = recv_plane(Side::Low, dim, shape);
            let mut buf = vec![0.0; plane.len()];
            pack_plane(&src, shape, dim, plane, &mut buf, usize::MAX);
            let mut dst = vec![-1.0; src.len()];
            unpack_plane(&buf, &mut dst, shape, dim, plane, usize::MAX);
            assert_eq!(naive_pack(&dst, shape, plane), buf);
        }
    }

    #[test]
    fn raw_pack_matches_typed() {
        let shape = [3, 4, 5];
        let src = filled(shape);
        let plane = send_plane(Side::Low, 1, shape, 2);
        let mut typed = vec![0.0f64; plane.len()];
        pack_plane(&src, shape, 1, plane, &mut typed, usize::MAX);
        let mut raw = vec![0.0f64; plane.len()];
        unsafe {
            pack_plane_raw(
                src.as_ptr() as *const u8,
                shape,
                plane,
                8,
                raw.as_mut_ptr() as *mut u8,
            );
        }
        assert_eq!(typed, raw);
    }
}
