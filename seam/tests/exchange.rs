//! End-to-end halo exchanges over the in-process fabric, checked against
//! explicit expectations and a brute-force reference model.

use ndarray::{Array1, Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use seam::device::EmuRuntime;
use seam::transport::{LoopbackFabric, LoopbackTransport};
use seam::{ContextDesc, DeviceArray, Error, Exchanger, Field, Topology};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Single-rank exchanger with the given periodicity.
fn local_exchanger(periods: [bool; 3], desc: ContextDesc) -> Exchanger<LoopbackTransport> {
    let transport = LoopbackFabric::endpoints(1).pop().unwrap();
    let topo = Topology::cartesian([1, 1, 1], periods, 0);
    Exchanger::new(topo, transport, desc)
}

/// What a periodic single-rank exchange must produce: per dimension, in
/// order, the interior row next to each halo replaces the opposite halo
/// row. Dimension order matters for corners; row order within one
/// dimension does not, because send rows are never halo rows.
fn reference_exchange<T: Copy>(data: &mut [T], shape: [usize; 3], ol: [usize; 3]) {
    for dim in 0..3 {
        if ol[dim] < 2 {
            continue;
        }
        let n = shape[dim];
        copy_row(data, shape, dim, ol[dim] - 1, n - 1);
        copy_row(data, shape, dim, n - ol[dim], 0);
    }
}

fn copy_row<T: Copy>(data: &mut [T], shape: [usize; 3], dim: usize, from: usize, to: usize) {
    let [n0, n1, n2] = shape;
    for i0 in 0..n0 {
        for i1 in 0..n1 {
            for i2 in 0..n2 {
                let mut s = [i0, i1, i2];
                let mut d = [i0, i1, i2];
                if s[dim] != from {
                    continue;
                }
                d[dim] = to;
                s[dim] = from;
                let src = (s[0] * n1 + s[1]) * n2 + s[2];
                let dst = (d[0] * n1 + d[1]) * n2 + d[2];
                data[dst] = data[src];
            }
        }
    }
}

#[test]
fn one_dimensional_periodic_wrap() {
    init_logs();
    // Interior 1..=8, halo cells poisoned.
    let mut a = Array1::<f64>::from_elem(10, -1.0);
    for i in 1..=8 {
        a[i] = i as f64;
    }
    let mut ex = local_exchanger([true, false, false], ContextDesc::default());
    ex.update_halo(&mut [Field::host1(a.view_mut(), 2)]).unwrap();

    assert_eq!(a[0], 8.0);
    assert_eq!(a[9], 1.0);
    for i in 1..=8 {
        assert_eq!(a[i], i as f64, "interior cell {i} changed");
    }
}

#[test]
fn two_ranks_non_periodic() {
    init_logs();
    let mut endpoints = LoopbackFabric::endpoints(2);
    let t1 = endpoints.pop().unwrap();
    let t0 = endpoints.pop().unwrap();

    let run = |transport: LoopbackTransport, me: i32, base: f64| {
        let topo = Topology::cartesian([2, 1, 1], [false, false, false], me);
        let mut ex = Exchanger::new(topo, transport, ContextDesc::default());
        let mut a = Array2::<f64>::from_shape_fn((6, 4), |(i, j)| {
            base + 10.0 * (i + 1) as f64 + (j + 1) as f64
        });
        ex.update_halo(&mut [Field::host2(a.view_mut(), [2, 1])]).unwrap();
        a
    };

    let (a0, a1) = std::thread::scope(|s| {
        let h0 = s.spawn(|| run(t0, 0, 0.0));
        let h1 = s.spawn(|| run(t1, 1, 100.0));
        (h0.join().unwrap(), h1.join().unwrap())
    });

    // Rank 0's high halo row mirrors rank 1's first interior row and
    // vice versa; everything else is untouched.
    for j in 0..4 {
        assert_eq!(a0[[5, j]], 100.0 + 10.0 * 2.0 + (j + 1) as f64);
        assert_eq!(a1[[0, j]], 10.0 * 5.0 + (j + 1) as f64);
        for i in 0..5 {
            assert_eq!(a0[[i, j]], 10.0 * (i + 1) as f64 + (j + 1) as f64);
        }
        for i in 1..6 {
            assert_eq!(a1[[i, j]], 100.0 + 10.0 * (i + 1) as f64 + (j + 1) as f64);
        }
    }
}

#[test]
fn two_ranks_periodic_ring() {
    init_logs();
    // Both sides of dimension 0 are the same peer; matching relies on
    // posting order alone.
    let mut endpoints = LoopbackFabric::endpoints(2);
    let t1 = endpoints.pop().unwrap();
    let t0 = endpoints.pop().unwrap();

    let run = |transport: LoopbackTransport, me: i32, base: f64| {
        let topo = Topology::cartesian([2, 1, 1], [true, false, false], me);
        let mut ex = Exchanger::new(topo, transport, ContextDesc::default());
        let mut a = Array1::<f64>::from_shape_fn(8, |i| base + i as f64);
        ex.update_halo(&mut [Field::host1(a.view_mut(), 2)]).unwrap();
        a
    };

    let (a0, a1) = std::thread::scope(|s| {
        let h0 = s.spawn(|| run(t0, 0, 0.0));
        let h1 = s.spawn(|| run(t1, 1, 100.0));
        (h0.join().unwrap(), h1.join().unwrap())
    });

    // Low halo takes the low neighbour's high interior row (index 6),
    // high halo takes the high neighbour's low interior row (index 1).
    assert_eq!(a0[0], 106.0);
    assert_eq!(a0[7], 101.0);
    assert_eq!(a1[0], 6.0);
    assert_eq!(a1[7], 1.0);
}

#[test]
fn three_dimensional_corners_transit() {
    init_logs();
    let mut a = Array3::<f64>::from_shape_fn((4, 4, 4), |(i, j, k)| {
        1000.0 * (i + 1) as f64 + 100.0 * (j + 1) as f64 + (k + 1) as f64
    });
    let mut reference: Vec<f64> = a.as_slice().unwrap().to_vec();

    let mut ex = local_exchanger([true, true, true], ContextDesc::default());
    ex.update_halo(&mut [Field::host3(a.view_mut(), [2, 2, 2])]).unwrap();

    reference_exchange(&mut reference, [4, 4, 4], [2, 2, 2]);
    assert_eq!(a.as_slice().unwrap(), &reference[..]);

    // Opposite boundary planes agree after the wrap, including the
    // corner that travelled through all three dimensions.
    for j in 0..4 {
        for k in 0..4 {
            assert_eq!(a[[0, j, k]], a[[2, j, k]]);
            assert_eq!(a[[3, j, k]], a[[1, j, k]]);
        }
    }
    assert_eq!(a[[0, 0, 0]], a[[2, 2, 2]]);
    assert_eq!(a[[3, 3, 3]], a[[1, 1, 1]]);
}

#[test]
fn idempotent_without_mutation() {
    init_logs();
    let mut once = Array3::<f64>::from_shape_fn((5, 4, 6), |(i, j, k)| {
        (i * 100 + j * 10 + k) as f64
    });
    let mut twice = once.clone();

    let mut ex = local_exchanger([true, true, true], ContextDesc::default());
    ex.update_halo(&mut [Field::host3(once.view_mut(), [2, 2, 2])]).unwrap();
    ex.update_halo(&mut [Field::host3(twice.view_mut(), [2, 2, 2])]).unwrap();
    ex.update_halo(&mut [Field::host3(twice.view_mut(), [2, 2, 2])]).unwrap();

    assert_eq!(once, twice);
}

#[test]
fn scratch_is_reused_and_grows_only_on_widening() {
    init_logs();
    let mut ex = local_exchanger([true, true, false], ContextDesc::default());

    let mut a32 = Array2::<f32>::zeros((8, 6));
    ex.update_halo(&mut [Field::host2(a32.view_mut(), [2, 2])]).unwrap();
    let after_first = ex.scratch_allocations();
    assert!(after_first > 0);

    // Identical shapes: no growth.
    ex.update_halo(&mut [Field::host2(a32.view_mut(), [2, 2])]).unwrap();
    assert_eq!(ex.scratch_allocations(), after_first);

    // Wider element type on the same shape: every slot reallocates.
    let mut a64 = Array2::<f64>::zeros((8, 6));
    ex.update_halo(&mut [Field::host2(a64.view_mut(), [2, 2])]).unwrap();
    let after_wide = ex.scratch_allocations();
    assert!(after_wide > after_first);

    // Narrowing back reinterprets in place.
    ex.update_halo(&mut [Field::host2(a32.view_mut(), [2, 2])]).unwrap();
    assert_eq!(ex.scratch_allocations(), after_wide);

    // Tear-down empties the pool; the next call allocates again.
    ex.free_update_halo_buffers();
    ex.update_halo(&mut [Field::host2(a32.view_mut(), [2, 2])]).unwrap();
    assert!(ex.scratch_allocations() > after_wide);
}

fn device_matches_host(desc: ContextDesc) {
    let rt = EmuRuntime::new();
    let shape = (5, 6, 7);
    let host_data = Array3::<f32>::from_shape_fn(shape, |(i, j, k)| {
        (i as f32) * 8193.25 + (j as f32) * 65.5 + k as f32
    });

    let mut host = host_data.clone();
    let dev = DeviceArray::from_host(rt, host_data.view()).unwrap();

    let mut ex = local_exchanger([true, true, true], desc);
    ex.update_halo(&mut [
        Field::host3(host.view_mut(), [2, 2, 2]),
        Field::device(&dev, [2, 2, 2]),
    ])
    .unwrap();

    let downloaded = dev.to_host::<f32>().unwrap();
    // Bit-exact agreement between the device paths and the host engine.
    for (a, b) in host.iter().zip(downloaded.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn staged_device_field_matches_host_reference() {
    init_logs();
    device_matches_host(ContextDesc::default());
}

#[test]
fn device_aware_field_matches_host_reference() {
    init_logs();
    let desc = ContextDesc {
        emu_aware: [true; 3],
        ..ContextDesc::default()
    };
    device_matches_host(desc);
}

#[test]
fn duplicate_field_is_rejected_at_position_two() {
    init_logs();
    let rt = EmuRuntime::new();
    let dev = DeviceArray::zeros(rt, seam::ElemType::F64, [6, 4, 1]).unwrap();
    let mut ex = local_exchanger([true, false, false], ContextDesc::default());
    let err = ex
        .update_halo(&mut [Field::device(&dev, [2, 1, 1]), Field::device(&dev, [2, 1, 1])])
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateField { pos: 2, .. }));
    assert!(err.to_string().contains("position 2"));
}

#[test]
fn field_without_halo_is_rejected() {
    init_logs();
    let mut a = Array2::<f64>::zeros((4, 4));
    let mut ex = local_exchanger([true, true, false], ContextDesc::default());
    let err = ex
        .update_halo(&mut [Field::host2(a.view_mut(), [1, 1])])
        .unwrap_err();
    assert!(matches!(err, Error::NoHalo { pos: 1 }));
}

#[test]
fn mixed_element_types_are_rejected() {
    init_logs();
    let mut a = Array2::<f32>::zeros((6, 4));
    let mut b = Array2::<f64>::zeros((6, 4));
    let mut ex = local_exchanger([true, true, false], ContextDesc::default());
    let err = ex
        .update_halo(&mut [
            Field::host2(a.view_mut(), [2, 1]),
            Field::host2(b.view_mut(), [2, 1]),
        ])
        .unwrap_err();
    assert!(matches!(err, Error::MixedElemTypes { pos: 2, .. }));
    assert!(err.to_string().contains("position 2"));
}

#[test]
fn overlap_reaching_into_the_far_halo_is_rejected() {
    init_logs();
    // Dimension 1 is only two cells wide, so an overlap of 2 would send
    // a halo row.
    let mut a = Array2::<f64>::zeros((6, 2));
    let mut ex = local_exchanger([true, true, false], ContextDesc::default());
    let err = ex
        .update_halo(&mut [Field::host2(a.view_mut(), [1, 2])])
        .unwrap_err();
    assert!(matches!(err, Error::HaloExceedsField { pos: 1, dim: 1 }));
}

#[test]
fn fields_on_distinct_runtimes_are_rejected() {
    init_logs();
    let rt_a = EmuRuntime::new();
    let rt_b = EmuRuntime::new();
    let a = DeviceArray::zeros(rt_a, seam::ElemType::F32, [6, 4, 1]).unwrap();
    let b = DeviceArray::zeros(rt_b, seam::ElemType::F32, [6, 4, 1]).unwrap();
    let mut ex = local_exchanger([true, false, false], ContextDesc::default());
    let err = ex
        .update_halo(&mut [Field::device(&a, [2, 1, 1]), Field::device(&b, [2, 1, 1])])
        .unwrap_err();
    assert!(matches!(err, Error::MixedRuntimes { pos: 2 }));
    assert!(err.to_string().contains("position 2"));
}

#[test]
fn incoherent_neighbours_are_fatal() {
    init_logs();
    // Low side loops back to this rank, high side points elsewhere.
    let topo = Topology::new(0, [[Some(0), Some(1)], [None, None], [None, None]]);
    let transport = LoopbackFabric::endpoints(2).swap_remove(0);
    let mut ex = Exchanger::new(topo, transport, ContextDesc::default());
    let mut a = Array1::<f64>::zeros(8);
    let err = ex
        .update_halo(&mut [Field::host1(a.view_mut(), 2)])
        .unwrap_err();
    assert!(matches!(err, Error::IncoherentNeighbors { dim: 0 }));
}

#[test]
fn randomized_shapes_match_reference() {
    init_logs();
    let mut rng = StdRng::seed_from_u64(0x5ea3);
    for round in 0..40 {
        let ndim = rng.gen_range(1..=3usize);
        let shape: Vec<usize> = (0..ndim).map(|_| rng.gen_range(4..=9)).collect();

        if rng.gen_bool(0.5) {
            run_random_round::<f32>(&mut rng, ndim, &shape, round);
        } else {
            run_random_round::<f64>(&mut rng, ndim, &shape, round);
        }
    }
}

fn run_random_round<T>(rng: &mut StdRng, ndim: usize, shape: &[usize], round: usize)
where
    T: seam::Elem + From<u16> + PartialEq + std::fmt::Debug,
{
    let total: usize = shape.iter().product();
    let data: Vec<T> = (0..total).map(|_| T::from(rng.gen::<u16>())).collect();

    let mut padded = [1usize; 3];
    padded[..ndim].copy_from_slice(shape);
    let mut ol = [1usize; 3];
    for d in 0..ndim {
        ol[d] = if rng.gen_bool(0.8) { 2 } else { 1 };
    }
    if ol.iter().all(|&o| o < 2) {
        ol[0] = 2;
    }

    let mut reference = data.clone();
    reference_exchange(&mut reference, padded, ol);

    let mut ex = local_exchanger([true, true, true], ContextDesc::default());
    let mut got = data.clone();
    match ndim {
        1 => {
            let mut a = Array1::from_shape_vec(shape[0], got).unwrap();
            ex.update_halo(&mut [Field::host1(a.view_mut(), ol[0])]).unwrap();
            got = a.into_raw_vec_and_offset().0;
        }
        2 => {
            let mut a = Array2::from_shape_vec((shape[0], shape[1]), got).unwrap();
            ex.update_halo(&mut [Field::host2(a.view_mut(), [ol[0], ol[1]])]).unwrap();
            got = a.into_raw_vec_and_offset().0;
        }
        _ => {
            let mut a = Array3::from_shape_vec((shape[0], shape[1], shape[2]), got).unwrap();
            ex.update_halo(&mut [Field::host3(a.view_mut(), ol)]).unwrap();
            got = a.into_raw_vec_and_offset().0;
        }
    }
    assert_eq!(got, reference, "round {round}: shape {shape:?} ol {ol:?}");
}
