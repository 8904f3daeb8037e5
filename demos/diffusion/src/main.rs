//! 2-D heat diffusion on a periodic domain, one process.
//!
//! The stencil only ever reads its one-plane halo; every step refreshes
//! it through the exchanger, exactly as a multi-rank run would.

use ndarray::Array2;

use seam::transport::LoopbackFabric;
use seam::{ContextDesc, Exchanger, Field, Topology};

// ── simulation parameters ────────────────────────────────────────────

const NX: usize = 128;
const NY: usize = 128;
const STEPS: usize = 500;
const REPORT_EVERY: usize = 50;

/// Halo overlap: one ghost plane on each side.
const OL: usize = 2;

/// Diffusion number; ≤ 0.25 keeps the explicit 2-D scheme stable.
const ALPHA: f64 = 0.2;

fn main() {
    env_logger::init();

    let transport = LoopbackFabric::endpoints(1).pop().expect("one endpoint");
    let topo = Topology::cartesian([1, 1, 1], [true, true, false], 0);
    let mut exchanger = Exchanger::new(topo, transport, ContextDesc::from_env());

    // Hot square in the middle of an otherwise cold domain.
    let mut t = Array2::<f64>::zeros((NX, NY));
    for i in NX / 2 - 8..NX / 2 + 8 {
        for j in NY / 2 - 8..NY / 2 + 8 {
            t[[i, j]] = 100.0;
        }
    }
    let mut t_new = t.clone();

    println!("grid {NX}x{NY}, {STEPS} steps, alpha {ALPHA}");

    for step in 0..STEPS {
        exchanger
            .update_halo(&mut [Field::host2(t.view_mut(), [OL, OL])])
            .expect("halo update");

        for i in 1..NX - 1 {
            for j in 1..NY - 1 {
                t_new[[i, j]] = t[[i, j]]
                    + ALPHA
                        * (t[[i - 1, j]] + t[[i + 1, j]] + t[[i, j - 1]] + t[[i, j + 1]]
                            - 4.0 * t[[i, j]]);
            }
        }
        std::mem::swap(&mut t, &mut t_new);

        if (step + 1) % REPORT_EVERY == 0 {
            let total: f64 = t.iter().sum();
            let peak = t.iter().cloned().fold(f64::MIN, f64::max);
            println!(
                "step {:4}  T[centre] = {:8.4}  peak = {:8.4}  sum = {:10.2}",
                step + 1,
                t[[NX / 2, NY / 2]],
                peak,
                total
            );
        }
    }

    println!("\ndone; scratch allocations: {}", exchanger.scratch_allocations());
    exchanger.free_update_halo_buffers();
}
