//! Halo exchange for implicit global grids.
//!
//! A Cartesian process decomposition gives every subdomain a one-plane
//! halo mirroring its neighbours' interiors. [`Exchanger::update_halo`]
//! refreshes those halos for a set of co-located fields each stencil
//! iteration: per dimension it packs boundary planes into persistent
//! scratch, posts non-blocking messages (or loops them back locally for
//! periodic single-process dimensions) and unpacks arriving planes,
//! overlapping packs, transfers and unpacks across fields and sides.
//!
//! Fields live in host memory (`ndarray` views) or on a GPU behind a
//! [`device::DeviceRuntime`]; device traffic either goes to the wire
//! directly (device-aware transport) or is staged through pinned host
//! mirrors.

pub mod device;
pub mod exchange;
pub mod field;
pub mod range;
pub mod topology;
pub mod transport;

mod copy;
mod pool;
mod task;

pub use exchange::Exchanger;
pub use field::{DeviceArray, Elem, ElemType, Field};
pub use topology::{Rank, Side, Topology};

use device::DeviceKind;

/// Dimensionality of the process grid.
pub const NDIMS: usize = 3;

/// Neighbours per dimension (one per side).
pub const NNEIGHBORS_PER_DIM: usize = 2;

/// Scratch capacity is rounded up to this many elements, chosen so that
/// a slot allocated for the smallest element type is always viewable as
/// the largest one.
pub const ALLOC_GRANULARITY: usize = 4;

/// Contiguous host copies at or above this many elements run on the
/// rayon pool; below it a plain copy wins.
pub const THREAD_COPY_THRESHOLD: usize = 32768;

/// Construction-time knobs of an [`Exchanger`].
#[derive(Clone, Debug)]
pub struct ContextDesc {
    /// Per-dimension device-aware transport on the Nvidia backend.
    pub cuda_aware: [bool; NDIMS],
    /// Per-dimension device-aware transport on the AMD backend.
    pub rocm_aware: [bool; NDIMS],
    /// Per-dimension device-aware transport on the software backend;
    /// exercised by tests, off in real deployments.
    pub emu_aware: [bool; NDIMS],
    pub thread_copy_threshold: usize,
}

impl Default for ContextDesc {
    fn default() -> Self {
        Self {
            cuda_aware: [false; NDIMS],
            rocm_aware: [false; NDIMS],
            emu_aware: [false; NDIMS],
            thread_copy_threshold: THREAD_COPY_THRESHOLD,
        }
    }
}

impl ContextDesc {
    /// Reads the awareness flags from the environment:
    /// `IGG_CUDAAWARE_MPI` and `IGG_ROCMAWARE_MPI`, either `1` for all
    /// dimensions or a comma list like `1,1,0`. Unset means staged.
    pub fn from_env() -> Self {
        Self {
            cuda_aware: aware_from_env("IGG_CUDAAWARE_MPI"),
            rocm_aware: aware_from_env("IGG_ROCMAWARE_MPI"),
            ..Self::default()
        }
    }

    pub(crate) fn device_aware(&self, kind: DeviceKind, dim: usize) -> bool {
        match kind {
            DeviceKind::Cuda => self.cuda_aware[dim],
            DeviceKind::Rocm => self.rocm_aware[dim],
            DeviceKind::Emu => self.emu_aware[dim],
        }
    }
}

fn aware_from_env(var: &str) -> [bool; NDIMS] {
    match std::env::var(var) {
        Err(_) => [false; NDIMS],
        Ok(v) => {
            let v = v.trim();
            if let Some((a, rest)) = v.split_once(',') {
                let mut flags = [false; NDIMS];
                for (d, part) in std::iter::once(a).chain(rest.split(',')).enumerate() {
                    if d < NDIMS {
                        flags[d] = part.trim() == "1";
                    }
                }
                flags
            } else {
                [v == "1"; NDIMS]
            }
        }
    }
}

/// Everything that can go wrong during an exchange. All of it is fatal:
/// the call either updates every halo or raises before fields change.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("field at position {pos} has no dimension with an overlap of at least 2")]
    NoHalo { pos: usize },

    #[error("field at position {pos} is the same array as the field at position {first}")]
    DuplicateField { pos: usize, first: usize },

    #[error(
        "field at position {pos} has element type {}, but the call uses {}",
        found.name(),
        expected.name()
    )]
    MixedElemTypes {
        pos: usize,
        expected: ElemType,
        found: ElemType,
    },

    #[error("field at position {pos} is too small on dimension {dim} for its overlap")]
    HaloExceedsField { pos: usize, dim: usize },

    #[error("field at position {pos} lives on a different device runtime than the others")]
    MixedRuntimes { pos: usize },

    #[error("incoherent neighbors along dimension {dim}: one side is this rank, the other is not")]
    IncoherentNeighbors { dim: usize },

    #[error("device error: {0}")]
    Device(String),

    #[error("transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aware_env_parses_scalar_and_list() {
        std::env::set_var("SEAM_TEST_AWARE_A", "1");
        assert_eq!(aware_from_env("SEAM_TEST_AWARE_A"), [true; NDIMS]);
        std::env::set_var("SEAM_TEST_AWARE_B", "1,0,1");
        assert_eq!(aware_from_env("SEAM_TEST_AWARE_B"), [true, false, true]);
        std::env::set_var("SEAM_TEST_AWARE_C", "0");
        assert_eq!(aware_from_env("SEAM_TEST_AWARE_C"), [false; NDIMS]);
        assert_eq!(aware_from_env("SEAM_TEST_AWARE_UNSET"), [false; NDIMS]);
    }

    #[test]
    fn duplicate_error_names_the_position() {
        let err = Error::DuplicateField { pos: 2, first: 1 };
        assert!(err.to_string().contains("position 2"));
    }
}
