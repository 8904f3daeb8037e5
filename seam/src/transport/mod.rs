//! Non-blocking point-to-point message passing.
//!
//! A halo message is a contiguous run of raw element bytes under a fixed
//! tag; both peers agree on length and element type by construction.
//! Implementations deliver into host memory or, on device-aware paths,
//! straight into device allocations.

mod loopback;

#[cfg(feature = "mpi")]
mod mpi;

pub use loopback::{LoopbackFabric, LoopbackTransport};

#[cfg(feature = "mpi")]
pub use self::mpi::MpiTransport;

use std::sync::Arc;

use crate::device::{DeviceBufferKey, DeviceRuntime};
use crate::topology::Rank;
use crate::Error;

pub type Tag = i32;

/// The tag all halo messages travel under.
pub const HALO_TAG: Tag = 0;

/// Source of an outgoing message.
pub enum BufRef<'a> {
    Host(&'a [u8]),
    Device {
        runtime: &'a Arc<dyn DeviceRuntime>,
        buf: DeviceBufferKey,
        len: usize,
    },
}

impl BufRef<'_> {
    pub fn len(&self) -> usize {
        match self {
            BufRef::Host(b) => b.len(),
            BufRef::Device { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Destination of an incoming message.
pub enum BufMut<'a> {
    Host(&'a mut [u8]),
    Device {
        runtime: &'a Arc<dyn DeviceRuntime>,
        buf: DeviceBufferKey,
        len: usize,
    },
}

impl BufMut<'_> {
    pub fn len(&self) -> usize {
        match self {
            BufMut::Host(b) => b.len(),
            BufMut::Device { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Point-to-point transport. Requests never outlive the exchange call
/// that created them.
pub trait Transport {
    type SendReq;
    type RecvReq;

    /// Posts a receive of `len` bytes from `from`. Delivery happens at
    /// [`wait_recv`](Transport::wait_recv).
    fn irecv(&mut self, from: Rank, tag: Tag, len: usize) -> Result<Self::RecvReq, Error>;

    /// Posts a send. The source may be read eagerly; the request completes
    /// at [`wait_send`](Transport::wait_send) at the latest.
    fn isend(&mut self, to: Rank, tag: Tag, src: BufRef<'_>) -> Result<Self::SendReq, Error>;

    /// Blocks until the message arrived and lands it in `dst`.
    fn wait_recv(&mut self, req: Self::RecvReq, dst: BufMut<'_>) -> Result<(), Error>;

    /// Blocks until the send buffer may be reused.
    fn wait_send(&mut self, req: Self::SendReq) -> Result<(), Error>;
}
