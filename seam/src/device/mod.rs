//! Device runtimes.
//!
//! The exchanger talks to GPU memory through [`DeviceRuntime`]; each
//! backend lives in its own module behind a feature gate, with the
//! in-process software runtime always available.

mod emu;

#[cfg(feature = "cuda")]
mod cuda;
#[cfg(feature = "rocm")]
mod rocm;

pub use emu::EmuRuntime;

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;
#[cfg(feature = "rocm")]
pub use rocm::RocmRuntime;

use std::fmt;

use slotmap::new_key_type;

use crate::field::ElemType;
use crate::range::Plane;
use crate::{Error, NDIMS};

new_key_type! {
    /// Handle to a device allocation owned by a runtime.
    pub struct DeviceBufferKey;
    /// Handle to an asynchronous execution stream.
    pub struct DeviceStreamKey;
}

/// Which backend a runtime drives. Transport awareness is configured per
/// kind (see `ContextDesc`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Emu,
    Cuda,
    Rocm,
}

/// Shape and storage of a device-resident field, as the plane ops see it.
#[derive(Clone, Copy, Debug)]
pub struct DeviceFieldDesc {
    pub buf: DeviceBufferKey,
    pub elem: ElemType,
    pub shape: [usize; NDIMS],
}

/// A host pointer that may cross into a runtime's worker context.
///
/// The caller guarantees the region stays valid and unaliased until the
/// stream the operation was submitted on has been synchronized.
#[derive(Clone, Copy, Debug)]
pub struct HostPtr(pub *mut u8);

unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

/// The contract between the exchanger and a GPU backend.
///
/// Asynchronous operations are ordered by their stream only; nothing here
/// blocks except `sync_stream`, `upload` and `download`.
pub trait DeviceRuntime: fmt::Debug + Send + Sync {
    fn kind(&self) -> DeviceKind;

    fn alloc(&self, bytes: usize) -> Result<DeviceBufferKey, Error>;
    fn free(&self, buf: DeviceBufferKey);

    /// Blocking host-to-device copy.
    fn upload(&self, buf: DeviceBufferKey, offset: usize, src: &[u8]) -> Result<(), Error>;
    /// Blocking device-to-host copy.
    fn download(&self, buf: DeviceBufferKey, offset: usize, dst: &mut [u8]) -> Result<(), Error>;

    /// Raw address of an allocation, for device-aware transports that
    /// read and write device memory directly. On real GPU backends this
    /// is a device address and must only be dereferenced by the
    /// messaging layer's DMA engines; it stays valid until `free`.
    fn device_ptr(&self, buf: DeviceBufferKey) -> Result<*mut u8, Error>;

    /// Creates a non-blocking, high-priority stream.
    fn create_stream(&self) -> Result<DeviceStreamKey, Error>;
    fn destroy_stream(&self, stream: DeviceStreamKey);
    fn sync_stream(&self, stream: DeviceStreamKey) -> Result<(), Error>;

    /// Page-locks a host region so async copies to and from it are safe
    /// for the backend's DMA engines.
    fn host_register(&self, ptr: *mut u8, len: usize) -> Result<(), Error>;
    fn host_unregister(&self, ptr: *mut u8);

    /// Blocking device-to-device copy between two allocations.
    fn copy_d2d(&self, src: DeviceBufferKey, dst: DeviceBufferKey, bytes: usize)
        -> Result<(), Error>;

    fn copy_d2h_async(
        &self,
        src: DeviceBufferKey,
        bytes: usize,
        dst: HostPtr,
        stream: DeviceStreamKey,
    ) -> Result<(), Error>;

    fn copy_h2d_async(
        &self,
        src: HostPtr,
        dst: DeviceBufferKey,
        bytes: usize,
        stream: DeviceStreamKey,
    ) -> Result<(), Error>;

    /// Linearizes the plane orthogonal to `dim` into the contiguous
    /// buffer `dst`, entirely on the device.
    fn pack_plane(
        &self,
        field: &DeviceFieldDesc,
        dim: usize,
        plane: Plane,
        dst: DeviceBufferKey,
        stream: DeviceStreamKey,
    ) -> Result<(), Error>;

    /// Inverse of `pack_plane`.
    fn unpack_plane(
        &self,
        src: DeviceBufferKey,
        field: &DeviceFieldDesc,
        dim: usize,
        plane: Plane,
        stream: DeviceStreamKey,
    ) -> Result<(), Error>;

    /// Whether the runtime can move a strided plane directly between the
    /// device array and pinned host memory in one async operation. When
    /// false, staged traffic goes plane-on-device first and then through
    /// a flat copy.
    fn supports_staged_3d(&self) -> bool {
        false
    }

    /// Strided plane copy device-to-pinned-host, bypassing the device
    /// scratch buffer.
    fn staged_pack(
        &self,
        _field: &DeviceFieldDesc,
        _plane: Plane,
        _dst: HostPtr,
        _stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        Err(Error::Device("staged plane copy not supported".into()))
    }

    /// Strided plane copy pinned-host-to-device.
    fn staged_unpack(
        &self,
        _src: HostPtr,
        _field: &DeviceFieldDesc,
        _plane: Plane,
        _stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        Err(Error::Device("staged plane copy not supported".into()))
    }
}
