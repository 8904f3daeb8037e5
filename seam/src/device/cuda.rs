//! Nvidia backend over the CUDA driver API.
//!
//! Pack/unpack kernels are compiled at runtime with NVRTC, one pair per
//! element width, so the module needs no toolkit at build time. Staged
//! traffic for planes that are not fully strided goes through the
//! driver's 3-D memcpy between the array and the pinned mirror.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cudarc::driver::{
    result, sys, CudaDevice, CudaFunction, CudaSlice, CudaStream, DevicePtr, LaunchAsync,
    LaunchConfig,
};
use cudarc::nvrtc::compile_ptx;
use slotmap::SlotMap;

use super::{DeviceBufferKey, DeviceFieldDesc, DeviceKind, DeviceRuntime, DeviceStreamKey, HostPtr};
use crate::range::{fast_axis, Plane};
use crate::Error;

const MODULE: &str = "seam_halo";

/// One pack and one unpack kernel per element width; elements are moved
/// as opaque words, so five element types need three kernel pairs.
const KERNELS: &str = r#"
typedef unsigned short u16;
typedef unsigned int u32;
typedef unsigned long long u64;

#define PLANE_OP(NAME, T, LOAD, STORE)                                      \
extern "C" __global__ void NAME(                                            \
    const T* __restrict__ a, T* __restrict__ b,                             \
    long long n1, long long n2,                                             \
    long long s0, long long s1, long long s2,                               \
    long long e0, long long e1, long long e2)                               \
{                                                                           \
    long long i2 = blockIdx.x * (long long)blockDim.x + threadIdx.x;        \
    long long i1 = blockIdx.y * (long long)blockDim.y + threadIdx.y;        \
    long long i0 = blockIdx.z * (long long)blockDim.z + threadIdx.z;        \
    if (i0 >= e0 || i1 >= e1 || i2 >= e2) return;                           \
    long long strided = ((s0 + i0) * n1 + (s1 + i1)) * n2 + (s2 + i2);      \
    long long flat = (i0 * e1 + i1) * e2 + i2;                              \
    STORE = LOAD;                                                           \
}

PLANE_OP(pack_u16, u16, a[strided], b[flat])
PLANE_OP(pack_u32, u32, a[strided], b[flat])
PLANE_OP(pack_u64, u64, a[strided], b[flat])
PLANE_OP(unpack_u16, u16, a[flat], b[strided])
PLANE_OP(unpack_u32, u32, a[flat], b[strided])
PLANE_OP(unpack_u64, u64, a[flat], b[strided])
"#;

fn kernel_name(pack: bool, elem_size: usize) -> &'static str {
    match (pack, elem_size) {
        (true, 2) => "pack_u16",
        (true, 4) => "pack_u32",
        (true, 8) => "pack_u64",
        (false, 2) => "unpack_u16",
        (false, 4) => "unpack_u32",
        (false, 8) => "unpack_u64",
        _ => unreachable!("unsupported element width"),
    }
}

/// Thread-block shape per the plane layout: planes orthogonal to the
/// fast axis touch one element per thread and coalesce on the middle
/// coordinate, everything else coalesces along the fast axis.
fn launch_config(dim: usize, shape: [usize; 3], plane: Plane) -> LaunchConfig {
    let block: (u32, u32, u32) = if dim == fast_axis(shape) {
        (1, 32, 1)
    } else {
        (32, 1, 1)
    };
    let grid = (
        (plane.extent[2] as u32).div_ceil(block.0),
        (plane.extent[1] as u32).div_ceil(block.1),
        (plane.extent[0] as u32).div_ceil(block.2),
    );
    LaunchConfig {
        grid_dim: grid,
        block_dim: block,
        shared_mem_bytes: 0,
    }
}

fn drv(e: impl std::fmt::Debug) -> Error {
    Error::Device(format!("cuda: {e:?}"))
}

fn cu_check(what: &str, rc: sys::CUresult) -> Result<(), Error> {
    if rc == sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(Error::Device(format!("cuda: {what} failed: {rc:?}")))
    }
}

pub struct CudaRuntime {
    dev: Arc<CudaDevice>,
    funcs: HashMap<&'static str, CudaFunction>,
    bufs: Mutex<SlotMap<DeviceBufferKey, CudaSlice<u8>>>,
    streams: Mutex<SlotMap<DeviceStreamKey, CudaStream>>,
}

impl CudaRuntime {
    /// Binds device `ordinal` and compiles the plane kernels.
    pub fn new(ordinal: usize) -> Result<Arc<Self>, Error> {
        let dev = CudaDevice::new(ordinal).map_err(drv)?;
        let ptx = compile_ptx(KERNELS).map_err(drv)?;
        let names: Vec<&'static str> = [2, 4, 8]
            .iter()
            .flat_map(|&w| [kernel_name(true, w), kernel_name(false, w)])
            .collect();
        dev.load_ptx(ptx, MODULE, &names).map_err(drv)?;
        let mut funcs = HashMap::new();
        for name in names {
            let func = dev
                .get_func(MODULE, name)
                .ok_or_else(|| Error::Device(format!("cuda: kernel {name} missing")))?;
            funcs.insert(name, func);
        }
        log::debug!("cuda runtime up on device {ordinal}");
        Ok(Arc::new(Self {
            dev,
            funcs,
            bufs: Mutex::new(SlotMap::with_key()),
            streams: Mutex::new(SlotMap::with_key()),
        }))
    }

    fn buf_ptr(&self, key: DeviceBufferKey) -> Result<sys::CUdeviceptr, Error> {
        let bufs = self.bufs.lock().unwrap();
        let slice = bufs
            .get(key)
            .ok_or_else(|| Error::Device("unknown cuda buffer handle".into()))?;
        Ok(*slice.device_ptr())
    }

    fn raw_stream(&self, key: DeviceStreamKey) -> Result<sys::CUstream, Error> {
        let streams = self.streams.lock().unwrap();
        let stream = streams
            .get(key)
            .ok_or_else(|| Error::Device("unknown cuda stream handle".into()))?;
        Ok(stream.stream)
    }

    fn launch_plane(
        &self,
        pack: bool,
        field: &DeviceFieldDesc,
        dim: usize,
        plane: Plane,
        flat: DeviceBufferKey,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        let func = self.funcs[kernel_name(pack, field.elem.size())].clone();
        let cfg = launch_config(dim, field.shape, plane);
        let field_ptr = self.buf_ptr(field.buf)?;
        let flat_ptr = self.buf_ptr(flat)?;
        let (a, b) = if pack {
            (field_ptr, flat_ptr)
        } else {
            (flat_ptr, field_ptr)
        };
        let streams = self.streams.lock().unwrap();
        let stream = streams
            .get(stream)
            .ok_or_else(|| Error::Device("unknown cuda stream handle".into()))?;
        unsafe {
            func.launch_on_stream(
                stream,
                cfg,
                (
                    a,
                    b,
                    field.shape[1] as i64,
                    field.shape[2] as i64,
                    plane.start[0] as i64,
                    plane.start[1] as i64,
                    plane.start[2] as i64,
                    plane.extent[0] as i64,
                    plane.extent[1] as i64,
                    plane.extent[2] as i64,
                ),
            )
        }
        .map_err(drv)
    }

    /// Strided plane copy between the device array and pinned host
    /// memory, expressed as one driver 3-D memcpy. Pitches follow the
    /// field's fast-axis extent on the device side and the plane's run
    /// length on the host side.
    fn memcpy3d_staged(
        &self,
        field: &DeviceFieldDesc,
        plane: Plane,
        host: HostPtr,
        to_host: bool,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        let es = field.elem.size();
        let dev_ptr = self.buf_ptr(field.buf)?;
        let stream = self.raw_stream(stream)?;

        let mut desc: sys::CUDA_MEMCPY3D = unsafe { std::mem::zeroed() };
        desc.WidthInBytes = plane.extent[2] * es;
        desc.Height = plane.extent[1];
        desc.Depth = plane.extent[0];
        if to_host {
            desc.srcMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_DEVICE;
            desc.srcDevice = dev_ptr;
            desc.srcPitch = field.shape[2] * es;
            desc.srcHeight = field.shape[1];
            desc.srcXInBytes = plane.start[2] * es;
            desc.srcY = plane.start[1];
            desc.srcZ = plane.start[0];
            desc.dstMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_HOST;
            desc.dstHost = host.0 as *mut std::ffi::c_void;
            desc.dstPitch = plane.extent[2] * es;
            desc.dstHeight = plane.extent[1];
        } else {
            desc.srcMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_HOST;
            desc.srcHost = host.0 as *const std::ffi::c_void;
            desc.srcPitch = plane.extent[2] * es;
            desc.srcHeight = plane.extent[1];
            desc.dstMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_DEVICE;
            desc.dstDevice = dev_ptr;
            desc.dstPitch = field.shape[2] * es;
            desc.dstHeight = field.shape[1];
            desc.dstXInBytes = plane.start[2] * es;
            desc.dstY = plane.start[1];
            desc.dstZ = plane.start[0];
        }
        let rc = unsafe { sys::lib().cuMemcpy3DAsync_v2(&desc, stream) };
        cu_check("cuMemcpy3DAsync", rc)
    }
}

impl std::fmt::Debug for CudaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaRuntime")
            .field("device", &self.dev.ordinal())
            .finish()
    }
}

impl DeviceRuntime for CudaRuntime {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cuda
    }

    fn alloc(&self, bytes: usize) -> Result<DeviceBufferKey, Error> {
        let slice = self.dev.alloc_zeros::<u8>(bytes.max(1)).map_err(drv)?;
        Ok(self.bufs.lock().unwrap().insert(slice))
    }

    fn free(&self, buf: DeviceBufferKey) {
        self.bufs.lock().unwrap().remove(buf);
    }

    fn upload(&self, buf: DeviceBufferKey, offset: usize, src: &[u8]) -> Result<(), Error> {
        let ptr = self.buf_ptr(buf)? + offset as u64;
        unsafe { result::memcpy_htod_sync(ptr, src) }.map_err(drv)
    }

    fn download(&self, buf: DeviceBufferKey, offset: usize, dst: &mut [u8]) -> Result<(), Error> {
        let ptr = self.buf_ptr(buf)? + offset as u64;
        unsafe { result::memcpy_dtoh_sync(dst, ptr) }.map_err(drv)
    }

    fn device_ptr(&self, buf: DeviceBufferKey) -> Result<*mut u8, Error> {
        Ok(self.buf_ptr(buf)? as *mut u8)
    }

    fn create_stream(&self) -> Result<DeviceStreamKey, Error> {
        let stream = self.dev.fork_default_stream().map_err(drv)?;
        Ok(self.streams.lock().unwrap().insert(stream))
    }

    fn destroy_stream(&self, stream: DeviceStreamKey) {
        self.streams.lock().unwrap().remove(stream);
    }

    fn sync_stream(&self, stream: DeviceStreamKey) -> Result<(), Error> {
        let raw = self.raw_stream(stream)?;
        unsafe { result::stream::synchronize(raw) }.map_err(drv)
    }

    fn host_register(&self, ptr: *mut u8, len: usize) -> Result<(), Error> {
        let rc = unsafe { sys::lib().cuMemHostRegister_v2(ptr as *mut std::ffi::c_void, len, 0) };
        cu_check("cuMemHostRegister", rc)
    }

    fn host_unregister(&self, ptr: *mut u8) {
        unsafe {
            let _ = sys::lib().cuMemHostUnregister(ptr as *mut std::ffi::c_void);
        }
    }

    fn copy_d2d(
        &self,
        src: DeviceBufferKey,
        dst: DeviceBufferKey,
        bytes: usize,
    ) -> Result<(), Error> {
        let src = self.buf_ptr(src)?;
        let dst = self.buf_ptr(dst)?;
        unsafe { result::memcpy_dtod_sync(dst, src, bytes) }.map_err(drv)
    }

    fn copy_d2h_async(
        &self,
        src: DeviceBufferKey,
        bytes: usize,
        dst: HostPtr,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        let src = self.buf_ptr(src)?;
        let stream = self.raw_stream(stream)?;
        let dst = unsafe { std::slice::from_raw_parts_mut(dst.0, bytes) };
        unsafe { result::memcpy_dtoh_async(dst, src, stream) }.map_err(drv)
    }

    fn copy_h2d_async(
        &self,
        src: HostPtr,
        dst: DeviceBufferKey,
        bytes: usize,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        let dst = self.buf_ptr(dst)?;
        let stream = self.raw_stream(stream)?;
        let src = unsafe { std::slice::from_raw_parts(src.0 as *const u8, bytes) };
        unsafe { result::memcpy_htod_async(dst, src, stream) }.map_err(drv)
    }

    fn pack_plane(
        &self,
        field: &DeviceFieldDesc,
        dim: usize,
        plane: Plane,
        dst: DeviceBufferKey,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        self.launch_plane(true, field, dim, plane, dst, stream)
    }

    fn unpack_plane(
        &self,
        src: DeviceBufferKey,
        field: &DeviceFieldDesc,
        dim: usize,
        plane: Plane,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        self.launch_plane(false, field, dim, plane, src, stream)
    }

    fn supports_staged_3d(&self) -> bool {
        true
    }

    fn staged_pack(
        &self,
        field: &DeviceFieldDesc,
        plane: Plane,
        dst: HostPtr,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        self.memcpy3d_staged(field, plane, dst, true, stream)
    }

    fn staged_unpack(
        &self,
        src: HostPtr,
        field: &DeviceFieldDesc,
        plane: Plane,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        self.memcpy3d_staged(field, plane, src, false, stream)
    }
}
