//! AMD backend over the HIP runtime API.
//!
//! Binds the dozen entry points the exchanger needs directly. Packing is
//! always device-side (a strided 3-D copy into the flat scratch buffer)
//! followed by a flat async copy through the pinned mirror when the
//! transport is not device-aware; this backend never moves a strided
//! plane straight to host memory.

use std::ffi::c_void;
use std::sync::Mutex;

use slotmap::SlotMap;

use super::{DeviceBufferKey, DeviceFieldDesc, DeviceKind, DeviceRuntime, DeviceStreamKey, HostPtr};
use crate::range::Plane;
use crate::Error;

#[allow(non_camel_case_types, non_snake_case, dead_code)]
mod sys {
    use std::ffi::c_void;

    pub type hipError_t = i32;
    pub type hipStream_t = *mut c_void;

    pub const HIP_SUCCESS: hipError_t = 0;
    pub const HIP_STREAM_NON_BLOCKING: u32 = 1;
    pub const HIP_HOST_REGISTER_PORTABLE: u32 = 1;

    pub const HIP_MEMCPY_HOST_TO_DEVICE: u32 = 1;
    pub const HIP_MEMCPY_DEVICE_TO_HOST: u32 = 2;
    pub const HIP_MEMCPY_DEVICE_TO_DEVICE: u32 = 3;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct hipPitchedPtr {
        pub ptr: *mut c_void,
        pub pitch: usize,
        pub xsize: usize,
        pub ysize: usize,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct hipPos {
        pub x: usize,
        pub y: usize,
        pub z: usize,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct hipExtent {
        pub width: usize,
        pub height: usize,
        pub depth: usize,
    }

    #[repr(C)]
    pub struct hipMemcpy3DParms {
        pub srcArray: *mut c_void,
        pub srcPos: hipPos,
        pub srcPtr: hipPitchedPtr,
        pub dstArray: *mut c_void,
        pub dstPos: hipPos,
        pub dstPtr: hipPitchedPtr,
        pub extent: hipExtent,
        pub kind: u32,
    }

    #[link(name = "amdhip64")]
    extern "C" {
        pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> hipError_t;
        pub fn hipFree(ptr: *mut c_void) -> hipError_t;
        pub fn hipMemset(ptr: *mut c_void, value: i32, size: usize) -> hipError_t;
        pub fn hipMemcpy(
            dst: *mut c_void,
            src: *const c_void,
            size: usize,
            kind: u32,
        ) -> hipError_t;
        pub fn hipMemcpyAsync(
            dst: *mut c_void,
            src: *const c_void,
            size: usize,
            kind: u32,
            stream: hipStream_t,
        ) -> hipError_t;
        pub fn hipMemcpy3DAsync(params: *const hipMemcpy3DParms, stream: hipStream_t)
            -> hipError_t;
        pub fn hipStreamCreateWithPriority(
            stream: *mut hipStream_t,
            flags: u32,
            priority: i32,
        ) -> hipError_t;
        pub fn hipStreamDestroy(stream: hipStream_t) -> hipError_t;
        pub fn hipStreamSynchronize(stream: hipStream_t) -> hipError_t;
        pub fn hipDeviceGetStreamPriorityRange(
            least: *mut i32,
            greatest: *mut i32,
        ) -> hipError_t;
        pub fn hipHostRegister(ptr: *mut c_void, size: usize, flags: u32) -> hipError_t;
        pub fn hipHostUnregister(ptr: *mut c_void) -> hipError_t;
        pub fn hipSetDevice(device: i32) -> hipError_t;
    }
}

fn check(what: &str, code: sys::hipError_t) -> Result<(), Error> {
    if code == sys::HIP_SUCCESS {
        Ok(())
    } else {
        Err(Error::Device(format!("hip: {what} failed with code {code}")))
    }
}

struct Buf {
    ptr: *mut c_void,
    bytes: usize,
}

unsafe impl Send for Buf {}
unsafe impl Sync for Buf {}

struct Stream(sys::hipStream_t);

unsafe impl Send for Stream {}
unsafe impl Sync for Stream {}

pub struct RocmRuntime {
    bufs: Mutex<SlotMap<DeviceBufferKey, Buf>>,
    streams: Mutex<SlotMap<DeviceStreamKey, Stream>>,
    stream_priority: i32,
}

impl RocmRuntime {
    pub fn new(ordinal: i32) -> Result<std::sync::Arc<Self>, Error> {
        unsafe { check("hipSetDevice", sys::hipSetDevice(ordinal)) }?;
        let mut least = 0;
        let mut greatest = 0;
        unsafe {
            check(
                "hipDeviceGetStreamPriorityRange",
                sys::hipDeviceGetStreamPriorityRange(&mut least, &mut greatest),
            )
        }?;
        log::debug!("rocm runtime up on device {ordinal}");
        Ok(std::sync::Arc::new(Self {
            bufs: Mutex::new(SlotMap::with_key()),
            streams: Mutex::new(SlotMap::with_key()),
            stream_priority: greatest,
        }))
    }

    fn buf_ptr(&self, key: DeviceBufferKey, need: usize) -> Result<*mut c_void, Error> {
        let bufs = self.bufs.lock().unwrap();
        let buf = bufs
            .get(key)
            .ok_or_else(|| Error::Device("unknown hip buffer handle".into()))?;
        if need > buf.bytes {
            return Err(Error::Device("hip buffer too small for operation".into()));
        }
        Ok(buf.ptr)
    }

    fn raw_stream(&self, key: DeviceStreamKey) -> Result<sys::hipStream_t, Error> {
        let streams = self.streams.lock().unwrap();
        streams
            .get(key)
            .map(|s| s.0)
            .ok_or_else(|| Error::Device("unknown hip stream handle".into()))
    }

    /// Device-side strided plane copy between the field and the flat
    /// scratch buffer, expressed as a 3-D async copy.
    fn plane_3d(
        &self,
        field: &DeviceFieldDesc,
        plane: Plane,
        flat: *mut c_void,
        pack: bool,
        stream: sys::hipStream_t,
    ) -> Result<(), Error> {
        let es = field.elem.size();
        let field_ptr = self.buf_ptr(field.buf, field.shape.iter().product::<usize>() * es)?;
        let strided = sys::hipPitchedPtr {
            ptr: field_ptr,
            pitch: field.shape[2] * es,
            xsize: field.shape[2] * es,
            ysize: field.shape[1],
        };
        let contiguous = sys::hipPitchedPtr {
            ptr: flat,
            pitch: plane.extent[2] * es,
            xsize: plane.extent[2] * es,
            ysize: plane.extent[1],
        };
        let strided_pos = sys::hipPos {
            x: plane.start[2] * es,
            y: plane.start[1],
            z: plane.start[0],
        };
        let origin = sys::hipPos { x: 0, y: 0, z: 0 };
        let params = sys::hipMemcpy3DParms {
            srcArray: std::ptr::null_mut(),
            srcPos: if pack { strided_pos } else { origin },
            srcPtr: if pack { strided } else { contiguous },
            dstArray: std::ptr::null_mut(),
            dstPos: if pack { origin } else { strided_pos },
            dstPtr: if pack { contiguous } else { strided },
            extent: sys::hipExtent {
                width: plane.extent[2] * es,
                height: plane.extent[1],
                depth: plane.extent[0],
            },
            kind: sys::HIP_MEMCPY_DEVICE_TO_DEVICE,
        };
        unsafe { check("hipMemcpy3DAsync", sys::hipMemcpy3DAsync(&params, stream)) }
    }
}

impl std::fmt::Debug for RocmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocmRuntime").finish()
    }
}

impl Drop for RocmRuntime {
    fn drop(&mut self) {
        for (_, stream) in self.streams.lock().unwrap().drain() {
            unsafe {
                let _ = sys::hipStreamDestroy(stream.0);
            }
        }
        for (_, buf) in self.bufs.lock().unwrap().drain() {
            unsafe {
                let _ = sys::hipFree(buf.ptr);
            }
        }
    }
}

impl DeviceRuntime for RocmRuntime {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Rocm
    }

    fn alloc(&self, bytes: usize) -> Result<DeviceBufferKey, Error> {
        let bytes = bytes.max(1);
        let mut ptr = std::ptr::null_mut();
        unsafe {
            check("hipMalloc", sys::hipMalloc(&mut ptr, bytes))?;
            check("hipMemset", sys::hipMemset(ptr, 0, bytes))?;
        }
        Ok(self.bufs.lock().unwrap().insert(Buf { ptr, bytes }))
    }

    fn free(&self, buf: DeviceBufferKey) {
        if let Some(buf) = self.bufs.lock().unwrap().remove(buf) {
            unsafe {
                let _ = sys::hipFree(buf.ptr);
            }
        }
    }

    fn upload(&self, buf: DeviceBufferKey, offset: usize, src: &[u8]) -> Result<(), Error> {
        let ptr = self.buf_ptr(buf, offset + src.len())?;
        unsafe {
            check(
                "hipMemcpy",
                sys::hipMemcpy(
                    ptr.add(offset),
                    src.as_ptr() as *const c_void,
                    src.len(),
                    sys::HIP_MEMCPY_HOST_TO_DEVICE,
                ),
            )
        }
    }

    fn download(&self, buf: DeviceBufferKey, offset: usize, dst: &mut [u8]) -> Result<(), Error> {
        let ptr = self.buf_ptr(buf, offset + dst.len())?;
        unsafe {
            check(
                "hipMemcpy",
                sys::hipMemcpy(
                    dst.as_mut_ptr() as *mut c_void,
                    ptr.add(offset) as *const c_void,
                    dst.len(),
                    sys::HIP_MEMCPY_DEVICE_TO_HOST,
                ),
            )
        }
    }

    fn device_ptr(&self, buf: DeviceBufferKey) -> Result<*mut u8, Error> {
        Ok(self.buf_ptr(buf, 0)? as *mut u8)
    }

    fn create_stream(&self) -> Result<DeviceStreamKey, Error> {
        let mut stream = std::ptr::null_mut();
        unsafe {
            check(
                "hipStreamCreateWithPriority",
                sys::hipStreamCreateWithPriority(
                    &mut stream,
                    sys::HIP_STREAM_NON_BLOCKING,
                    self.stream_priority,
                ),
            )
        }?;
        Ok(self.streams.lock().unwrap().insert(Stream(stream)))
    }

    fn destroy_stream(&self, stream: DeviceStreamKey) {
        if let Some(stream) = self.streams.lock().unwrap().remove(stream) {
            unsafe {
                let _ = sys::hipStreamDestroy(stream.0);
            }
        }
    }

    fn sync_stream(&self, stream: DeviceStreamKey) -> Result<(), Error> {
        let raw = self.raw_stream(stream)?;
        unsafe { check("hipStreamSynchronize", sys::hipStreamSynchronize(raw)) }
    }

    fn host_register(&self, ptr: *mut u8, len: usize) -> Result<(), Error> {
        unsafe {
            check(
                "hipHostRegister",
                sys::hipHostRegister(
                    ptr as *mut c_void,
                    len,
                    sys::HIP_HOST_REGISTER_PORTABLE,
                ),
            )
        }
    }

    fn host_unregister(&self, ptr: *mut u8) {
        unsafe {
            let _ = sys::hipHostUnregister(ptr as *mut c_void);
        }
    }

    fn copy_d2d(
        &self,
        src: DeviceBufferKey,
        dst: DeviceBufferKey,
        bytes: usize,
    ) -> Result<(), Error> {
        let src = self.buf_ptr(src, bytes)?;
        let dst = self.buf_ptr(dst, bytes)?;
        unsafe {
            check(
                "hipMemcpy",
                sys::hipMemcpy(dst, src as *const c_void, bytes, sys::HIP_MEMCPY_DEVICE_TO_DEVICE),
            )
        }
    }

    fn copy_d2h_async(
        &self,
        src: DeviceBufferKey,
        bytes: usize,
        dst: HostPtr,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        let src = self.buf_ptr(src, bytes)?;
        let stream = self.raw_stream(stream)?;
        unsafe {
            check(
                "hipMemcpyAsync",
                sys::hipMemcpyAsync(
                    dst.0 as *mut c_void,
                    src as *const c_void,
                    bytes,
                    sys::HIP_MEMCPY_DEVICE_TO_HOST,
                    stream,
                ),
            )
        }
    }

    fn copy_h2d_async(
        &self,
        src: HostPtr,
        dst: DeviceBufferKey,
        bytes: usize,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        let dst = self.buf_ptr(dst, bytes)?;
        let stream = self.raw_stream(stream)?;
        unsafe {
            check(
                "hipMemcpyAsync",
                sys::hipMemcpyAsync(
                    dst,
                    src.0 as *const c_void,
                    bytes,
                    sys::HIP_MEMCPY_HOST_TO_DEVICE,
                    stream,
                ),
            )
        }
    }

    fn pack_plane(
        &self,
        field: &DeviceFieldDesc,
        _dim: usize,
        plane: Plane,
        dst: DeviceBufferKey,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        let flat = self.buf_ptr(dst, plane.len() * field.elem.size())?;
        let stream = self.raw_stream(stream)?;
        self.plane_3d(field, plane, flat, true, stream)
    }

    fn unpack_plane(
        &self,
        src: DeviceBufferKey,
        field: &DeviceFieldDesc,
        _dim: usize,
        plane: Plane,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        let flat = self.buf_ptr(src, plane.len() * field.elem.size())?;
        let stream = self.raw_stream(stream)?;
        self.plane_3d(field, plane, flat, false, stream)
    }

    // supports_staged_3d stays false: strided planes never cross to the
    // host directly on this backend.
}
