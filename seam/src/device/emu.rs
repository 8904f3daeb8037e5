//! Software device runtime.
//!
//! Device memory is process memory and every stream is a worker thread
//! draining a channel of closures, which keeps the submission/completion
//! semantics of a real driver: submitting never blocks, ordering holds
//! per stream, and `sync_stream` is the only rendezvous. The test suite
//! runs every transport path against this runtime.

use std::cell::UnsafeCell;
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, unbounded, Sender};
use slotmap::SlotMap;

use super::{DeviceBufferKey, DeviceFieldDesc, DeviceKind, DeviceRuntime, DeviceStreamKey, HostPtr};
use crate::copy::{pack_plane_raw, unpack_plane_raw};
use crate::range::Plane;
use crate::Error;

struct Buf {
    data: UnsafeCell<Box<[u8]>>,
}

// Jobs on distinct regions may touch a buffer concurrently; the exchange
// protocol never aliases a region between an unsynchronized stream and
// the host.
unsafe impl Send for Buf {}
unsafe impl Sync for Buf {}

impl Buf {
    fn ptr(&self) -> *mut u8 {
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    fn len(&self) -> usize {
        unsafe { (&*self.data.get()).len() }
    }
}

type Job = Box<dyn FnOnce() + Send>;

struct Worker {
    tx: Option<Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn spawn() -> Self {
        let (tx, rx) = unbounded::<Job>();
        let handle = thread::Builder::new()
            .name("seam-emu-stream".into())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("spawning emu stream worker");
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn submit(&self, job: Job) {
        self.tx
            .as_ref()
            .expect("stream already destroyed")
            .send(job)
            .expect("emu stream worker is gone");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The in-process device.
#[derive(Default)]
pub struct EmuRuntime {
    bufs: Mutex<SlotMap<DeviceBufferKey, Arc<Buf>>>,
    streams: Mutex<SlotMap<DeviceStreamKey, Worker>>,
}

impl EmuRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn buf(&self, key: DeviceBufferKey) -> Result<Arc<Buf>, Error> {
        self.bufs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Device("unknown emu buffer handle".into()))
    }

    fn submit(&self, stream: DeviceStreamKey, job: Job) -> Result<(), Error> {
        let streams = self.streams.lock().unwrap();
        let worker = streams
            .get(stream)
            .ok_or_else(|| Error::Device("unknown emu stream handle".into()))?;
        worker.submit(job);
        Ok(())
    }
}

impl std::fmt::Debug for EmuRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bufs = self.bufs.lock().unwrap().len();
        let streams = self.streams.lock().unwrap().len();
        f.debug_struct("EmuRuntime")
            .field("buffers", &bufs)
            .field("streams", &streams)
            .finish()
    }
}

impl DeviceRuntime for EmuRuntime {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Emu
    }

    fn alloc(&self, bytes: usize) -> Result<DeviceBufferKey, Error> {
        let buf = Arc::new(Buf {
            data: UnsafeCell::new(vec![0u8; bytes].into_boxed_slice()),
        });
        Ok(self.bufs.lock().unwrap().insert(buf))
    }

    fn free(&self, buf: DeviceBufferKey) {
        // In-flight jobs keep their Arc; the storage goes when they do.
        self.bufs.lock().unwrap().remove(buf);
    }

    fn upload(&self, buf: DeviceBufferKey, offset: usize, src: &[u8]) -> Result<(), Error> {
        let buf = self.buf(buf)?;
        assert!(offset + src.len() <= buf.len());
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), buf.ptr().add(offset), src.len());
        }
        Ok(())
    }

    fn download(&self, buf: DeviceBufferKey, offset: usize, dst: &mut [u8]) -> Result<(), Error> {
        let buf = self.buf(buf)?;
        assert!(offset + dst.len() <= buf.len());
        unsafe {
            std::ptr::copy_nonoverlapping(buf.ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn device_ptr(&self, buf: DeviceBufferKey) -> Result<*mut u8, Error> {
        Ok(self.buf(buf)?.ptr())
    }

    fn create_stream(&self) -> Result<DeviceStreamKey, Error> {
        Ok(self.streams.lock().unwrap().insert(Worker::spawn()))
    }

    fn destroy_stream(&self, stream: DeviceStreamKey) {
        self.streams.lock().unwrap().remove(stream);
    }

    fn sync_stream(&self, stream: DeviceStreamKey) -> Result<(), Error> {
        let (done_tx, done_rx) = bounded::<()>(1);
        self.submit(stream, Box::new(move || drop(done_tx.send(()))))?;
        done_rx
            .recv()
            .map_err(|_| Error::Device("emu stream worker died during sync".into()))
    }

    fn host_register(&self, _ptr: *mut u8, _len: usize) -> Result<(), Error> {
        Ok(())
    }

    fn host_unregister(&self, _ptr: *mut u8) {}

    fn copy_d2d(
        &self,
        src: DeviceBufferKey,
        dst: DeviceBufferKey,
        bytes: usize,
    ) -> Result<(), Error> {
        let src = self.buf(src)?;
        let dst = self.buf(dst)?;
        assert!(bytes <= src.len() && bytes <= dst.len());
        unsafe {
            std::ptr::copy_nonoverlapping(src.ptr(), dst.ptr(), bytes);
        }
        Ok(())
    }

    fn copy_d2h_async(
        &self,
        src: DeviceBufferKey,
        bytes: usize,
        dst: HostPtr,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        let src = self.buf(src)?;
        assert!(bytes <= src.len());
        self.submit(
            stream,
            Box::new(move || {
                let dst = dst;
                unsafe {
                    std::ptr::copy_nonoverlapping(src.ptr(), dst.0, bytes);
                }
            }),
        )
    }

    fn copy_h2d_async(
        &self,
        src: HostPtr,
        dst: DeviceBufferKey,
        bytes: usize,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        let dst = self.buf(dst)?;
        assert!(bytes <= dst.len());
        self.submit(
            stream,
            Box::new(move || {
                let src = src;
                unsafe {
                    std::ptr::copy_nonoverlapping(src.0 as *const u8, dst.ptr(), bytes);
                }
            }),
        )
    }

    fn pack_plane(
        &self,
        field: &DeviceFieldDesc,
        _dim: usize,
        plane: Plane,
        dst: DeviceBufferKey,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        let src = self.buf(field.buf)?;
        let dst = self.buf(dst)?;
        let shape = field.shape;
        let elem_size = field.elem.size();
        self.submit(
            stream,
            Box::new(move || unsafe {
                pack_plane_raw(src.ptr(), shape, plane, elem_size, dst.ptr());
            }),
        )
    }

    fn unpack_plane(
        &self,
        src: DeviceBufferKey,
        field: &DeviceFieldDesc,
        _dim: usize,
        plane: Plane,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        let src = self.buf(src)?;
        let dst = self.buf(field.buf)?;
        let shape = field.shape;
        let elem_size = field.elem.size();
        self.submit(
            stream,
            Box::new(move || unsafe {
                unpack_plane_raw(src.ptr(), shape, plane, elem_size, dst.ptr());
            }),
        )
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
        let src = self.buf(field.buf)?;
        let shape = field.shape;
        let elem_size = field.elem.size();
        self.submit(
            stream,
            Box::new(move || {
                let dst = dst;
                unsafe {
                    pack_plane_raw(src.ptr(), shape, plane, elem_size, dst.0);
                }
            }),
        )
    }

    fn staged_unpack(
        &self,
        src: HostPtr,
        field: &DeviceFieldDesc,
        plane: Plane,
        stream: DeviceStreamKey,
    ) -> Result<(), Error> {
        let dst = self.buf(field.buf)?;
        let shape = field.shape;
        let elem_size = field.elem.size();
        self.submit(
            stream,
            Box::new(move || {
                let src = src;
                unsafe {
                    unpack_plane_raw(src.0 as *const u8, shape, plane, elem_size, dst.ptr());
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::ElemType;
    use crate::range::send_plane;
    use crate::topology::Side;

    #[test]
    fn upload_download_round_trip() {
        let rt = EmuRuntime::new();
        let buf = rt.alloc(16).unwrap();
        rt.upload(buf, 4, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        rt.download(buf, 4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        rt.free(buf);
    }

    #[test]
    fn stream_pack_matches_host_copy() {
        let rt = EmuRuntime::new();
        let shape = [4, 3, 5];
        let src: Vec<f32> = (0..60).map(|i| i as f32).collect();

        let field_buf = rt.alloc(60 * 4).unwrap();
        rt.upload(field_buf, 0, bytemuck::cast_slice(&src)).unwrap();
        let field = DeviceFieldDesc {
            buf: field_buf,
            elem: ElemType::F32,
            shape,
        };

        let plane = send_plane(Side::High, 1, shape, 2);
        let dst = rt.alloc(plane.len() * 4).unwrap();
        let stream = rt.create_stream().unwrap();
        rt.pack_plane(&field, 1, plane, dst, stream).unwrap();
        rt.sync_stream(stream).unwrap();

        let mut got = vec![0.0f32; plane.len()];
        rt.download(dst, 0, bytemuck::cast_slice_mut(&mut got)).unwrap();

        let mut want = vec![0.0f32; plane.len()];
        crate::copy::pack_plane(&src, shape, 1, plane, &mut want, usize::MAX);
        assert_eq!(got, want);
        rt.destroy_stream(stream);
    }

    #[test]
    fn sync_orders_after_submission() {
        let rt = EmuRuntime::new();
        let a = rt.alloc(8).unwrap();
        let b = rt.alloc(8).unwrap();
        rt.upload(a, 0, &[9; 8]).unwrap();
        let stream = rt.create_stream().unwrap();
        let mut host = [0u8; 8];
        let staging = HostPtr(host.as_mut_ptr());
        rt.copy_d2h_async(a, 8, staging, stream).unwrap();
        rt.copy_h2d_async(staging, b, 8, stream).unwrap();
        rt.sync_stream(stream).unwrap();
        let mut out = [0u8; 8];
        rt.download(b, 0, &mut out).unwrap();
        assert_eq!(out, [9; 8]);
    }
}
