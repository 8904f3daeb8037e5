//! MPI transport over rsmpi.
//!
//! Host sends own their staging storage under a static scope, so no
//! request borrows exchanger state; device-aware sends and receives
//! hand the raw device address to the library, which reads and writes
//! GPU memory directly. Every request is waited within the call that
//! made it. Receives are matched at wait time; per-peer tag ordering
//! keeps the pairing deterministic and the library's
//! unexpected-message queue carries the gap between post and wait.

use mpi::request::{Request, StaticScope};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use super::{BufMut, BufRef, Tag, Transport};
use crate::topology::Rank;
use crate::Error;

pub struct MpiTransport {
    comm: SimpleCommunicator,
}

impl MpiTransport {
    pub fn new(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }

    pub fn comm(&self) -> &SimpleCommunicator {
        &self.comm
    }
}

pub struct MpiSendReq {
    req: Request<'static, [u8], StaticScope>,
    /// Owned staging of a host send, reclaimed at the wait. Device
    /// sends borrow the pool's device allocation instead and carry
    /// nothing.
    staged: Option<*mut [u8]>,
}

pub struct MpiRecvReq {
    from: Rank,
    tag: Tag,
    len: usize,
}

impl Transport for MpiTransport {
    type SendReq = MpiSendReq;
    type RecvReq = MpiRecvReq;

    fn irecv(&mut self, from: Rank, tag: Tag, len: usize) -> Result<MpiRecvReq, Error> {
        Ok(MpiRecvReq { from, tag, len })
    }

    fn isend(&mut self, to: Rank, tag: Tag, src: BufRef<'_>) -> Result<MpiSendReq, Error> {
        let (buf, staged): (&'static [u8], Option<*mut [u8]>) = match src {
            BufRef::Host(b) => {
                let staged: &'static mut [u8] = Box::leak(b.to_vec().into_boxed_slice());
                let ptr = staged as *mut [u8];
                (&*staged, Some(ptr))
            }
            BufRef::Device { runtime, buf, len } => {
                // The pool allocation outlives the request, which is
                // waited within this call; only the library's DMA
                // engines dereference the address.
                let ptr = runtime.device_ptr(buf)?;
                (
                    unsafe { std::slice::from_raw_parts(ptr as *const u8, len) },
                    None,
                )
            }
        };
        let req = self
            .comm
            .process_at_rank(to)
            .immediate_send_with_tag(StaticScope, buf, tag);
        Ok(MpiSendReq { req, staged })
    }

    fn wait_recv(&mut self, req: MpiRecvReq, dst: BufMut<'_>) -> Result<(), Error> {
        let process = self.comm.process_at_rank(req.from);
        match dst {
            BufMut::Host(b) => {
                debug_assert_eq!(b.len(), req.len);
                process.receive_into_with_tag(b, req.tag);
            }
            BufMut::Device { runtime, buf, len } => {
                let ptr = runtime.device_ptr(buf)?;
                let landing = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
                process.receive_into_with_tag(landing, req.tag);
            }
        }
        Ok(())
    }

    fn wait_send(&mut self, req: MpiSendReq) -> Result<(), Error> {
        req.req.wait();
        if let Some(staged) = req.staged {
            // The request is done; reclaim the leaked staging buffer.
            unsafe {
                drop(Box::from_raw(staged));
            }
        }
        Ok(())
    }
}
