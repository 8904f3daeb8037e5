//! In-process transport: every rank is a thread, every channel pair a
//! wire. Host messages are copied out eagerly on send, so the protocol
//! can never deadlock on buffer space; per-pair FIFO order stands in for
//! the matching rules of a real messaging layer.
//!
//! Device messages never touch host memory: the payload carries a
//! reference to the sender's device scratch and the receiver lands it
//! with a single device-side copy. The send request completes when the
//! receiver has consumed the message, mirroring the completion
//! semantics of a device-aware messaging layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use super::{BufMut, BufRef, Tag, Transport};
use crate::device::{DeviceBufferKey, DeviceRuntime};
use crate::topology::Rank;
use crate::Error;

/// Guards against a peer that died mid-exchange.
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

enum Payload {
    Host(Vec<u8>),
    /// The sender's device scratch, alive and unmodified until the send
    /// request is waited; `done` acknowledges consumption.
    Device {
        runtime: Arc<dyn DeviceRuntime>,
        buf: DeviceBufferKey,
        len: usize,
        done: Sender<()>,
    },
}

impl Payload {
    fn len(&self) -> usize {
        match self {
            Payload::Host(b) => b.len(),
            Payload::Device { len, .. } => *len,
        }
    }
}

struct Msg {
    tag: Tag,
    payload: Payload,
}

/// Builds the endpoints of an `n`-rank in-process fabric.
pub struct LoopbackFabric;

impl LoopbackFabric {
    pub fn endpoints(n: usize) -> Vec<LoopbackTransport> {
        let mut txs: Vec<HashMap<Rank, Sender<Msg>>> = (0..n).map(|_| HashMap::new()).collect();
        let mut rxs: Vec<HashMap<Rank, Receiver<Msg>>> = (0..n).map(|_| HashMap::new()).collect();
        for src in 0..n {
            for dst in 0..n {
                if src == dst {
                    continue;
                }
                let (tx, rx) = unbounded();
                txs[src].insert(dst as Rank, tx);
                rxs[dst].insert(src as Rank, rx);
            }
        }
        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(me, (tx, rx))| LoopbackTransport {
                me: me as Rank,
                tx,
                rx,
            })
            .collect()
    }
}

/// One rank's endpoint.
pub struct LoopbackTransport {
    me: Rank,
    tx: HashMap<Rank, Sender<Msg>>,
    rx: HashMap<Rank, Receiver<Msg>>,
}

/// A posted receive: matching happens at wait time, in post order, which
/// together with per-pair FIFO reproduces tag-0 matching semantics.
pub struct PendingRecv {
    from: Rank,
    tag: Tag,
    len: usize,
}

impl LoopbackTransport {
    pub fn me(&self) -> Rank {
        self.me
    }

    /// Lands a device payload: a device-to-device copy when source and
    /// destination share a runtime, a single bounce otherwise.
    fn land_device(
        &self,
        src_rt: &Arc<dyn DeviceRuntime>,
        src_buf: DeviceBufferKey,
        len: usize,
        dst: BufMut<'_>,
    ) -> Result<(), Error> {
        match dst {
            BufMut::Device { runtime, buf, .. } if Arc::ptr_eq(runtime, src_rt) => {
                src_rt.copy_d2d(src_buf, buf, len)
            }
            BufMut::Device { runtime, buf, .. } => {
                let mut bounce = vec![0u8; len];
                src_rt.download(src_buf, 0, &mut bounce)?;
                runtime.upload(buf, 0, &bounce)
            }
            BufMut::Host(b) => src_rt.download(src_buf, 0, b),
        }
    }
}

impl Transport for LoopbackTransport {
    /// Receipt acknowledgement of a device message; host sends complete
    /// eagerly and carry nothing.
    type SendReq = Option<Receiver<()>>;
    type RecvReq = PendingRecv;

    fn irecv(&mut self, from: Rank, tag: Tag, len: usize) -> Result<PendingRecv, Error> {
        if !self.rx.contains_key(&from) {
            return Err(Error::Transport(format!(
                "rank {} has no wire from rank {from}",
                self.me
            )));
        }
        Ok(PendingRecv { from, tag, len })
    }

    fn isend(&mut self, to: Rank, tag: Tag, src: BufRef<'_>) -> Result<Self::SendReq, Error> {
        let (payload, done) = match src {
            BufRef::Host(b) => (Payload::Host(b.to_vec()), None),
            BufRef::Device { runtime, buf, len } => {
                let (done_tx, done_rx) = bounded(1);
                (
                    Payload::Device {
                        runtime: runtime.clone(),
                        buf,
                        len,
                        done: done_tx,
                    },
                    Some(done_rx),
                )
            }
        };
        self.tx
            .get(&to)
            .ok_or_else(|| {
                Error::Transport(format!("rank {} has no wire to rank {to}", self.me))
            })?
            .send(Msg { tag, payload })
            .map_err(|_| Error::Transport(format!("rank {to} is gone")))?;
        Ok(done)
    }

    fn wait_recv(&mut self, req: PendingRecv, dst: BufMut<'_>) -> Result<(), Error> {
        let msg = self.rx[&req.from]
            .recv_timeout(RECV_TIMEOUT)
            .map_err(|_| {
                Error::Transport(format!(
                    "rank {}: no message from rank {} within {:?}",
                    self.me, req.from, RECV_TIMEOUT
                ))
            })?;
        if msg.tag != req.tag || msg.payload.len() != req.len {
            return Err(Error::Transport(format!(
                "rank {}: message mismatch from rank {}: tag {} len {}, expected tag {} len {}",
                self.me,
                req.from,
                msg.tag,
                msg.payload.len(),
                req.tag,
                req.len
            )));
        }
        match msg.payload {
            Payload::Host(bytes) => match dst {
                BufMut::Host(b) => b.copy_from_slice(&bytes),
                BufMut::Device { runtime, buf, .. } => runtime.upload(buf, 0, &bytes)?,
            },
            Payload::Device {
                runtime,
                buf,
                len,
                done,
            } => {
                self.land_device(&runtime, buf, len, dst)?;
                let _ = done.send(());
            }
        }
        Ok(())
    }

    fn wait_send(&mut self, req: Self::SendReq) -> Result<(), Error> {
        match req {
            None => Ok(()),
            Some(done) => done.recv_timeout(RECV_TIMEOUT).map_err(|_| {
                Error::Transport(format!(
                    "rank {}: device send was not consumed within {:?}",
                    self.me, RECV_TIMEOUT
                ))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EmuRuntime;

    #[test]
    fn pair_exchanges_in_fifo_order() {
        let mut eps = LoopbackFabric::endpoints(2);
        let mut b = eps.pop().unwrap();
        let mut a = eps.pop().unwrap();

        a.isend(1, 0, BufRef::Host(&[1, 2])).unwrap();
        a.isend(1, 0, BufRef::Host(&[3, 4])).unwrap();

        let first = b.irecv(0, 0, 2).unwrap();
        let second = b.irecv(0, 0, 2).unwrap();
        let mut buf1 = [0u8; 2];
        let mut buf2 = [0u8; 2];
        b.wait_recv(first, BufMut::Host(&mut buf1)).unwrap();
        b.wait_recv(second, BufMut::Host(&mut buf2)).unwrap();
        assert_eq!(buf1, [1, 2]);
        assert_eq!(buf2, [3, 4]);
    }

    #[test]
    fn length_mismatch_is_fatal() {
        let mut eps = LoopbackFabric::endpoints(2);
        let mut b = eps.pop().unwrap();
        let mut a = eps.pop().unwrap();
        a.isend(1, 0, BufRef::Host(&[1, 2, 3])).unwrap();
        let req = b.irecv(0, 0, 2).unwrap();
        let mut buf = [0u8; 2];
        assert!(b.wait_recv(req, BufMut::Host(&mut buf)).is_err());
    }

    #[test]
    fn device_payloads_move_device_to_device() {
        let rt: Arc<dyn DeviceRuntime> = EmuRuntime::new();
        let src = rt.alloc(4).unwrap();
        rt.upload(src, 0, &[7, 8, 9, 10]).unwrap();
        let dst = rt.alloc(4).unwrap();

        let mut eps = LoopbackFabric::endpoints(2);
        let mut b = eps.pop().unwrap();
        let mut a = eps.pop().unwrap();

        let send_req = a
            .isend(
                1,
                0,
                BufRef::Device {
                    runtime: &rt,
                    buf: src,
                    len: 4,
                },
            )
            .unwrap();
        assert!(send_req.is_some());

        let recv_req = b.irecv(0, 0, 4).unwrap();
        b.wait_recv(
            recv_req,
            BufMut::Device {
                runtime: &rt,
                buf: dst,
                len: 4,
            },
        )
        .unwrap();
        // Completion follows consumption, so the send is waited last.
        a.wait_send(send_req).unwrap();

        let mut out = [0u8; 4];
        rt.download(dst, 0, &mut out).unwrap();
        assert_eq!(out, [7, 8, 9, 10]);
    }
}
