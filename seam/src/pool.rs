//! Persistent scratch for halo traffic.
//!
//! One send and one recv slot per (field ordinal, side), kept across calls
//! and grown monotonically. Storage is raw bytes sized at a granularity
//! that makes any slot reinterpretable across the supported element
//! types; typed views are cut per operation.

use std::sync::Arc;

use crate::device::{DeviceBufferKey, DeviceRuntime, HostPtr};
use crate::field::{Elem, ElemType};
use crate::topology::Side;
use crate::{Error, ALLOC_GRANULARITY, NNEIGHBORS_PER_DIM};

/// Send or receive direction of a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dir {
    Send,
    Recv,
}

/// What a slot must be able to hold for the current call.
pub struct SlotRequest {
    pub elem: ElemType,
    /// Element capacity before granularity rounding.
    pub elems: usize,
    /// Device allocation wanted (device-resident field).
    pub device: Option<Arc<dyn DeviceRuntime>>,
    /// Host mirror wanted and page-locked (staged transport). Never set
    /// together with a purely device-aware path.
    pub pinned: bool,
    /// Host bytes wanted at all (host field, or staged mirror).
    pub host: bool,
}

struct DeviceSlot {
    runtime: Arc<dyn DeviceRuntime>,
    buf: DeviceBufferKey,
    bytes: usize,
}

struct Slot {
    /// Host storage as u64 words so every element type is aligned.
    words: Vec<u64>,
    bytes: usize,
    registered: bool,
    pin_runtime: Option<Arc<dyn DeviceRuntime>>,
    device: Option<DeviceSlot>,
}

impl Slot {
    fn new() -> Self {
        Self {
            words: Vec::new(),
            bytes: 0,
            registered: false,
            pin_runtime: None,
            device: None,
        }
    }

    fn host_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr() as *mut u8
    }
}

/// The process-wide scratch pool. Owned by the exchanger; freed on
/// tear-down only.
pub struct BufferPool {
    send: Vec<Slot>,
    recv: Vec<Slot>,
    allocations: u64,
}

fn quantize(elems: usize) -> usize {
    elems.div_ceil(ALLOC_GRANULARITY) * ALLOC_GRANULARITY
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            send: Vec::new(),
            recv: Vec::new(),
            allocations: 0,
        }
    }

    /// Number of host or device (re)allocations performed so far. Two
    /// calls with identical shapes leave this unchanged.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Grows the slot tables to cover `count` fields. Slots beyond the
    /// current call's field count stay allocated but inert.
    pub fn ensure_fields(&mut self, count: usize) {
        let want = count * NNEIGHBORS_PER_DIM;
        while self.send.len() < want {
            self.send.push(Slot::new());
            self.recv.push(Slot::new());
        }
    }

    fn slot(&self, dir: Dir, side: Side, field: usize) -> &Slot {
        let idx = field * NNEIGHBORS_PER_DIM + side.index();
        match dir {
            Dir::Send => &self.send[idx],
            Dir::Recv => &self.recv[idx],
        }
    }

    fn slot_mut(&mut self, dir: Dir, side: Side, field: usize) -> &mut Slot {
        let idx = field * NNEIGHBORS_PER_DIM + side.index();
        match dir {
            Dir::Send => &mut self.send[idx],
            Dir::Recv => &mut self.recv[idx],
        }
    }

    /// Makes the slot satisfy `req`, reallocating only on growth. A slot
    /// last used with another element type is reinterpreted in place;
    /// capacity is re-checked against the new type's byte need.
    pub fn ensure(
        &mut self,
        dir: Dir,
        side: Side,
        field: usize,
        req: &SlotRequest,
    ) -> Result<(), Error> {
        let need = quantize(req.elems) * req.elem.size();
        let mut allocations = 0u64;
        let slot = self.slot_mut(dir, side, field);

        if req.host && need > slot.bytes {
            if slot.registered {
                if let Some(rt) = &slot.pin_runtime {
                    rt.host_unregister(slot.words.as_mut_ptr() as *mut u8);
                }
                slot.registered = false;
            }
            slot.words.clear();
            slot.words.resize(need.div_ceil(8), 0);
            slot.bytes = need;
            allocations += 1;
            log::debug!(
                "pool grow: {dir:?} slot ({field}, {side:?}) to {need} bytes ({})",
                req.elem.name()
            );
        }
        if req.pinned && !slot.registered && slot.bytes > 0 {
            let rt = req
                .device
                .as_ref()
                .expect("pinned mirror requested without a device runtime");
            let len = slot.bytes;
            let ptr = slot.host_ptr();
            rt.host_register(ptr, len)?;
            slot.registered = true;
            slot.pin_runtime = Some(rt.clone());
        }

        if let Some(rt) = &req.device {
            let grow = match &slot.device {
                Some(dev) => need > dev.bytes,
                None => true,
            };
            if grow {
                // Allocate first so a failure leaves the old slot usable.
                let buf = rt.alloc(need)?;
                if let Some(old) = slot.device.take() {
                    old.runtime.free(old.buf);
                }
                slot.device = Some(DeviceSlot {
                    runtime: rt.clone(),
                    buf,
                    bytes: need,
                });
                allocations += 1;
                log::debug!(
                    "pool grow: {dir:?} device slot ({field}, {side:?}) to {need} bytes"
                );
            }
        }

        self.allocations += allocations;
        Ok(())
    }

    /// Contiguous typed view of exactly `elems` elements.
    pub fn typed<T: Elem>(&self, dir: Dir, side: Side, field: usize, elems: usize) -> &[T] {
        let slot = self.slot(dir, side, field);
        let bytes: &[u8] = bytemuck::cast_slice(&slot.words);
        bytemuck::cast_slice(&bytes[..elems * std::mem::size_of::<T>()])
    }

    pub fn typed_mut<T: Elem>(
        &mut self,
        dir: Dir,
        side: Side,
        field: usize,
        elems: usize,
    ) -> &mut [T] {
        let slot = self.slot_mut(dir, side, field);
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut slot.words);
        bytemuck::cast_slice_mut(&mut bytes[..elems * std::mem::size_of::<T>()])
    }

    pub fn host_bytes(&self, dir: Dir, side: Side, field: usize, len: usize) -> &[u8] {
        let slot = self.slot(dir, side, field);
        &bytemuck::cast_slice(&slot.words)[..len]
    }

    pub fn host_bytes_mut(&mut self, dir: Dir, side: Side, field: usize, len: usize) -> &mut [u8] {
        let slot = self.slot_mut(dir, side, field);
        &mut bytemuck::cast_slice_mut(&mut slot.words)[..len]
    }

    /// Raw pointer to the host mirror for async staging; valid until the
    /// next grow of this slot.
    pub fn mirror_ptr(&mut self, dir: Dir, side: Side, field: usize) -> HostPtr {
        HostPtr(self.slot_mut(dir, side, field).host_ptr())
    }

    pub fn device_buf(&self, dir: Dir, side: Side, field: usize) -> DeviceBufferKey {
        self.slot(dir, side, field)
            .device
            .as_ref()
            .expect("device slot not allocated")
            .buf
    }

    /// Host-side loopback for self-neighbour dimensions: the first `len`
    /// bytes of the send slot on `from` land in the recv slot on `to`.
    pub fn copy_local(&mut self, field: usize, from: Side, to: Side, len: usize) {
        let src = &self.send[field * NNEIGHBORS_PER_DIM + from.index()];
        let dst = &mut self.recv[field * NNEIGHBORS_PER_DIM + to.index()];
        let src: &[u8] = &bytemuck::cast_slice(&src.words)[..len];
        let dst: &mut [u8] = &mut bytemuck::cast_slice_mut(&mut dst.words)[..len];
        dst.copy_from_slice(src);
    }

    /// Releases every allocation: device slots are freed, pinned mirrors
    /// unregistered, host storage dropped.
    pub fn free_all(&mut self) {
        for slot in self.send.iter_mut().chain(self.recv.iter_mut()) {
            if slot.registered {
                if let Some(rt) = &slot.pin_runtime {
                    rt.host_unregister(slot.words.as_mut_ptr() as *mut u8);
                }
                slot.registered = false;
            }
            slot.pin_runtime = None;
            if let Some(dev) = slot.device.take() {
                dev.runtime.free(dev.buf);
            }
            slot.words = Vec::new();
            slot.bytes = 0;
        }
        self.send.clear();
        self.recv.clear();
        log::debug!("halo scratch released");
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.free_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EmuRuntime;

    fn host_req(elem: ElemType, elems: usize) -> SlotRequest {
        SlotRequest {
            elem,
            elems,
            device: None,
            pinned: false,
            host: true,
        }
    }

    #[test]
    fn growth_is_quantized_and_monotonic() {
        let mut pool = BufferPool::new();
        pool.ensure_fields(1);
        pool.ensure(Dir::Send, Side::Low, 0, &host_req(ElemType::F32, 5))
            .unwrap();
        assert_eq!(pool.allocations(), 1);
        // 5 rounds up to 8 elements, so 6 and 8 still fit.
        pool.ensure(Dir::Send, Side::Low, 0, &host_req(ElemType::F32, 8))
            .unwrap();
        assert_eq!(pool.allocations(), 1);
        pool.ensure(Dir::Send, Side::Low, 0, &host_req(ElemType::F32, 9))
            .unwrap();
        assert_eq!(pool.allocations(), 2);
    }

    #[test]
    fn widening_reinterpretation_reallocates_narrowing_does_not() {
        let mut pool = BufferPool::new();
        pool.ensure_fields(1);
        pool.ensure(Dir::Recv, Side::High, 0, &host_req(ElemType::F32, 16))
            .unwrap();
        let before = pool.allocations();
        pool.ensure(Dir::Recv, Side::High, 0, &host_req(ElemType::F64, 16))
            .unwrap();
        assert_eq!(pool.allocations(), before + 1);
        pool.ensure(Dir::Recv, Side::High, 0, &host_req(ElemType::F16, 16))
            .unwrap();
        assert_eq!(pool.allocations(), before + 1);
        let view: &[half::f16] = pool.typed(Dir::Recv, Side::High, 0, 16);
        assert_eq!(view.len(), 16);
    }

    #[test]
    fn device_slots_allocate_on_the_runtime() {
        let rt = EmuRuntime::new();
        let mut pool = BufferPool::new();
        pool.ensure_fields(2);
        let req = SlotRequest {
            elem: ElemType::F64,
            elems: 12,
            device: Some(rt.clone() as Arc<dyn DeviceRuntime>),
            pinned: true,
            host: true,
        };
        pool.ensure(Dir::Send, Side::Low, 1, &req).unwrap();
        assert_eq!(pool.allocations(), 2);
        let _ = pool.device_buf(Dir::Send, Side::Low, 1);
        pool.free_all();
    }
}
