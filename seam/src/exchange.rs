//! The exchange orchestrator.
//!
//! One `update_halo` call walks the dimensions strictly in order; a
//! dimension's sends are drained and its unpacks finished before the
//! next dimension packs. Corner and edge cells are therefore filled by
//! transit through successive dimensions and never need an exchange of
//! their own.

use std::sync::Arc;

use crate::device::{DeviceFieldDesc, DeviceRuntime};
use crate::field::{with_elem, Field};
use crate::pool::{BufferPool, Dir, SlotRequest};
use crate::range::{fast_axis, halosize, max_halo_elems, recv_plane, send_plane};
use crate::task::{HostOp, TaskKind, TaskTables};
use crate::topology::{Side, Topology};
use crate::transport::{BufMut, BufRef, Transport, HALO_TAG};
use crate::{copy, ContextDesc, Error, NDIMS};

/// How one (field, dimension) pair moves its planes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlanePath {
    /// Host field, host scratch, cooperative copy tasks.
    Host,
    /// Device field, device scratch handed to the transport directly.
    DeviceAware,
    /// Device field, plane linearized on the device and flat-copied
    /// through the pinned mirror.
    StagedKernel,
    /// Device field, plane moved between array and pinned mirror in one
    /// strided async copy.
    Staged3d,
}

/// Drives halo updates for one process of the grid.
///
/// Owns the scratch pool, the handle tables and the per-slot device
/// streams; all three persist across calls so steady-state exchanges
/// allocate nothing. Not shareable between threads; the surrounding
/// system serializes by holding the `&mut`.
pub struct Exchanger<T: Transport> {
    topo: Topology,
    transport: T,
    desc: ContextDesc,
    pool: BufferPool,
    tasks: TaskTables,
}

impl<T: Transport> Exchanger<T> {
    pub fn new(topo: Topology, transport: T, desc: ContextDesc) -> Self {
        Self {
            topo,
            transport,
            desc,
            pool: BufferPool::new(),
            tasks: TaskTables::new(),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// Number of scratch (re)allocations since construction.
    pub fn scratch_allocations(&self) -> u64 {
        self.pool.allocations()
    }

    /// Synchronizes the one-plane halos of `fields` with all neighbours.
    ///
    /// Fields may live on host or device memory in any mix, but must
    /// share one element type, must not alias, and each needs at least
    /// one dimension with an overlap of 2 or more. Errors are fatal and
    /// name the offending field position or dimension.
    pub fn update_halo(&mut self, fields: &mut [Field<'_>]) -> Result<(), Error> {
        if fields.is_empty() {
            return Ok(());
        }
        check_fields(fields)?;
        log::trace!(
            "update_halo: {} field(s) of {} on rank {}",
            fields.len(),
            fields[0].elem().name(),
            self.topo.me()
        );
        self.allocate_bufs(fields)?;
        for dim in 0..NDIMS {
            self.exchange_dim(dim, fields)?;
        }
        Ok(())
    }

    /// Releases all persistent scratch and streams. The next call starts
    /// from a cold pool.
    pub fn free_update_halo_buffers(&mut self) {
        self.pool.free_all();
        self.tasks.free_all();
    }

    fn plane_path(&self, field: &Field<'_>, dim: usize) -> PlanePath {
        match field.device_array() {
            None => PlanePath::Host,
            Some(arr) => {
                let rt = arr.runtime();
                if self.desc.device_aware(rt.kind(), dim) {
                    PlanePath::DeviceAware
                } else if dim == fast_axis(field.shape()) || !rt.supports_staged_3d() {
                    PlanePath::StagedKernel
                } else {
                    PlanePath::Staged3d
                }
            }
        }
    }

    /// Ensures every slot the call can touch is allocated, typed for the
    /// call's element type and large enough for the widest plane of its
    /// field.
    fn allocate_bufs(&mut self, fields: &[Field<'_>]) -> Result<(), Error> {
        self.pool.ensure_fields(fields.len());
        self.tasks.ensure_fields(fields.len());
        for (i, field) in fields.iter().enumerate() {
            let elems = max_halo_elems(field.shape(), field.ndim());
            let device = field.device_array().map(|a| a.runtime().clone());
            let staged = device.is_some()
                && (0..NDIMS).any(|d| {
                    field.ol(d) >= 2
                        && !matches!(self.plane_path(field, d), PlanePath::DeviceAware)
                });
            let req = SlotRequest {
                elem: field.elem(),
                elems,
                device,
                pinned: staged,
                host: field.device_array().is_none() || staged,
            };
            for side in Side::BOTH {
                self.pool.ensure(Dir::Send, side, i, &req)?;
                self.pool.ensure(Dir::Recv, side, i, &req)?;
            }
        }
        Ok(())
    }

    fn exchange_dim(&mut self, dim: usize, fields: &mut [Field<'_>]) -> Result<(), Error> {
        // Arm all packs for the dimension up front; they overlap with the
        // posting of receives below.
        for side in Side::BOTH {
            if self.topo.has_neighbor(side, dim) {
                for (i, field) in fields.iter().enumerate() {
                    if field.ol(dim) >= 2 {
                        self.iwrite_sendbufs(i, side, dim, field)?;
                    }
                }
            }
        }

        let me = self.topo.me();
        let low_is_me = self.topo.neighbor(Side::Low, dim) == Some(me);
        let high_is_me = self.topo.neighbor(Side::High, dim) == Some(me);
        if low_is_me != high_is_me {
            return Err(Error::IncoherentNeighbors { dim });
        }
        if low_is_me {
            self.exchange_local(dim, fields)
        } else {
            self.exchange_remote(dim, fields)
        }
    }

    /// Remote path: receives posted high-then-low, sends issued
    /// low-then-high behind their packs, then receive waits, unpacks and
    /// the send drain.
    fn exchange_remote(&mut self, dim: usize, fields: &mut [Field<'_>]) -> Result<(), Error> {
        let nf = fields.len();
        let mut recv_reqs: [Vec<Option<T::RecvReq>>; 2] =
            std::array::from_fn(|_| (0..nf).map(|_| None).collect());
        let mut send_reqs: [Vec<Option<T::SendReq>>; 2] =
            std::array::from_fn(|_| (0..nf).map(|_| None).collect());

        for side in [Side::High, Side::Low] {
            if let Some(peer) = self.topo.neighbor(side, dim) {
                for (i, field) in fields.iter().enumerate() {
                    if field.ol(dim) < 2 {
                        continue;
                    }
                    let len = halosize(dim, field.shape()) * field.elem().size();
                    recv_reqs[side.index()][i] =
                        Some(self.transport.irecv(peer, HALO_TAG, len)?);
                }
            }
        }

        for side in Side::BOTH {
            if let Some(peer) = self.topo.neighbor(side, dim) {
                for (i, field) in fields.iter().enumerate() {
                    if field.ol(dim) < 2 {
                        continue;
                    }
                    self.wait_iwrite(i, side, field)?;
                    let len = halosize(dim, field.shape()) * field.elem().size();
                    let src = match self.plane_path(field, dim) {
                        PlanePath::DeviceAware => BufRef::Device {
                            runtime: field.device_array().expect("device path").runtime(),
                            buf: self.pool.device_buf(Dir::Send, side, i),
                            len,
                        },
                        _ => BufRef::Host(self.pool.host_bytes(Dir::Send, side, i, len)),
                    };
                    send_reqs[side.index()][i] =
                        Some(self.transport.isend(peer, HALO_TAG, src)?);
                }
            }
        }

        for side in [Side::High, Side::Low] {
            for (i, field) in fields.iter().enumerate() {
                if let Some(req) = recv_reqs[side.index()][i].take() {
                    let len = halosize(dim, field.shape()) * field.elem().size();
                    let dst = match self.plane_path(field, dim) {
                        PlanePath::DeviceAware => BufMut::Device {
                            runtime: field.device_array().expect("device path").runtime(),
                            buf: self.pool.device_buf(Dir::Recv, side, i),
                            len,
                        },
                        _ => BufMut::Host(self.pool.host_bytes_mut(Dir::Recv, side, i, len)),
                    };
                    self.transport.wait_recv(req, dst)?;
                    self.iread_recvbufs(i, side, dim, field)?;
                }
            }
        }

        for side in [Side::High, Side::Low] {
            if !self.topo.has_neighbor(side, dim) {
                continue;
            }
            for (i, field) in fields.iter_mut().enumerate() {
                if field.ol(dim) >= 2 {
                    self.wait_iread(i, side, field)?;
                }
            }
        }

        for side in Side::BOTH {
            for req in send_reqs[side.index()].iter_mut().filter_map(Option::take) {
                self.transport.wait_send(req)?;
            }
        }
        Ok(())
    }

    /// Self-neighbour path for periodic single-process dimensions: the
    /// send scratch of one side becomes the receive scratch of the
    /// opposite side without touching the transport.
    fn exchange_local(&mut self, dim: usize, fields: &mut [Field<'_>]) -> Result<(), Error> {
        for side in Side::BOTH {
            for i in 0..fields.len() {
                if fields[i].ol(dim) < 2 {
                    continue;
                }
                self.wait_iwrite(i, side, &fields[i])?;
                self.sendrecv_halo_local(i, side, dim, &fields[i])?;
                let opposite = side.opposite();
                self.iread_recvbufs(i, opposite, dim, &fields[i])?;
                self.wait_iread(i, opposite, &mut fields[i])?;
            }
        }
        Ok(())
    }

    fn sendrecv_halo_local(
        &mut self,
        i: usize,
        side: Side,
        dim: usize,
        field: &Field<'_>,
    ) -> Result<(), Error> {
        let bytes = halosize(dim, field.shape()) * field.elem().size();
        match self.plane_path(field, dim) {
            PlanePath::DeviceAware => {
                let rt = field.device_array().expect("device path").runtime();
                rt.copy_d2d(
                    self.pool.device_buf(Dir::Send, side, i),
                    self.pool.device_buf(Dir::Recv, side.opposite(), i),
                    bytes,
                )
            }
            _ => {
                self.pool.copy_local(i, side, side.opposite(), bytes);
                Ok(())
            }
        }
    }

    /// Arms the pack for (field, side). Host fields defer the copy to the
    /// wait; device fields enqueue it on the slot's stream right away.
    fn iwrite_sendbufs(
        &mut self,
        i: usize,
        side: Side,
        dim: usize,
        field: &Field<'_>,
    ) -> Result<(), Error> {
        let plane = send_plane(side, dim, field.shape(), field.ol(dim));
        let path = self.plane_path(field, dim);
        log::trace!("pack ({i}, {side:?}) dim {dim} via {path:?}");
        if path == PlanePath::Host {
            self.tasks.arm(TaskKind::Write, i, side, HostOp { dim, plane });
            return Ok(());
        }
        let arr = field.device_array().expect("device path");
        let rt: &Arc<dyn DeviceRuntime> = arr.runtime();
        let desc = DeviceFieldDesc {
            buf: arr.buf(),
            elem: field.elem(),
            shape: field.shape(),
        };
        let stream = self.tasks.stream(TaskKind::Write, i, side, rt)?;
        let bytes = plane.len() * field.elem().size();
        match path {
            PlanePath::DeviceAware => {
                rt.pack_plane(&desc, dim, plane, self.pool.device_buf(Dir::Send, side, i), stream)
            }
            PlanePath::StagedKernel => {
                let dev = self.pool.device_buf(Dir::Send, side, i);
                rt.pack_plane(&desc, dim, plane, dev, stream)?;
                rt.copy_d2h_async(dev, bytes, self.pool.mirror_ptr(Dir::Send, side, i), stream)
            }
            PlanePath::Staged3d => {
                rt.staged_pack(&desc, plane, self.pool.mirror_ptr(Dir::Send, side, i), stream)
            }
            PlanePath::Host => unreachable!(),
        }
    }

    /// Waits the pack for (field, side); for host fields this is where
    /// the copy actually runs.
    fn wait_iwrite(&mut self, i: usize, side: Side, field: &Field<'_>) -> Result<(), Error> {
        if let Some(op) = self.tasks.take_armed(TaskKind::Write, i, side) {
            let threshold = self.desc.thread_copy_threshold;
            with_elem!(field.elem(), E => {
                let dst = self.pool.typed_mut::<E>(Dir::Send, side, i, op.plane.len());
                copy::pack_plane(
                    field.host_slice::<E>(),
                    field.shape(),
                    op.dim,
                    op.plane,
                    dst,
                    threshold,
                );
            });
            return Ok(());
        }
        if let Some(arr) = field.device_array() {
            let rt = arr.runtime().clone();
            let stream = self.tasks.stream(TaskKind::Write, i, side, &rt)?;
            rt.sync_stream(stream)?;
        }
        Ok(())
    }

    /// Arms the unpack for (field, side) once its message has landed.
    fn iread_recvbufs(
        &mut self,
        i: usize,
        side: Side,
        dim: usize,
        field: &Field<'_>,
    ) -> Result<(), Error> {
        let plane = recv_plane(side, dim, field.shape());
        let path = self.plane_path(field, dim);
        log::trace!("unpack ({i}, {side:?}) dim {dim} via {path:?}");
        if path == PlanePath::Host {
            self.tasks.arm(TaskKind::Read, i, side, HostOp { dim, plane });
            return Ok(());
        }
        let arr = field.device_array().expect("device path");
        let rt: &Arc<dyn DeviceRuntime> = arr.runtime();
        let desc = DeviceFieldDesc {
            buf: arr.buf(),
            elem: field.elem(),
            shape: field.shape(),
        };
        let stream = self.tasks.stream(TaskKind::Read, i, side, rt)?;
        let bytes = plane.len() * field.elem().size();
        match path {
            PlanePath::DeviceAware => {
                rt.unpack_plane(self.pool.device_buf(Dir::Recv, side, i), &desc, dim, plane, stream)
            }
            PlanePath::StagedKernel => {
                let dev = self.pool.device_buf(Dir::Recv, side, i);
                rt.copy_h2d_async(self.pool.mirror_ptr(Dir::Recv, side, i), dev, bytes, stream)?;
                rt.unpack_plane(dev, &desc, dim, plane, stream)
            }
            PlanePath::Staged3d => {
                rt.staged_unpack(self.pool.mirror_ptr(Dir::Recv, side, i), &desc, plane, stream)
            }
            PlanePath::Host => unreachable!(),
        }
    }

    fn wait_iread(&mut self, i: usize, side: Side, field: &mut Field<'_>) -> Result<(), Error> {
        if let Some(op) = self.tasks.take_armed(TaskKind::Read, i, side) {
            let threshold = self.desc.thread_copy_threshold;
            with_elem!(field.elem(), E => {
                let src = self.pool.typed::<E>(Dir::Recv, side, i, op.plane.len());
                let shape = field.shape();
                copy::unpack_plane(src, field.host_slice_mut::<E>(), shape, op.dim, op.plane, threshold);
            });
            return Ok(());
        }
        if let Some(arr) = field.device_array() {
            let rt = arr.runtime().clone();
            let stream = self.tasks.stream(TaskKind::Read, i, side, &rt)?;
            rt.sync_stream(stream)?;
        }
        Ok(())
    }
}

/// Input checks run before any work: every field must carry a halo
/// somewhere, fields must not alias, element types must agree and all
/// device fields must share a runtime. Positions in messages are
/// 1-based.
fn check_fields(fields: &[Field<'_>]) -> Result<(), Error> {
    let mut device_runtime: Option<(&Arc<dyn DeviceRuntime>, usize)> = None;
    for (i, field) in fields.iter().enumerate() {
        if (0..NDIMS).all(|d| field.ol(d) < 2) {
            return Err(Error::NoHalo { pos: i + 1 });
        }
        for d in 0..NDIMS {
            // A send row must be interior: overlap planes may not reach
            // into the opposite halo.
            if field.ol(d) >= 2 && field.shape()[d] < field.ol(d) + 1 {
                return Err(Error::HaloExceedsField { pos: i + 1, dim: d });
            }
        }
        for (j, other) in fields[..i].iter().enumerate() {
            if other.data_id() == field.data_id() {
                return Err(Error::DuplicateField {
                    pos: i + 1,
                    first: j + 1,
                });
            }
        }
        if field.elem() != fields[0].elem() {
            return Err(Error::MixedElemTypes {
                pos: i + 1,
                expected: fields[0].elem(),
                found: field.elem(),
            });
        }
        if let Some(arr) = field.device_array() {
            match device_runtime {
                None => device_runtime = Some((arr.runtime(), i)),
                Some((rt, _)) if Arc::ptr_eq(rt, arr.runtime()) => {}
                Some(_) => return Err(Error::MixedRuntimes { pos: i + 1 }),
            }
        }
    }
    Ok(())
}
