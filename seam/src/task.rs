//! Pack/unpack handle tables.
//!
//! Host entries carry an armed operation that runs when it is waited on,
//! not when it is armed; the wait is the only scheduling point, so host
//! plane copies execute serialized on the controlling thread in wait
//! order. Device entries are persistent streams: arming submits work on
//! the slot's stream at once and the wait synchronizes the stream.

use std::sync::Arc;

use crate::device::{DeviceRuntime, DeviceStreamKey};
use crate::range::Plane;
use crate::topology::Side;
use crate::{Error, NNEIGHBORS_PER_DIM};

/// A host plane copy, armed but not yet run.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HostOp {
    pub dim: usize,
    pub plane: Plane,
}

struct Table {
    armed: Vec<Option<HostOp>>,
    streams: Vec<Option<DeviceStreamKey>>,
}

impl Table {
    fn new() -> Self {
        Self {
            armed: Vec::new(),
            streams: Vec::new(),
        }
    }

    fn grow(&mut self, slots: usize) {
        if self.armed.len() < slots {
            self.armed.resize(slots, None);
            self.streams.resize(slots, None);
        }
    }
}

/// The two tables (pack and unpack), persisted across calls.
pub(crate) struct TaskTables {
    write: Table,
    read: Table,
    /// Runtime the streams were created on; a runtime change retires them.
    stream_runtime: Option<Arc<dyn DeviceRuntime>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Write,
    Read,
}

fn slot_index(field: usize, side: Side) -> usize {
    field * NNEIGHBORS_PER_DIM + side.index()
}

impl TaskTables {
    pub fn new() -> Self {
        Self {
            write: Table::new(),
            read: Table::new(),
            stream_runtime: None,
        }
    }

    /// Widens both tables to cover `count` fields.
    pub fn ensure_fields(&mut self, count: usize) {
        let slots = count * NNEIGHBORS_PER_DIM;
        self.write.grow(slots);
        self.read.grow(slots);
    }

    fn table(&mut self, kind: TaskKind) -> &mut Table {
        match kind {
            TaskKind::Write => &mut self.write,
            TaskKind::Read => &mut self.read,
        }
    }

    /// Arms a host operation. Nothing runs until [`take_armed`] hands the
    /// descriptor to the waiter. Arming overwrites whatever the slot
    /// held, including leftovers of a call that failed between arm and
    /// wait.
    pub fn arm(&mut self, kind: TaskKind, field: usize, side: Side, op: HostOp) {
        let slot = slot_index(field, side);
        self.table(kind).armed[slot] = Some(op);
    }

    pub fn take_armed(&mut self, kind: TaskKind, field: usize, side: Side) -> Option<HostOp> {
        let slot = slot_index(field, side);
        self.table(kind).armed[slot].take()
    }

    /// The persistent stream of a (field, side) slot, created on first
    /// use and reused across calls.
    pub fn stream(
        &mut self,
        kind: TaskKind,
        field: usize,
        side: Side,
        runtime: &Arc<dyn DeviceRuntime>,
    ) -> Result<DeviceStreamKey, Error> {
        let same_runtime = self
            .stream_runtime
            .as_ref()
            .is_some_and(|rt| Arc::ptr_eq(rt, runtime));
        if !same_runtime {
            self.retire_streams();
            self.stream_runtime = Some(runtime.clone());
        }
        let slot = slot_index(field, side);
        let entry = &mut self.table(kind).streams[slot];
        if let Some(stream) = *entry {
            return Ok(stream);
        }
        let stream = runtime.create_stream()?;
        *entry = Some(stream);
        Ok(stream)
    }

    fn retire_streams(&mut self) {
        if let Some(rt) = self.stream_runtime.take() {
            for entry in self
                .write
                .streams
                .iter_mut()
                .chain(self.read.streams.iter_mut())
            {
                if let Some(stream) = entry.take() {
                    rt.destroy_stream(stream);
                }
            }
        } else {
            for entry in self
                .write
                .streams
                .iter_mut()
                .chain(self.read.streams.iter_mut())
            {
                *entry = None;
            }
        }
    }

    /// Drops all streams (tear-down).
    pub fn free_all(&mut self) {
        self.retire_streams();
        self.write = Table::new();
        self.read = Table::new();
    }
}

impl Drop for TaskTables {
    fn drop(&mut self) {
        self.retire_streams();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EmuRuntime;

    #[test]
    fn armed_ops_are_taken_once() {
        let mut tables = TaskTables::new();
        tables.ensure_fields(2);
        let op = HostOp {
            dim: 1,
            plane: crate::range::recv_plane(Side::Low, 1, [4, 4, 4]),
        };
        tables.arm(TaskKind::Write, 1, Side::High, op);
        assert!(tables.take_armed(TaskKind::Write, 1, Side::High).is_some());
        assert!(tables.take_armed(TaskKind::Write, 1, Side::High).is_none());
        assert!(tables.take_armed(TaskKind::Read, 1, Side::High).is_none());
    }

    #[test]
    fn streams_are_reused_per_slot() {
        let rt = EmuRuntime::new() as Arc<dyn DeviceRuntime>;
        let mut tables = TaskTables::new();
        tables.ensure_fields(1);
        let a = tables.stream(TaskKind::Write, 0, Side::Low, &rt).unwrap();
        let b = tables.stream(TaskKind::Write, 0, Side::Low, &rt).unwrap();
        let c = tables.stream(TaskKind::Read, 0, Side::Low, &rt).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        tables.free_all();
    }
}
