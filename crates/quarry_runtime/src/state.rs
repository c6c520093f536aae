//! The task-state contract: the polymorphic module that executes tasks,
//! plus the archives that carry tasks across the wire.

use std::any::Any;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ctx::RuntimeCtx;
use crate::errors::{RuntimeError, RuntimeResult};
use crate::ids::{DomainId, TaskNode, TaskStateId};
use crate::task::{TaskAddr, TaskPrio};

/// The baseline verbs every task state understands. Custom verbs start at
/// [`methods::FIRST_CUSTOM`].
pub mod methods {
    pub const CONSTRUCT: u32 = 0;
    pub const DESTRUCT: u32 = 1;
    pub const FIRST_CUSTOM: u32 = 2;
}

/// Data-transfer direction bits.
pub mod xfer_flags {
    /// The receiver reads from the buffer (egress-pushed payload).
    pub const RECEIVER_READ: u32 = 1 << 0;
    /// The receiver writes into the buffer (fetched back after completion).
    pub const RECEIVER_WRITE: u32 = 1 << 1;
    /// The transport frees the buffer when the transfer completes.
    pub const FREE_DATA: u32 = 1 << 2;
}

/// One buffer the transport layer must move for a task: raw bytes inside
/// the region (or the task itself), a direction, and the node they belong
/// to.
#[derive(Clone, Copy, Debug)]
pub struct DataTransfer {
    pub flags: u32,
    pub data: *const u8,
    pub len: usize,
    pub node: DomainId,
}

unsafe impl Send for DataTransfer {}

impl DataTransfer {
    #[must_use]
    pub fn new(flags: u32, data: *const u8, len: usize, node: DomainId) -> Self {
        Self {
            flags,
            data,
            len,
            node,
        }
    }

    /// The bytes this transfer covers. Valid while the referenced task or
    /// buffer is alive.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        if self.data.is_null() || self.len == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.data, self.len) }
        }
    }

    /// Mutable view for receiver-write transfers.
    #[allow(clippy::mut_from_ref)]
    #[must_use]
    pub fn as_mut_slice(&self) -> &mut [u8] {
        if self.data.is_null() || self.len == 0 {
            &mut []
        } else {
            unsafe { std::slice::from_raw_parts_mut(self.data as *mut u8, self.len) }
        }
    }
}

/// The base task fields that travel with every serialized task, so a
/// replica materialized on the peer keeps the parent's graph position and
/// lane placement. The state id and method travel in the RPC envelope;
/// the domain is rewritten to the executing node at ingress.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TaskMeta {
    pub task_node: TaskNode,
    pub prio: u32,
    pub lane_hash: u32,
    pub period_ns: u64,
}

impl TaskMeta {
    #[must_use]
    pub fn prio(&self) -> TaskPrio {
        TaskPrio::from_u32(self.prio)
    }
}

/// Collects what a task state wants shipped: transfer records plus
/// bincode-encoded scalar parameters. The parameter bytes always travel as
/// the final (receiver-read) payload, after any bulk transfers.
#[derive(Default)]
pub struct SaveArchive {
    xfers: Vec<DataTransfer>,
    params: Vec<u8>,
    node: DomainId,
}

impl SaveArchive {
    #[must_use]
    pub fn new(node: DomainId) -> Self {
        Self {
            xfers: Vec::new(),
            params: Vec::new(),
            node,
        }
    }

    pub fn write<T: Serialize>(&mut self, value: &T) -> RuntimeResult<()> {
        bincode::serialize_into(&mut self.params, value)
            .map_err(|err| RuntimeError::Serde(err.to_string()))
    }

    /// Serialize the base task fields. States call this first in their
    /// `save_start`.
    pub fn write_task_meta(&mut self, task: TaskAddr) -> RuntimeResult<()> {
        let header = task.header();
        self.write(&TaskMeta {
            task_node: header.task_node,
            prio: header.prio,
            lane_hash: header.lane_hash,
            period_ns: header.period_ns,
        })
    }

    pub fn add_xfer(&mut self, flags: u32, data: *const u8, len: usize) {
        self.xfers.push(DataTransfer::new(flags, data, len, self.node));
    }

    #[must_use]
    pub fn node(&self) -> DomainId {
        self.node
    }

    /// Bulk transfers and parameter bytes, in wire order.
    #[must_use]
    pub fn into_parts(self) -> (Vec<DataTransfer>, Vec<u8>) {
        (self.xfers, self.params)
    }
}

/// The receive side: an optional bulk buffer plus the parameter bytes.
pub struct LoadArchive<'a> {
    bulk: Option<&'a mut [u8]>,
    params: std::io::Cursor<&'a [u8]>,
}

impl<'a> LoadArchive<'a> {
    #[must_use]
    pub fn new(bulk: Option<&'a mut [u8]>, params: &'a [u8]) -> Self {
        Self {
            bulk,
            params: std::io::Cursor::new(params),
        }
    }

    pub fn read<T: DeserializeOwned>(&mut self) -> RuntimeResult<T> {
        bincode::deserialize_from(&mut self.params)
            .map_err(|err| RuntimeError::Serde(err.to_string()))
    }

    /// Counterpart of [`SaveArchive::write_task_meta`]; states call this
    /// first in their `load_start`.
    pub fn read_task_meta(&mut self) -> RuntimeResult<TaskMeta> {
        self.read()
    }

    /// The bulk buffer accompanying the request, if any. Taking it twice is
    /// an archive-protocol violation.
    pub fn take_bulk(&mut self) -> RuntimeResult<&'a mut [u8]> {
        self.bulk.take().ok_or(RuntimeError::ArchiveExhausted)
    }

    #[must_use]
    pub fn has_bulk(&self) -> bool {
        self.bulk.is_some()
    }
}

/// What `get_group` reported for a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupKey {
    /// Exempt from group serialization.
    Unordered,
    /// The state wrote an opaque key into the caller's buffer; tasks
    /// sharing it run serially within a worker.
    Keyed,
}

/// Scratch a coroutine task keeps between yields: stable stack bytes plus a
/// state slot for whatever the task state wants to persist across
/// re-entries.
pub struct CoroFrame {
    stack: Box<[u8]>,
    state: Option<Box<dyn Any + Send>>,
}

/// Default scratch size for coroutine frames.
pub const CORO_STACK_SIZE: usize = 16 << 10;

impl CoroFrame {
    #[must_use]
    pub fn new(stack_size: usize) -> Self {
        Self {
            stack: vec![0u8; stack_size].into_boxed_slice(),
            state: None,
        }
    }

    /// The frame's stack base. Stable across resumes of the same task.
    #[must_use]
    pub fn stack_ptr(&self) -> *const u8 {
        self.stack.as_ptr()
    }

    #[must_use]
    pub fn stack_mut(&mut self) -> &mut [u8] {
        &mut self.stack
    }

    /// Fetch the resume state, initializing it on first entry.
    pub fn state_or_insert_with<T: Any + Send, F: FnOnce() -> T>(&mut self, init: F) -> &mut T {
        if self.state.is_none() || self.state.as_ref().is_some_and(|s| !s.is::<T>()) {
            self.state = Some(Box::new(init()));
        }
        self.state
            .as_mut()
            .and_then(|s| s.downcast_mut::<T>())
            .expect("coroutine state type just installed")
    }

    pub fn clear_state(&mut self) {
        self.state = None;
    }
}

/// Context handed to every `run` invocation; populated by the worker, not
/// the submitter.
pub struct RunContext<'a> {
    pub worker_id: u32,
    pub lane_id: u32,
    pub ctx: &'a std::sync::Arc<RuntimeCtx>,
    /// Present only for coroutine tasks.
    pub frame: Option<&'a mut CoroFrame>,
}

impl<'a> RunContext<'a> {
    /// A context for verbs executed inline on the caller (constructors,
    /// ingress waits), outside any worker.
    #[must_use]
    pub fn inline(ctx: &'a std::sync::Arc<RuntimeCtx>) -> Self {
        Self {
            worker_id: u32::MAX,
            lane_id: 0,
            ctx,
            frame: None,
        }
    }
}

/// A task state: a named, polymorphic module that executes tasks of
/// specific method ids. Implementations are registered with the
/// [`TaskRegistry`](crate::registry::TaskRegistry) and invoked by workers;
/// states shared between lanes on different workers synchronize internally.
pub trait TaskState: Send + Sync {
    /// Invoke the verb named by `method`. Completion is signalled through
    /// the task's flags, not the return.
    fn run(&self, method: u32, task: TaskAddr, rctx: &mut RunContext<'_>);

    /// Destroy a task of this state, releasing its payload resources and
    /// the task allocation itself.
    fn del(&self, method: u32, task: TaskAddr, ctx: &RuntimeCtx) {
        let _ = method;
        crate::task_alloc::free_task(&ctx.region, task);
    }

    /// Serialize a task's inputs when it first crosses the wire.
    fn save_start(
        &self,
        method: u32,
        ar: &mut SaveArchive,
        task: TaskAddr,
    ) -> RuntimeResult<()> {
        let _ = (ar, task);
        Err(RuntimeError::NotSerializable {
            state: TaskStateId::null(),
            method,
        })
    }

    /// Materialize a freshly-allocated task from ingress inputs.
    fn load_start(
        &self,
        method: u32,
        ar: &mut LoadArchive<'_>,
        ctx: &std::sync::Arc<RuntimeCtx>,
    ) -> RuntimeResult<TaskAddr> {
        let _ = (ar, ctx);
        Err(RuntimeError::NotSerializable {
            state: TaskStateId::null(),
            method,
        })
    }

    /// Serialize a completed task's outputs for the reply.
    fn save_end(&self, method: u32, ar: &mut SaveArchive, task: TaskAddr) -> RuntimeResult<()> {
        let _ = (ar, task);
        Err(RuntimeError::NotSerializable {
            state: TaskStateId::null(),
            method,
        })
    }

    /// Populate the original task's outputs from a replica's reply.
    fn load_end(
        &self,
        replica: u32,
        method: u32,
        ar: &mut LoadArchive<'_>,
        task: TaskAddr,
    ) -> RuntimeResult<()> {
        let _ = (replica, ar, task);
        Err(RuntimeError::NotSerializable {
            state: TaskStateId::null(),
            method,
        })
    }

    /// Report the serialization group of a task. The default is unordered.
    fn get_group(&self, method: u32, task: TaskAddr, buf: &mut Vec<u8>) -> GroupKey {
        let _ = (method, task, buf);
        GroupKey::Unordered
    }

    /// Reserve output slots before dispatching `count` replicas.
    fn replicate_start(&self, method: u32, count: u32, task: TaskAddr) {
        let _ = (method, count, task);
    }

    /// Combine replica outputs after the last reply.
    fn replicate_end(&self, method: u32, task: TaskAddr) {
        let _ = (method, task);
    }

    /// Clone a task once per lane for LaneAll fan-out.
    fn dup(
        &self,
        method: u32,
        task: TaskAddr,
        count: u32,
        ctx: &std::sync::Arc<RuntimeCtx>,
    ) -> Vec<TaskAddr> {
        let _ = (method, task, count, ctx);
        Vec::new()
    }

    /// Observe a duplicate's completion. Invoked by states that aggregate
    /// their own fan-out results.
    fn dup_end(&self, method: u32, replica: u32, orig: TaskAddr, dup: TaskAddr) {
        let _ = (method, replica, orig, dup);
    }
}

#[cfg(test)]
mod test_archives {
    use super::*;

    #[test]
    fn save_then_load_roundtrip() {
        let mut save = SaveArchive::new(DomainId::node(2));
        save.write(&42u32).unwrap();
        save.write(&"placement".to_string()).unwrap();
        let payload = [7u8; 16];
        save.add_xfer(xfer_flags::RECEIVER_READ, payload.as_ptr(), payload.len());

        let (xfers, params) = save.into_parts();
        assert_eq!(xfers.len(), 1);
        assert_eq!(xfers[0].as_slice(), &[7u8; 16]);

        let mut load = LoadArchive::new(None, &params);
        assert_eq!(load.read::<u32>().unwrap(), 42);
        assert_eq!(load.read::<String>().unwrap(), "placement");
        assert!(load.read::<u32>().is_err());
    }

    #[test]
    fn bulk_is_taken_once() {
        let mut bulk = vec![0u8; 8];
        let params: Vec<u8> = Vec::new();
        let mut load = LoadArchive::new(Some(&mut bulk), &params);
        assert!(load.has_bulk());
        assert_eq!(load.take_bulk().unwrap().len(), 8);
        assert!(load.take_bulk().is_err());
    }

    #[test]
    fn coro_frame_state_persists() {
        let mut frame = CoroFrame::new(1024);
        let base = frame.stack_ptr();
        *frame.state_or_insert_with(|| 0u64) += 5;
        *frame.state_or_insert_with(|| 0u64) += 5;
        assert_eq!(*frame.state_or_insert_with(|| 0u64), 10);
        assert_eq!(frame.stack_ptr(), base);
        frame.clear_state();
        assert_eq!(*frame.state_or_insert_with(|| 3u64), 3);
    }
}
