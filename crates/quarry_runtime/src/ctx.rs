//! The process-wide runtime context.
//!
//! Everything the original design kept in singletons (client, registry,
//! orchestrator, transport) hangs off one [`RuntimeCtx`] that is passed to
//! tasks through their run context.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use quarry_shm::ShmRegion;

use crate::errors::RuntimeResult;
use crate::ids::{DomainId, NodeId, TaskId, TaskNode, TaskStateId};
use crate::orchestrator::WorkOrchestrator;
use crate::queue::QueueRef;
use crate::queue_manager::QueueManager;
use crate::registry::TaskRegistry;
use crate::task::{TaskAddr, TaskPayload, TaskPrio};
use crate::task_alloc;

/// Flush bookkeeping shared between the admin state and the workers.
#[derive(Default)]
pub struct WorkPending {
    flushing: AtomicBool,
    count: AtomicI64,
}

impl WorkPending {
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub fn set_flushing(&self, on: bool) {
        self.flushing.store(on, Ordering::Release);
    }

    pub fn add_pending(&self, delta: i64) {
        self.count.fetch_add(delta, Ordering::AcqRel);
    }

    #[must_use]
    pub fn pending(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }
}

/// Egress interface of the remote dispatcher. Implemented by the
/// remote-queue task state; installed into the context when the transport
/// comes up.
pub trait RemoteDispatch: Send + Sync {
    /// Take ownership of a task that resolved to remote nodes and dispatch
    /// one replica per target. Completion is signalled through the task's
    /// flags.
    fn disperse(&self, ctx: &Arc<RuntimeCtx>, task: TaskAddr, targets: Vec<NodeId>);

    /// Ask the transport to shut down.
    fn stop(&self);
}

pub struct RuntimeCtx {
    pub region: Arc<ShmRegion>,
    pub queues: QueueManager,
    pub registry: TaskRegistry,
    pub flush: WorkPending,
    node_id: AtomicU32,
    num_hosts: AtomicUsize,
    orchestrator: OnceLock<Arc<WorkOrchestrator>>,
    remote: OnceLock<Arc<dyn RemoteDispatch>>,
}

impl RuntimeCtx {
    #[must_use]
    pub fn new(region: Arc<ShmRegion>, queues: QueueManager, registry: TaskRegistry) -> Arc<Self> {
        let node_id = region.node_id();
        Arc::new(Self {
            region,
            queues,
            registry,
            flush: WorkPending::default(),
            node_id: AtomicU32::new(node_id),
            num_hosts: AtomicUsize::new(1),
            orchestrator: OnceLock::new(),
            remote: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id.load(Ordering::Acquire)
    }

    pub fn set_node_id(&self, node_id: NodeId) {
        self.node_id.store(node_id, Ordering::Release);
        self.region.set_node_id(node_id);
    }

    #[must_use]
    pub fn num_hosts(&self) -> usize {
        self.num_hosts.load(Ordering::Acquire)
    }

    pub fn set_num_hosts(&self, hosts: usize) {
        self.num_hosts.store(hosts.max(1), Ordering::Release);
    }

    pub fn set_orchestrator(&self, orchestrator: Arc<WorkOrchestrator>) {
        let _ = self.orchestrator.set(orchestrator);
    }

    #[must_use]
    pub fn orchestrator(&self) -> Option<&Arc<WorkOrchestrator>> {
        self.orchestrator.get()
    }

    pub fn set_remote(&self, remote: Arc<dyn RemoteDispatch>) {
        let _ = self.remote.set(remote);
    }

    #[must_use]
    pub fn remote(&self) -> Option<&Arc<dyn RemoteDispatch>> {
        self.remote.get()
    }

    /// Resolve a routing domain to the node ids a dispatch must reach.
    #[must_use]
    pub fn resolve_domain(&self, domain: DomainId) -> Vec<NodeId> {
        let this = self.node_id();
        let hosts = self.num_hosts() as u32;
        let mut targets = Vec::new();
        if domain.is_global() {
            targets.extend(1..=hosts);
        } else if domain.is_set() {
            // Named node sets are not materialized yet; a set spans every
            // node, like a global dispatch.
            targets.extend(1..=hosts);
        } else if domain.is_node() {
            if domain.includes_local() && domain.id != this {
                targets.push(this);
            }
            targets.push(domain.id);
        } else {
            targets.push(this);
        }
        targets
    }

    /// Allocate a fresh root task node.
    #[must_use]
    pub fn make_task_node_id(&self) -> TaskNode {
        TaskNode::root(TaskId::new(self.node_id(), self.region.next_unique()))
    }

    /// Allocate a fresh task-state id, hashed by name for lane placement.
    #[must_use]
    pub fn make_task_state_id(&self, name: &str) -> TaskStateId {
        TaskStateId::with_hash(self.node_id(), name_hash(name), self.region.next_unique())
    }

    /// Allocate a typed task in the region.
    #[allow(clippy::too_many_arguments)]
    pub fn new_task<T: TaskPayload>(
        &self,
        state: TaskStateId,
        task_node: TaskNode,
        domain: DomainId,
        prio: TaskPrio,
        lane_hash: u32,
        method: u32,
        flag_bits: u32,
        payload: T,
    ) -> RuntimeResult<TaskAddr> {
        task_alloc::alloc_task(
            &self.region,
            state,
            task_node,
            domain,
            prio,
            lane_hash,
            method,
            flag_bits,
            payload,
        )
    }

    /// Allocate a typed task with a fresh root task node.
    #[allow(clippy::too_many_arguments)]
    pub fn new_task_root<T: TaskPayload>(
        &self,
        state: TaskStateId,
        domain: DomainId,
        prio: TaskPrio,
        lane_hash: u32,
        method: u32,
        flag_bits: u32,
        payload: T,
    ) -> RuntimeResult<TaskAddr> {
        self.new_task(
            state,
            self.make_task_node_id(),
            domain,
            prio,
            lane_hash,
            method,
            flag_bits,
            payload,
        )
    }

    pub fn del_task(&self, task: TaskAddr) {
        task_alloc::free_task(&self.region, task);
    }

    #[must_use]
    pub fn get_queue(&self, id: crate::ids::QueueId) -> Option<QueueRef<'_>> {
        self.queues.get_queue(id)
    }

    /// Emplace a task on its state's queue.
    pub fn submit(&self, task: TaskAddr) -> bool {
        let header = task.header();
        let queue_id = crate::ids::QueueId::from(header.state);
        match self.queues.get_queue(queue_id) {
            Some(queue) => queue.emplace(
                TaskPrio::from_u32(header.prio),
                header.lane_hash,
                task.offset(),
            ),
            None => {
                tracing::error!(state = %header.state, "submit to unknown task state");
                false
            }
        }
    }
}

/// FNV-1a over the state name; partitions states across lanes
/// deterministically on every node.
#[must_use]
pub fn name_hash(name: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod test_ctx {
    use super::*;

    #[test]
    fn name_hash_is_deterministic() {
        assert_eq!(name_hash("bdev"), name_hash("bdev"));
        assert_ne!(name_hash("bdev"), name_hash("bdev2"));
    }
}
