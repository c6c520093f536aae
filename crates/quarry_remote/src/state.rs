//! The remote-queue task state: egress dispatcher for tasks whose domain
//! resolved to other nodes.
//!
//! Workers hand such a task to [`RemoteQueue::disperse`], which submits a
//! coroutine Push task against this state. The Push task serializes the
//! original task, issues one replica call per target node (serially, on a
//! courier thread), feeds each reply back through the owning state's
//! `load_end`, and completes the original.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use quarry_runtime::admin::QueueSpec;
use quarry_runtime::ctx::{RemoteDispatch, RuntimeCtx};
use quarry_runtime::ids::{DomainId, NodeId, TaskStateId};
use quarry_runtime::registry::TaskLibDescriptor;
use quarry_runtime::state::{methods, xfer_flags, RunContext, SaveArchive, TaskState};
use quarry_runtime::state::LoadArchive;
use quarry_runtime::task::{flags, TaskAddr, TaskHeader, TaskPayload, TaskPrio};
use quarry_shm::ShmPointer;

use crate::client::RpcClient;
use crate::errors::RpcResult;
use crate::proto::IoType;
use crate::server::RpcServer;

pub const REMOTE_QUEUE_LIB: &str = "remote_queue";

pub mod remote_methods {
    use quarry_runtime::state::methods::FIRST_CUSTOM;

    /// Dispatch a local task to its remote targets.
    pub const PUSH: u32 = FIRST_CUSTOM;
}

/// Upper bound on replicas of one dispatch.
pub const MAX_REPLICAS: usize = 64;

#[repr(C)]
pub struct PushPayload {
    /// The task being dispatched.
    pub orig: ShmPointer<TaskHeader>,
    pub targets: [u32; MAX_REPLICAS],
    pub num_targets: u32,
    _pad: u32,
}
unsafe impl TaskPayload for PushPayload {}

/// What the courier thread is doing for one Push task; lives in the
/// coroutine frame across yields.
struct DispatchTracker {
    launched: bool,
    done: Arc<AtomicBool>,
    results: Arc<Mutex<Vec<(u32, RpcResult<Vec<u8>>)>>>,
}

impl Default for DispatchTracker {
    fn default() -> Self {
        Self {
            launched: false,
            done: Arc::new(AtomicBool::new(false)),
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// The wire plan derived from `save_start`'s transfer list.
enum CallPlan {
    Small,
    Bulk {
        data: *mut u8,
        len: usize,
        io: IoType,
    },
}

unsafe impl Send for CallPlan {}

pub struct RemoteQueueState {
    ctx: OnceLock<Arc<RuntimeCtx>>,
    client: Arc<RpcClient>,
}

impl RemoteQueueState {
    #[must_use]
    pub fn descriptor(client: Arc<RpcClient>) -> TaskLibDescriptor {
        TaskLibDescriptor::new(REMOTE_QUEUE_LIB, move || {
            Box::new(RemoteQueueState {
                ctx: OnceLock::new(),
                client: client.clone(),
            })
        })
    }

    fn ctx(&self) -> &Arc<RuntimeCtx> {
        self.ctx.get().expect("remote queue constructed")
    }

    /// The Push verb. Re-entered by the worker until the courier thread
    /// reports completion.
    fn push(&self, task: TaskAddr, rctx: &mut RunContext<'_>) {
        let ctx = self.ctx().clone();
        let p = task.payload::<PushPayload>();

        let Ok(orig) = TaskAddr::from_shm(&ctx.region, p.orig) else {
            tracing::error!("push task references a task outside the region");
            task.header().set_module_complete();
            return;
        };
        let Some(exec) = ctx.registry.get_state(orig.header().state) else {
            tracing::error!(state = %orig.header().state, "push for unknown task state");
            orig.header().set_module_complete();
            task.header().set_module_complete();
            return;
        };
        let Some(frame) = rctx.frame.as_mut() else {
            tracing::error!("push task without a coroutine frame");
            task.header().set_module_complete();
            return;
        };

        let tracker = frame.state_or_insert_with(DispatchTracker::default);
        if !tracker.launched {
            tracker.launched = true;
            let method = orig.header().method;
            let targets: Vec<NodeId> = p.targets[..p.num_targets as usize].to_vec();

            let mut ar = SaveArchive::new(DomainId::node(ctx.node_id()));
            if let Err(err) = exec.state().save_start(method, &mut ar, orig) {
                tracing::error!(%err, "task does not serialize; completing with no output");
                orig.header().set_module_complete();
                task.header().set_module_complete();
                return;
            }
            let (xfers, params) = ar.into_parts();

            let plan = match xfers.len() {
                0 => CallPlan::Small,
                1 => {
                    let io = if xfers[0].flags & xfer_flags::RECEIVER_READ != 0 {
                        IoType::Write
                    } else {
                        IoType::Read
                    };
                    CallPlan::Bulk {
                        data: xfers[0].data as *mut u8,
                        len: xfers[0].len,
                        io,
                    }
                }
                n => {
                    tracing::error!(
                        transfers = n,
                        state = %orig.header().state,
                        method,
                        "task does not support remote calls"
                    );
                    orig.header().set_module_complete();
                    task.header().set_module_complete();
                    return;
                }
            };

            exec.state()
                .replicate_start(method, targets.len() as u32, orig);
            self.launch_courier(
                exec.id,
                method,
                targets,
                params,
                plan,
                tracker.done.clone(),
                tracker.results.clone(),
            );
            // Yield until the courier finishes.
            return;
        }

        if !tracker.done.load(Ordering::Acquire) {
            return;
        }

        let method = orig.header().method;
        let results = tracker.results.lock();
        for (replica, result) in results.iter() {
            match result {
                Ok(reply) => {
                    let mut ar = LoadArchive::new(None, reply);
                    if let Err(err) = exec.state().load_end(*replica, method, &mut ar, orig) {
                        tracing::error!(%err, replica, "failed to load replica output");
                    }
                }
                Err(err) => {
                    // Surface as a completed task with no output for this
                    // replica; the caller distinguishes via its fields.
                    tracing::error!(%err, replica, "replica dispatch failed");
                }
            }
        }
        drop(results);

        exec.state().replicate_end(method, orig);
        orig.header().set_module_complete();
        tracing::debug!(task = %orig.header().task_node, "remote dispatch complete");
        task.header().set_module_complete();
    }

    /// Issue the replica calls serially on a courier thread so the worker
    /// keeps polling its lanes while the wire is busy.
    #[allow(clippy::too_many_arguments)]
    fn launch_courier(
        &self,
        state: TaskStateId,
        method: u32,
        targets: Vec<NodeId>,
        params: Vec<u8>,
        plan: CallPlan,
        done: Arc<AtomicBool>,
        results: Arc<Mutex<Vec<(u32, RpcResult<Vec<u8>>)>>>,
    ) {
        let client = self.client.clone();
        std::thread::Builder::new()
            .name("quarry_courier".to_string())
            .spawn(move || {
                for (replica, node) in targets.iter().enumerate() {
                    let result = match &plan {
                        CallPlan::Small => {
                            tracing::debug!(node, method, "small push");
                            client.push_small(*node, state, method, params.clone())
                        }
                        CallPlan::Bulk { data, len, io } => {
                            tracing::debug!(node, method, len, ?io, "bulk push");
                            let bulk = unsafe { std::slice::from_raw_parts_mut(*data, *len) };
                            client.push_bulk(*node, state, method, params.clone(), bulk, *io)
                        }
                    };
                    results.lock().push((replica as u32, result));
                }
                done.store(true, Ordering::Release);
            })
            .expect("spawn courier thread");
    }
}

impl TaskState for RemoteQueueState {
    fn run(&self, method: u32, task: TaskAddr, rctx: &mut RunContext<'_>) {
        match method {
            methods::CONSTRUCT => {
                let _ = self.ctx.set(rctx.ctx.clone());
                task.header().set_module_complete();
            }
            methods::DESTRUCT => task.header().set_module_complete(),
            remote_methods::PUSH => self.push(task, rctx),
            other => {
                tracing::error!(method = other, "unknown remote-queue method");
                task.header().set_module_complete();
            }
        }
    }
}

/// The handle the worker pool uses to push tasks off-node.
pub struct RemoteQueue {
    state_id: TaskStateId,
    server: Arc<RpcServer>,
}

impl RemoteDispatch for RemoteQueue {
    fn disperse(&self, ctx: &Arc<RuntimeCtx>, task: TaskAddr, targets: Vec<NodeId>) {
        let header = task.header();
        if targets.is_empty() || targets.len() > MAX_REPLICAS {
            tracing::error!(
                targets = targets.len(),
                task = %header.task_node,
                "cannot disperse task"
            );
            header.set_module_complete();
            return;
        }
        let mut payload = PushPayload {
            orig: task.shm(),
            targets: [0; MAX_REPLICAS],
            num_targets: targets.len() as u32,
            _pad: 0,
        };
        for (slot, node) in payload.targets.iter_mut().zip(targets.iter()) {
            *slot = *node;
        }
        let push = ctx.new_task(
            self.state_id,
            header.task_node.child(1),
            DomainId::local(),
            TaskPrio::LowLatency,
            header.lane_hash,
            remote_methods::PUSH,
            flags::COROUTINE | flags::FIRE_AND_FORGET,
            payload,
        );
        match push {
            Ok(push) => {
                ctx.submit(push);
            }
            Err(err) => {
                tracing::error!(%err, "failed to allocate push task");
                header.set_module_complete();
            }
        }
    }

    fn stop(&self) {
        self.server.stop();
    }
}

/// Everything the daemon keeps alive for the transport.
pub struct RemoteHandle {
    pub server: Arc<RpcServer>,
    pub client: Arc<RpcClient>,
    pub state_id: TaskStateId,
}

/// Bring up the transport on an initialized runtime: start the server,
/// create the remote-queue state and install the dispatcher.
pub fn start_transport(
    ctx: &Arc<RuntimeCtx>,
    hosts: crate::hosts::HostTable,
    num_threads: usize,
    queue_depth: u32,
) -> RpcResult<RemoteHandle> {
    let client = Arc::new(RpcClient::new(hosts.clone()));
    let server = RpcServer::start(ctx.clone(), &hosts, num_threads)?;

    ctx.registry
        .register_builtin(RemoteQueueState::descriptor(client.clone()));
    // Reserved unique: the remote queue exists on every node before the
    // node-1 naming authority is reachable.
    let state_id = TaskStateId::with_hash(
        ctx.node_id(),
        quarry_runtime::ctx::name_hash(REMOTE_QUEUE_LIB),
        quarry_runtime::queue_manager::REMOTE_QUEUE_UNIQUE,
    );
    let qid = quarry_runtime::ids::QueueId::from(state_id);
    match ctx
        .queues
        .create_queue(qid, &QueueSpec::default_for_state(4, queue_depth).to_infos())
    {
        Ok(queue) => queue.set_ready(),
        Err(quarry_runtime::RuntimeError::QueueExists(_)) => {}
        Err(err) => return Err(err.into()),
    }
    let ctor = ctx.new_task_root(
        state_id,
        DomainId::local(),
        TaskPrio::Admin,
        0,
        methods::CONSTRUCT,
        0,
        (),
    )?;
    ctx.registry
        .create_task_state(REMOTE_QUEUE_LIB, REMOTE_QUEUE_LIB, state_id, ctor, ctx)?;
    ctx.del_task(ctor);

    ctx.set_remote(Arc::new(RemoteQueue {
        state_id,
        server: server.clone(),
    }));
    ctx.set_num_hosts(hosts.num_hosts());

    Ok(RemoteHandle {
        server,
        client,
        state_id,
    })
}
