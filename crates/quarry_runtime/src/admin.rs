//! The built-in admin task state: task-lib and task-state lifecycle,
//! scheduler policy swaps, runtime stop and flush. Runs on the reserved
//! admin queue on worker 0.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use quarry_shm::ShmString;

use crate::ctx::RuntimeCtx;
use crate::errors::RuntimeResult;
use crate::ids::{DomainId, TaskStateId};
use crate::lane::lane_flags;
use crate::queue::PriorityInfo;
use crate::registry::TaskLibDescriptor;
use crate::state::{
    methods, GroupKey, LoadArchive, RunContext, SaveArchive, TaskState,
};
use crate::task::{flags, TaskAddr, TaskPayload, TaskPrio};
use crate::worch;

/// Library and state name of the admin state.
pub const ADMIN_LIB: &str = "quarry_admin";

/// Admin verbs.
pub mod admin_methods {
    use crate::state::methods::FIRST_CUSTOM;

    pub const REGISTER_TASK_LIB: u32 = FIRST_CUSTOM;
    pub const DESTROY_TASK_LIB: u32 = FIRST_CUSTOM + 1;
    pub const CREATE_TASK_STATE: u32 = FIRST_CUSTOM + 2;
    pub const GET_OR_CREATE_TASK_STATE_ID: u32 = FIRST_CUSTOM + 3;
    pub const GET_TASK_STATE_ID: u32 = FIRST_CUSTOM + 4;
    pub const DESTROY_TASK_STATE: u32 = FIRST_CUSTOM + 5;
    pub const STOP_RUNTIME: u32 = FIRST_CUSTOM + 6;
    pub const SET_WORK_ORCH_QUEUE_POLICY: u32 = FIRST_CUSTOM + 7;
    pub const SET_WORK_ORCH_PROC_POLICY: u32 = FIRST_CUSTOM + 8;
    pub const FLUSH: u32 = FIRST_CUSTOM + 9;
}

/// Wire/payload form of one priority-group spec.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct QueuePrioSpec {
    pub prio: u32,
    pub max_lanes: u32,
    pub num_lanes: u32,
    pub depth: u32,
    pub flags: u32,
}

impl From<PriorityInfo> for QueuePrioSpec {
    fn from(info: PriorityInfo) -> Self {
        Self {
            prio: info.prio as u32,
            max_lanes: info.max_lanes,
            num_lanes: info.num_lanes,
            depth: info.depth,
            flags: info.flags,
        }
    }
}

impl From<QueuePrioSpec> for PriorityInfo {
    fn from(spec: QueuePrioSpec) -> Self {
        PriorityInfo::new(
            TaskPrio::from_u32(spec.prio),
            spec.max_lanes,
            spec.num_lanes,
            spec.depth,
            spec.flags,
        )
    }
}

/// A queue configuration carried inside task payloads.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct QueueSpec {
    pub prios: [QueuePrioSpec; TaskPrio::COUNT],
    pub num_prios: u32,
}

impl QueueSpec {
    #[must_use]
    pub fn from_infos(infos: &[PriorityInfo]) -> Self {
        let mut spec = Self::default();
        for info in infos.iter().take(TaskPrio::COUNT) {
            spec.prios[spec.num_prios as usize] = QueuePrioSpec::from(*info);
            spec.num_prios += 1;
        }
        spec
    }

    #[must_use]
    pub fn to_infos(&self) -> Vec<PriorityInfo> {
        self.prios[..self.num_prios as usize]
            .iter()
            .map(|spec| PriorityInfo::from(*spec))
            .collect()
    }

    /// The default layout for a user task state: admin lane plus a
    /// low-latency group.
    #[must_use]
    pub fn default_for_state(num_lanes: u32, depth: u32) -> Self {
        Self::from_infos(&[
            PriorityInfo::new(TaskPrio::Admin, 1, 1, depth, lane_flags::UNORDERED),
            PriorityInfo::new(TaskPrio::LongRunning, 1, 1, depth, lane_flags::LONG_RUNNING),
            PriorityInfo::new(
                TaskPrio::LowLatency,
                num_lanes,
                num_lanes,
                depth,
                lane_flags::LOW_LATENCY,
            ),
        ])
    }
}

#[repr(C)]
pub struct RegisterTaskLibPayload {
    pub lib_name: ShmString,
}
unsafe impl TaskPayload for RegisterTaskLibPayload {}

#[repr(C)]
pub struct CreateTaskStatePayload {
    pub lib_name: ShmString,
    pub state_name: ShmString,
    /// In: the desired id, or null to consult the naming authority.
    /// Out: the id the state ended up with.
    pub id: TaskStateId,
    pub queue: QueueSpec,
    /// Pending id request while the coroutine waits on node 1.
    pending: quarry_shm::ShmPointer<crate::task::TaskHeader>,
}
unsafe impl TaskPayload for CreateTaskStatePayload {}

impl CreateTaskStatePayload {
    #[must_use]
    pub fn new(lib_name: ShmString, state_name: ShmString, id: TaskStateId, queue: QueueSpec) -> Self {
        Self {
            lib_name,
            state_name,
            id,
            queue,
            pending: quarry_shm::ShmPointer::null(),
        }
    }
}

#[repr(C)]
pub struct StateIdPayload {
    pub state_name: ShmString,
    /// Out: the resolved id (null when unknown).
    pub id: TaskStateId,
}
unsafe impl TaskPayload for StateIdPayload {}

#[repr(C)]
pub struct DestroyTaskStatePayload {
    pub id: TaskStateId,
}
unsafe impl TaskPayload for DestroyTaskStatePayload {}

#[repr(C)]
pub struct SetPolicyPayload {
    pub policy: TaskStateId,
}
unsafe impl TaskPayload for SetPolicyPayload {}

#[repr(C)]
#[derive(Default)]
pub struct FlushPayload {
    /// Consecutive zero-work observations (flush drains when it stays 0).
    pub quiet_rounds: u32,
    _pad: u32,
}
unsafe impl TaskPayload for FlushPayload {}

/// The admin state itself.
#[derive(Default)]
pub struct AdminState {
    ctx: OnceLock<Arc<RuntimeCtx>>,
    id: OnceLock<TaskStateId>,
    /// Scheduler task swap bookkeeping (SetWorkOrch*Policy).
    queue_sched: parking_lot::Mutex<Option<TaskAddr>>,
    proc_sched: parking_lot::Mutex<Option<TaskAddr>>,
}

impl AdminState {
    #[must_use]
    pub fn descriptor() -> TaskLibDescriptor {
        TaskLibDescriptor::new(ADMIN_LIB, || Box::<AdminState>::default())
    }

    fn ctx(&self) -> &Arc<RuntimeCtx> {
        self.ctx.get().expect("admin state constructed")
    }

    fn construct(&self, task: TaskAddr, rctx: &mut RunContext<'_>) {
        let _ = self.ctx.set(rctx.ctx.clone());
        let _ = self.id.set(task.header().state);
        task.header().set_module_complete();
    }

    fn register_task_lib(&self, task: TaskAddr) {
        let ctx = self.ctx();
        let p = task.payload::<RegisterTaskLibPayload>();
        match p.lib_name.as_str(&ctx.region) {
            Ok(name) => {
                if let Err(err) = ctx.registry.register_lib(name) {
                    tracing::error!(%err, "failed to register task lib");
                }
            }
            Err(err) => tracing::error!(%err, "bad lib name in register request"),
        }
        task.header().set_module_complete();
    }

    fn destroy_task_lib(&self, task: TaskAddr) {
        let ctx = self.ctx();
        let p = task.payload::<RegisterTaskLibPayload>();
        if let Ok(name) = p.lib_name.as_str(&ctx.region) {
            if let Err(err) = ctx.registry.destroy_lib(name) {
                tracing::error!(%err, "failed to destroy task lib");
            }
        }
        task.header().set_module_complete();
    }

    /// The CreateTaskState verb. A coroutine: on a multi-node cluster it
    /// may wait for the node-1 naming authority before constructing.
    fn create_task_state(&self, task: TaskAddr, rctx: &mut RunContext<'_>) {
        let ctx = self.ctx().clone();
        let p = task.payload::<CreateTaskStatePayload>();
        let Ok(state_name) = p.state_name.as_str(&ctx.region).map(str::to_string) else {
            tracing::error!("bad state name in create request");
            task.header().set_module_complete();
            return;
        };
        let Ok(lib_name) = p.lib_name.as_str(&ctx.region).map(str::to_string) else {
            tracing::error!("bad lib name in create request");
            task.header().set_module_complete();
            return;
        };

        // Local registry may already hold the state under this name.
        if let Some(existing) = ctx.registry.get_state_by_name(&state_name) {
            p.id = existing.id;
            task.header().set_module_complete();
            return;
        }

        // Resolve the id through the naming authority on node 1.
        if p.id.is_null() {
            if ctx.node_id() == 1 || ctx.num_hosts() == 1 {
                p.id = ctx.registry.get_or_create_state_id(&state_name, &ctx);
            } else if p.pending.is_null() {
                let Ok(child) = self.spawn_get_or_create_id(&ctx, task, &state_name) else {
                    task.header().set_module_complete();
                    return;
                };
                p.pending = child.shm();
                // Yield; the worker re-enters once per iteration.
                return;
            } else {
                let Ok(child) = TaskAddr::from_shm(&ctx.region, p.pending) else {
                    task.header().set_module_complete();
                    return;
                };
                if !child.header().is_complete() {
                    return;
                }
                p.id = child.payload::<StateIdPayload>().id;
                let name = child.payload::<StateIdPayload>().state_name;
                name.free(&ctx.region);
                ctx.del_task(child);
                p.pending = quarry_shm::ShmPointer::null();
            }
        }

        if p.id.is_null() {
            tracing::error!(state = %state_name, "naming authority returned a null id");
            task.header().set_module_complete();
            return;
        }
        if ctx.registry.state_exists(p.id) {
            tracing::debug!(state = %state_name, id = %p.id, "task state already exists");
            task.header().set_module_complete();
            return;
        }

        // Create the queue for the state, then run its constructor inline
        // through the registry (which completes this task).
        let qid = crate::ids::QueueId::from(p.id);
        match ctx.queues.create_queue(qid, &p.queue.to_infos()) {
            Ok(queue) => queue.set_ready(),
            Err(crate::errors::RuntimeError::QueueExists(_)) => {}
            Err(err) => {
                tracing::error!(%err, state = %state_name, "failed to create state queue");
                task.header().set_module_complete();
                return;
            }
        }

        let id = p.id;
        task.header_mut().state = id;
        task.header_mut().method = methods::CONSTRUCT;
        match ctx
            .registry
            .create_task_state(&lib_name, &state_name, id, task, rctx.ctx)
        {
            Ok(_) => {
                tracing::info!(state = %state_name, %id, "created task state");
            }
            Err(err) => {
                tracing::error!(%err, state = %state_name, "failed to create task state");
                task.header().set_module_complete();
            }
        }
    }

    fn spawn_get_or_create_id(
        &self,
        ctx: &Arc<RuntimeCtx>,
        parent: TaskAddr,
        state_name: &str,
    ) -> RuntimeResult<TaskAddr> {
        let admin_id = *self.id.get().expect("admin state constructed");
        let child = ctx.new_task(
            admin_id,
            parent.header().task_node.child(1),
            DomainId::node(1),
            TaskPrio::Admin,
            0,
            admin_methods::GET_OR_CREATE_TASK_STATE_ID,
            0,
            StateIdPayload {
                state_name: ShmString::copy_from(&ctx.region, state_name)?,
                id: TaskStateId::null(),
            },
        )?;
        ctx.submit(child);
        Ok(child)
    }

    fn get_or_create_task_state_id(&self, task: TaskAddr) {
        let ctx = self.ctx();
        let p = task.payload::<StateIdPayload>();
        match p.state_name.as_str(&ctx.region) {
            Ok(name) => p.id = ctx.registry.get_or_create_state_id(name, ctx),
            Err(err) => {
                tracing::error!(%err, "bad state name in id request");
                p.id = TaskStateId::null();
            }
        }
        task.header().set_module_complete();
    }

    fn get_task_state_id(&self, task: TaskAddr) {
        let ctx = self.ctx();
        let p = task.payload::<StateIdPayload>();
        p.id = match p.state_name.as_str(&ctx.region) {
            Ok(name) => ctx.registry.get_state_id(name).unwrap_or_else(TaskStateId::null),
            Err(_) => TaskStateId::null(),
        };
        task.header().set_module_complete();
    }

    fn destroy_task_state(&self, task: TaskAddr, rctx: &mut RunContext<'_>) {
        let ctx = self.ctx();
        let p = task.payload::<DestroyTaskStatePayload>();
        if let Err(err) = ctx.registry.destroy_task_state(p.id, task, rctx.ctx) {
            tracing::error!(%err, id = %p.id, "failed to destroy task state");
        }
        task.header().set_module_complete();
    }

    fn stop_runtime(&self, task: TaskAddr) {
        let ctx = self.ctx();
        tracing::info!("stopping runtime (admin request)");
        if let Some(orchestrator) = ctx.orchestrator() {
            orchestrator.finalize_runtime();
        }
        if let Some(remote) = ctx.remote() {
            remote.stop();
        }
        task.header().set_module_complete();
    }

    /// Replace the active queue-scheduler task with a fresh long-running
    /// Schedule task against the given policy state.
    fn set_work_orch_queue_policy(&self, task: TaskAddr) {
        self.swap_scheduler(task, &self.queue_sched);
    }

    fn set_work_orch_proc_policy(&self, task: TaskAddr) {
        self.swap_scheduler(task, &self.proc_sched);
    }

    fn swap_scheduler(&self, task: TaskAddr, slot: &parking_lot::Mutex<Option<TaskAddr>>) {
        let ctx = self.ctx();
        let p = task.payload::<SetPolicyPayload>();
        let mut slot = slot.lock();
        if let Some(previous) = slot.take() {
            previous.header().set_module_complete();
        }
        match worch::spawn_schedule_task(ctx, p.policy, task.header().task_node.child(1)) {
            Ok(sched) => *slot = Some(sched),
            Err(err) => tracing::error!(%err, policy = %p.policy, "failed to spawn scheduler"),
        }
        task.header().set_module_complete();
    }

    /// Flush: force long-running work through and drain. A coroutine that
    /// completes once the worker pool reports no pending work twice in a
    /// row.
    fn flush(&self, task: TaskAddr) {
        let ctx = self.ctx();
        let p = task.payload::<FlushPayload>();
        ctx.flush.set_flushing(true);
        let pending = ctx
            .orchestrator()
            .map_or(0, |orchestrator| orchestrator.total_pending_work());
        // This admin task itself is still in flight; anything beyond it
        // means the runtime has not drained.
        if pending <= 1 {
            p.quiet_rounds += 1;
        } else {
            p.quiet_rounds = 0;
        }
        if p.quiet_rounds >= 2 {
            ctx.flush.set_flushing(false);
            task.header().set_module_complete();
        }
    }
}

impl TaskState for AdminState {
    fn run(&self, method: u32, task: TaskAddr, rctx: &mut RunContext<'_>) {
        match method {
            methods::CONSTRUCT => self.construct(task, rctx),
            methods::DESTRUCT => task.header().set_module_complete(),
            admin_methods::REGISTER_TASK_LIB => self.register_task_lib(task),
            admin_methods::DESTROY_TASK_LIB => self.destroy_task_lib(task),
            admin_methods::CREATE_TASK_STATE => self.create_task_state(task, rctx),
            admin_methods::GET_OR_CREATE_TASK_STATE_ID => self.get_or_create_task_state_id(task),
            admin_methods::GET_TASK_STATE_ID => self.get_task_state_id(task),
            admin_methods::DESTROY_TASK_STATE => self.destroy_task_state(task, rctx),
            admin_methods::STOP_RUNTIME => self.stop_runtime(task),
            admin_methods::SET_WORK_ORCH_QUEUE_POLICY => self.set_work_orch_queue_policy(task),
            admin_methods::SET_WORK_ORCH_PROC_POLICY => self.set_work_orch_proc_policy(task),
            admin_methods::FLUSH => self.flush(task),
            other => {
                tracing::error!(method = other, "unknown admin method");
                task.header().set_module_complete();
            }
        }
    }

    fn del(&self, method: u32, task: TaskAddr, ctx: &RuntimeCtx) {
        // Free payload strings before the task allocation itself.
        match method {
            admin_methods::REGISTER_TASK_LIB | admin_methods::DESTROY_TASK_LIB => {
                task.payload::<RegisterTaskLibPayload>()
                    .lib_name
                    .free(&ctx.region);
            }
            admin_methods::CREATE_TASK_STATE => {
                let p = task.payload::<CreateTaskStatePayload>();
                p.lib_name.free(&ctx.region);
                p.state_name.free(&ctx.region);
            }
            admin_methods::GET_OR_CREATE_TASK_STATE_ID | admin_methods::GET_TASK_STATE_ID => {
                task.payload::<StateIdPayload>().state_name.free(&ctx.region);
            }
            _ => {}
        }
        crate::task_alloc::free_task(&ctx.region, task);
    }

    fn save_start(
        &self,
        method: u32,
        ar: &mut SaveArchive,
        task: TaskAddr,
    ) -> RuntimeResult<()> {
        let ctx = self.ctx();
        match method {
            admin_methods::GET_OR_CREATE_TASK_STATE_ID | admin_methods::GET_TASK_STATE_ID => {
                ar.write_task_meta(task)?;
                let p = task.payload::<StateIdPayload>();
                ar.write(&p.state_name.as_str(&ctx.region)?.to_string())?;
                Ok(())
            }
            admin_methods::REGISTER_TASK_LIB => {
                ar.write_task_meta(task)?;
                let p = task.payload::<RegisterTaskLibPayload>();
                ar.write(&p.lib_name.as_str(&ctx.region)?.to_string())?;
                Ok(())
            }
            admin_methods::CREATE_TASK_STATE => {
                ar.write_task_meta(task)?;
                let p = task.payload::<CreateTaskStatePayload>();
                ar.write(&p.lib_name.as_str(&ctx.region)?.to_string())?;
                ar.write(&p.state_name.as_str(&ctx.region)?.to_string())?;
                ar.write(&p.id)?;
                ar.write(&p.queue)?;
                Ok(())
            }
            _ => Err(crate::errors::RuntimeError::NotSerializable {
                state: *self.id.get().unwrap_or(&TaskStateId::null()),
                method,
            }),
        }
    }

    fn load_start(
        &self,
        method: u32,
        ar: &mut LoadArchive<'_>,
        ctx: &Arc<RuntimeCtx>,
    ) -> RuntimeResult<TaskAddr> {
        let admin_id = *self.id.get().expect("admin state constructed");
        match method {
            admin_methods::GET_OR_CREATE_TASK_STATE_ID | admin_methods::GET_TASK_STATE_ID => {
                let meta = ar.read_task_meta()?;
                let name: String = ar.read()?;
                ctx.new_task(
                    admin_id,
                    meta.task_node,
                    DomainId::local(),
                    meta.prio(),
                    meta.lane_hash,
                    method,
                    0,
                    StateIdPayload {
                        state_name: ShmString::copy_from(&ctx.region, &name)?,
                        id: TaskStateId::null(),
                    },
                )
            }
            admin_methods::REGISTER_TASK_LIB => {
                let meta = ar.read_task_meta()?;
                let name: String = ar.read()?;
                ctx.new_task(
                    admin_id,
                    meta.task_node,
                    DomainId::local(),
                    meta.prio(),
                    meta.lane_hash,
                    method,
                    0,
                    RegisterTaskLibPayload {
                        lib_name: ShmString::copy_from(&ctx.region, &name)?,
                    },
                )
            }
            admin_methods::CREATE_TASK_STATE => {
                let meta = ar.read_task_meta()?;
                let lib: String = ar.read()?;
                let name: String = ar.read()?;
                let id: TaskStateId = ar.read()?;
                let queue: QueueSpec = ar.read()?;
                ctx.new_task(
                    admin_id,
                    meta.task_node,
                    DomainId::local(),
                    meta.prio(),
                    meta.lane_hash,
                    method,
                    flags::COROUTINE,
                    CreateTaskStatePayload::new(
                        ShmString::copy_from(&ctx.region, &lib)?,
                        ShmString::copy_from(&ctx.region, &name)?,
                        id,
                        queue,
                    ),
                )
            }
            _ => Err(crate::errors::RuntimeError::NotSerializable {
                state: admin_id,
                method,
            }),
        }
    }

    fn save_end(&self, method: u32, ar: &mut SaveArchive, task: TaskAddr) -> RuntimeResult<()> {
        match method {
            admin_methods::GET_OR_CREATE_TASK_STATE_ID | admin_methods::GET_TASK_STATE_ID => {
                ar.write(&task.payload::<StateIdPayload>().id)
            }
            admin_methods::CREATE_TASK_STATE => {
                ar.write(&task.payload::<CreateTaskStatePayload>().id)
            }
            // An explicit ack byte; an all-empty reply means "unknown
            // state" to the dispatcher.
            admin_methods::REGISTER_TASK_LIB => ar.write(&1u8),
            _ => Err(crate::errors::RuntimeError::NotSerializable {
                state: *self.id.get().unwrap_or(&TaskStateId::null()),
                method,
            }),
        }
    }

    fn load_end(
        &self,
        _replica: u32,
        method: u32,
        ar: &mut LoadArchive<'_>,
        task: TaskAddr,
    ) -> RuntimeResult<()> {
        match method {
            admin_methods::GET_OR_CREATE_TASK_STATE_ID | admin_methods::GET_TASK_STATE_ID => {
                task.payload::<StateIdPayload>().id = ar.read()?;
                Ok(())
            }
            admin_methods::CREATE_TASK_STATE => {
                task.payload::<CreateTaskStatePayload>().id = ar.read()?;
                Ok(())
            }
            admin_methods::REGISTER_TASK_LIB => {
                let _: u8 = ar.read()?;
                Ok(())
            }
            _ => Err(crate::errors::RuntimeError::NotSerializable {
                state: *self.id.get().unwrap_or(&TaskStateId::null()),
                method,
            }),
        }
    }

    fn get_group(&self, _method: u32, _task: TaskAddr, _buf: &mut Vec<u8>) -> GroupKey {
        // Admin verbs mutate registry state guarded by its own locks.
        GroupKey::Unordered
    }
}
