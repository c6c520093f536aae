//! Built-in work-orchestrator policies: the queue scheduler assigns lanes
//! to workers, the process scheduler re-pins workers over the online cores.
//! Both run as long-running Schedule tasks on the admin lane of worker 0.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use crate::ctx::RuntimeCtx;
use crate::errors::RuntimeResult;
use crate::ids::{DomainId, TaskNode, TaskStateId};
use crate::registry::TaskLibDescriptor;
use crate::state::{methods, RunContext, TaskState};
use crate::task::{flags, TaskAddr, TaskPrio};
use crate::worker::WorkEntry;

pub const SCHED_QUEUES_LIB: &str = "sched_queues_rr";
pub const SCHED_PROCS_LIB: &str = "sched_procs_rr";

/// The Schedule verb shared by every scheduler policy state.
pub const SCHEDULE: u32 = methods::FIRST_CUSTOM;

/// Interval between Schedule invocations.
const SCHEDULE_PERIOD_US: u64 = 20_000;

/// Submit a long-running Schedule task against `policy` on the admin lane.
pub fn spawn_schedule_task(
    ctx: &Arc<RuntimeCtx>,
    policy: TaskStateId,
    task_node: TaskNode,
) -> RuntimeResult<TaskAddr> {
    let task = ctx.new_task(
        policy,
        task_node,
        DomainId::local(),
        TaskPrio::Admin,
        0,
        SCHEDULE,
        flags::LONG_RUNNING,
        (),
    )?;
    task.header_mut().set_period_us(SCHEDULE_PERIOD_US);
    let Some(queue) = ctx.queues.get_queue(ctx.queues.admin_queue) else {
        return Err(crate::errors::RuntimeError::QueueMissing(
            ctx.queues.admin_queue,
        ));
    };
    // Half-full refusal keeps the scheduler from wedging its own lane.
    if !queue.emplace_frac(TaskPrio::Admin, 0, task.offset()) {
        queue.emplace(TaskPrio::Admin, 0, task.offset());
    }
    Ok(task)
}

/// Round-robin queue scheduler: low-priority groups (admin, long-running)
/// go to worker 0; everything else spreads over workers 1..N.
#[derive(Default)]
pub struct SchedQueuesRr {
    ctx: OnceLock<Arc<RuntimeCtx>>,
    count: AtomicU32,
}

impl SchedQueuesRr {
    #[must_use]
    pub fn descriptor() -> TaskLibDescriptor {
        TaskLibDescriptor::new(SCHED_QUEUES_LIB, || Box::<SchedQueuesRr>::default())
    }

    fn schedule(&self) {
        let Some(ctx) = self.ctx.get() else { return };
        let Some(orchestrator) = ctx.orchestrator() else {
            return;
        };
        let num_workers = orchestrator.num_workers();
        for queue in ctx.queues.live_queues() {
            if !queue.is_ready() {
                continue;
            }
            for group in queue.groups() {
                let scheduled = group.num_scheduled();
                if scheduled >= group.num_lanes {
                    continue;
                }
                for lane_id in scheduled..group.num_lanes {
                    let worker_id = if group.is_low_priority() || num_workers == 1 {
                        0
                    } else {
                        let turn = self.count.fetch_add(1, Ordering::Relaxed);
                        (turn as usize % (num_workers - 1)) + 1
                    };
                    tracing::debug!(
                        queue = %queue.id(),
                        prio = group.prio,
                        lane = lane_id,
                        worker = worker_id,
                        "scheduling lane"
                    );
                    orchestrator.worker(worker_id as u32).poll_queues(vec![
                        WorkEntry::new(
                            TaskPrio::from_u32(group.prio),
                            lane_id,
                            queue.id(),
                            group.flags,
                        ),
                    ]);
                }
                group.set_num_scheduled(group.num_lanes);
            }
        }
    }
}

impl TaskState for SchedQueuesRr {
    fn run(&self, method: u32, task: TaskAddr, rctx: &mut RunContext<'_>) {
        match method {
            methods::CONSTRUCT => {
                let _ = self.ctx.set(rctx.ctx.clone());
                task.header().set_module_complete();
            }
            methods::DESTRUCT => task.header().set_module_complete(),
            SCHEDULE => self.schedule(),
            other => {
                tracing::error!(method = other, "unknown queue-scheduler method");
                task.header().set_module_complete();
            }
        }
    }
}

/// Round-robin process scheduler: asks each worker to re-pin itself over
/// the online cores.
#[derive(Default)]
pub struct SchedProcsRr {
    ctx: OnceLock<Arc<RuntimeCtx>>,
}

impl SchedProcsRr {
    #[must_use]
    pub fn descriptor() -> TaskLibDescriptor {
        TaskLibDescriptor::new(SCHED_PROCS_LIB, || Box::<SchedProcsRr>::default())
    }

    fn schedule(&self) {
        let Some(ctx) = self.ctx.get() else { return };
        let Some(orchestrator) = ctx.orchestrator() else {
            return;
        };
        let cores = core_affinity::get_core_ids().unwrap_or_default();
        if cores.is_empty() {
            return;
        }
        let current = orchestrator.worker_cores();
        for (index, worker) in orchestrator.workers().iter().enumerate() {
            let desired = cores[index % cores.len()].id;
            if current.get(index).copied() != Some(desired) {
                worker.request_core(desired);
            }
        }
    }
}

impl TaskState for SchedProcsRr {
    fn run(&self, method: u32, task: TaskAddr, rctx: &mut RunContext<'_>) {
        match method {
            methods::CONSTRUCT => {
                let _ = self.ctx.set(rctx.ctx.clone());
                task.header().set_module_complete();
            }
            methods::DESTRUCT => task.header().set_module_complete(),
            SCHEDULE => self.schedule(),
            other => {
                tracing::error!(method = other, "unknown proc-scheduler method");
                task.header().set_module_complete();
            }
        }
    }
}
