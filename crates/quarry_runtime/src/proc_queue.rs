//! The process-queue task state: lets submitters push work through the
//! built-in process queue when they do not address a state's own queue
//! directly. The push task forwards the wrapped task to its real queue and
//! tracks its completion.

use std::sync::{Arc, OnceLock};

use quarry_shm::ShmPointer;

use crate::ctx::RuntimeCtx;
use crate::registry::TaskLibDescriptor;
use crate::state::{methods, RunContext, TaskState};
use crate::task::{TaskAddr, TaskHeader, TaskPayload};

pub const PROC_QUEUE_LIB: &str = "proc_queue";

pub mod proc_methods {
    use crate::state::methods::FIRST_CUSTOM;

    /// Forward the wrapped task to its state's queue and await it.
    pub const PUSH: u32 = FIRST_CUSTOM;
}

#[repr(C)]
pub struct ProcPushPayload {
    /// The task being forwarded. Owned by the submitter; the push task
    /// never frees it.
    pub subtask: ShmPointer<TaskHeader>,
}
unsafe impl TaskPayload for ProcPushPayload {}

#[derive(Default)]
pub struct ProcQueueState {
    ctx: OnceLock<Arc<RuntimeCtx>>,
}

impl ProcQueueState {
    #[must_use]
    pub fn descriptor() -> TaskLibDescriptor {
        TaskLibDescriptor::new(PROC_QUEUE_LIB, || Box::<ProcQueueState>::default())
    }

    /// The Push verb: a coroutine that submits once, then re-checks the
    /// subtask until it completes.
    fn push(&self, task: TaskAddr, rctx: &mut RunContext<'_>) {
        let Some(ctx) = self.ctx.get() else {
            task.header().set_module_complete();
            return;
        };
        let p = task.payload::<ProcPushPayload>();
        let Ok(subtask) = TaskAddr::from_shm(&ctx.region, p.subtask) else {
            tracing::error!("process-queue push references a task outside the region");
            task.header().set_module_complete();
            return;
        };

        let Some(frame) = rctx.frame.as_mut() else {
            tracing::error!("process-queue push without a coroutine frame");
            task.header().set_module_complete();
            return;
        };
        let submitted = frame.state_or_insert_with(|| false);
        if !*submitted {
            *submitted = true;
            if !ctx.submit(subtask) {
                tracing::error!(
                    state = %subtask.header().state,
                    "process-queue push for unknown task state"
                );
                subtask.header().set_complete();
                task.header().set_module_complete();
            }
            return;
        }
        if subtask.header().is_complete() {
            task.header().set_module_complete();
        }
    }
}

impl TaskState for ProcQueueState {
    fn run(&self, method: u32, task: TaskAddr, rctx: &mut RunContext<'_>) {
        match method {
            methods::CONSTRUCT => {
                let _ = self.ctx.set(rctx.ctx.clone());
                task.header().set_module_complete();
            }
            methods::DESTRUCT => task.header().set_module_complete(),
            proc_methods::PUSH => self.push(task, rctx),
            other => {
                tracing::error!(method = other, "unknown process-queue method");
                task.header().set_module_complete();
            }
        }
    }
}
