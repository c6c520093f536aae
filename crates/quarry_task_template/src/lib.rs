//! Starting point for an out-of-tree task library.
//!
//! Copy this crate, rename the state and the exported lib name, add your
//! verbs, and build it as a cdylib. The runtime loads it through
//! `RegisterTaskLib("task_template")` once the resulting
//! `libtask_template.so` is on the `QUARRY_TASK_LIB_PATH`.

use std::sync::{Arc, OnceLock};

use quarry_runtime::ctx::RuntimeCtx;
use quarry_runtime::state::{methods, RunContext, TaskState};
use quarry_runtime::task::{TaskAddr, TaskPayload};

/// Custom verbs start after the constructor/destructor pair.
pub mod template_methods {
    use quarry_runtime::state::methods::FIRST_CUSTOM;

    pub const ECHO: u32 = FIRST_CUSTOM;
}

#[repr(C)]
pub struct EchoPayload {
    pub value: u64,
    /// Out: the value, echoed back.
    pub ret: u64,
}
unsafe impl TaskPayload for EchoPayload {}

#[derive(Default)]
pub struct TemplateState {
    ctx: OnceLock<Arc<RuntimeCtx>>,
}

impl TaskState for TemplateState {
    fn run(&self, method: u32, task: TaskAddr, rctx: &mut RunContext<'_>) {
        match method {
            methods::CONSTRUCT => {
                let _ = self.ctx.set(rctx.ctx.clone());
                tracing::info!("task_template constructed");
                task.header().set_module_complete();
            }
            methods::DESTRUCT => task.header().set_module_complete(),
            template_methods::ECHO => {
                let p = task.payload::<EchoPayload>();
                p.ret = p.value;
                task.header().set_module_complete();
            }
            other => {
                tracing::error!(method = other, "unknown task_template method");
                task.header().set_module_complete();
            }
        }
    }
}

quarry_runtime::task_lib_export!(TemplateState, "task_template");

#[cfg(test)]
mod test_exports {
    #[test]
    fn exported_name_matches() {
        let name = unsafe { std::ffi::CStr::from_ptr(super::get_task_lib_name()) };
        assert_eq!(name.to_str().unwrap(), "task_template");
    }

    #[test]
    fn alloc_state_produces_a_state() {
        let raw = super::alloc_state();
        let state = unsafe { Box::from_raw(raw) };
        drop(state);
    }
}
