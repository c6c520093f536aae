//! The task registry: loads task-state modules by name and owns the live
//! task-state instances of this node.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::ctx::RuntimeCtx;
use crate::errors::{RuntimeError, RuntimeResult};
use crate::ids::{QueueId, TaskStateId};
use crate::state::{methods, RunContext, TaskState};
use crate::task::TaskAddr;

/// Factory of a statically-linked task library. The runtime registers its
/// built-in libraries (admin, schedulers, remote queue) through this;
/// external libraries arrive as dynamic modules with the same surface.
#[derive(Clone)]
pub struct TaskLibDescriptor {
    pub name: &'static str,
    new_state: Arc<dyn Fn() -> Box<dyn TaskState> + Send + Sync>,
}

impl TaskLibDescriptor {
    pub fn new(
        name: &'static str,
        new_state: impl Fn() -> Box<dyn TaskState> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            new_state: Arc::new(new_state),
        }
    }
}

type RawNewStateFn = unsafe extern "C" fn() -> *mut Box<dyn TaskState>;
type RawLibNameFn = unsafe extern "C" fn() -> *const std::os::raw::c_char;

struct DynamicLib {
    // Dropping the Library unmaps the module; keep it alive as long as the
    // lib is registered.
    _lib: libloading::Library,
    alloc_state: RawNewStateFn,
}

enum TaskLib {
    Builtin(TaskLibDescriptor),
    Dynamic(DynamicLib),
}

impl TaskLib {
    fn new_state(&self) -> Box<dyn TaskState> {
        match self {
            TaskLib::Builtin(desc) => (desc.new_state)(),
            TaskLib::Dynamic(lib) => unsafe { *Box::from_raw((lib.alloc_state)()) },
        }
    }
}

/// A live task state plus the identity the runtime knows it by.
pub struct RegisteredState {
    pub id: TaskStateId,
    pub queue_id: QueueId,
    pub name: String,
    pub lib: String,
    state: Box<dyn TaskState>,
}

impl RegisteredState {
    #[must_use]
    pub fn state(&self) -> &dyn TaskState {
        self.state.as_ref()
    }
}

#[derive(Default)]
struct RegistryInner {
    libs: HashMap<String, TaskLib>,
    states: HashMap<TaskStateId, Arc<RegisteredState>>,
    state_ids: HashMap<String, TaskStateId>,
}

/// Environment variable listing directories searched for dynamic task
/// libraries (colon separated).
pub const TASK_LIB_PATH_ENV: &str = "QUARRY_TASK_LIB_PATH";

#[derive(Default)]
pub struct TaskRegistry {
    inner: RwLock<RegistryInner>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a statically-linked library. Idempotent.
    pub fn register_builtin(&self, desc: TaskLibDescriptor) {
        let mut inner = self.inner.write();
        inner
            .libs
            .entry(desc.name.to_string())
            .or_insert(TaskLib::Builtin(desc));
    }

    /// Load a dynamic task library by name. Idempotent.
    pub fn register_lib(&self, name: &str) -> RuntimeResult<()> {
        {
            let inner = self.inner.read();
            if inner.libs.contains_key(name) {
                return Ok(());
            }
        }
        let lib = load_dynamic(name)?;
        let mut inner = self.inner.write();
        inner.libs.entry(name.to_string()).or_insert(lib);
        tracing::info!(lib = name, "registered task lib");
        Ok(())
    }

    /// Unload a library. Fails while any of its task states is live.
    pub fn destroy_lib(&self, name: &str) -> RuntimeResult<()> {
        let mut inner = self.inner.write();
        if !inner.libs.contains_key(name) {
            return Err(RuntimeError::LibMissing(name.to_string()));
        }
        if inner.states.values().any(|state| state.lib == name) {
            return Err(RuntimeError::LibBusy(name.to_string()));
        }
        inner.libs.remove(name);
        tracing::info!(lib = name, "destroyed task lib");
        Ok(())
    }

    #[must_use]
    pub fn lib_exists(&self, name: &str) -> bool {
        self.inner.read().libs.contains_key(name)
    }

    /// The deterministic naming authority: one id per state name, minted on
    /// first request. In a cluster the admin state routes this to node 1 so
    /// every node agrees.
    pub fn get_or_create_state_id(&self, name: &str, ctx: &RuntimeCtx) -> TaskStateId {
        {
            let inner = self.inner.read();
            if let Some(id) = inner.state_ids.get(name) {
                return *id;
            }
        }
        let mut inner = self.inner.write();
        if let Some(id) = inner.state_ids.get(name) {
            return *id;
        }
        let id = ctx.make_task_state_id(name);
        inner.state_ids.insert(name.to_string(), id);
        id
    }

    /// The id a name resolved to, if any.
    #[must_use]
    pub fn get_state_id(&self, name: &str) -> Option<TaskStateId> {
        self.inner.read().state_ids.get(name).copied()
    }

    /// Instantiate a task state and run its constructor verb inline on the
    /// caller. Creating an id that already exists returns the existing
    /// state.
    pub fn create_task_state(
        &self,
        lib_name: &str,
        state_name: &str,
        id: TaskStateId,
        ctor_task: TaskAddr,
        ctx: &Arc<RuntimeCtx>,
    ) -> RuntimeResult<Arc<RegisteredState>> {
        if id.is_null() {
            return Err(RuntimeError::StateCreate {
                name: state_name.to_string(),
                id,
            });
        }
        let registered = {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.states.get(&id) {
                tracing::debug!(state = state_name, %id, "task state already exists");
                return Ok(existing.clone());
            }
            let lib = inner
                .libs
                .get(lib_name)
                .ok_or_else(|| RuntimeError::LibMissing(lib_name.to_string()))?;
            let state = lib.new_state();
            let registered = Arc::new(RegisteredState {
                id,
                queue_id: QueueId::from(id),
                name: state_name.to_string(),
                lib: lib_name.to_string(),
                state,
            });
            inner.states.insert(id, registered.clone());
            inner.state_ids.insert(state_name.to_string(), id);
            registered
        };
        // Constructor runs outside the lock; it may look up other states
        // or submit tasks.
        let mut rctx = RunContext::inline(ctx);
        registered
            .state()
            .run(methods::CONSTRUCT, ctor_task, &mut rctx);
        tracing::info!(state = state_name, %id, lib = lib_name, "created task state");
        Ok(registered)
    }

    #[must_use]
    pub fn get_state(&self, id: TaskStateId) -> Option<Arc<RegisteredState>> {
        self.inner.read().states.get(&id).cloned()
    }

    #[must_use]
    pub fn get_state_by_name(&self, name: &str) -> Option<Arc<RegisteredState>> {
        let inner = self.inner.read();
        let id = inner.state_ids.get(name)?;
        inner.states.get(id).cloned()
    }

    #[must_use]
    pub fn state_exists(&self, id: TaskStateId) -> bool {
        self.inner.read().states.contains_key(&id)
    }

    /// Run the destructor verb inline, then drop the state.
    pub fn destroy_task_state(
        &self,
        id: TaskStateId,
        dtor_task: TaskAddr,
        ctx: &Arc<RuntimeCtx>,
    ) -> RuntimeResult<()> {
        let registered = self
            .get_state(id)
            .ok_or(RuntimeError::StateMissing(id))?;
        let mut rctx = RunContext::inline(ctx);
        registered
            .state()
            .run(methods::DESTRUCT, dtor_task, &mut rctx);
        let mut inner = self.inner.write();
        inner.states.remove(&id);
        inner.state_ids.remove(&registered.name);
        tracing::info!(state = %registered.name, %id, "destroyed task state");
        Ok(())
    }
}

fn load_dynamic(name: &str) -> RuntimeResult<TaskLib> {
    let mut candidates = Vec::new();
    if let Ok(paths) = std::env::var(TASK_LIB_PATH_ENV) {
        for dir in paths.split(':').filter(|dir| !dir.is_empty()) {
            candidates.push(format!("{dir}/lib{name}.so"));
            candidates.push(format!("{dir}/{name}.so"));
        }
    }
    candidates.push(format!("lib{name}.so"));

    let mut last_err = String::new();
    for candidate in &candidates {
        match unsafe { libloading::Library::new(candidate) } {
            Ok(lib) => {
                return wire_dynamic(name, lib).map_err(|detail| RuntimeError::LibLoad {
                    name: name.to_string(),
                    detail,
                })
            }
            Err(err) => last_err = err.to_string(),
        }
    }
    Err(RuntimeError::LibLoad {
        name: name.to_string(),
        detail: last_err,
    })
}

fn wire_dynamic(name: &str, lib: libloading::Library) -> Result<TaskLib, String> {
    // The symbols borrow the library; extract the raw fn pointers before
    // moving the library into the registry entry.
    let alloc_state = unsafe {
        // The sentinel marks the module as a quarry task lib.
        lib.get::<*const u8>(b"is_quarry_task_lib")
            .map_err(|err| format!("missing sentinel: {err}"))?;
        let lib_name: libloading::Symbol<'_, RawLibNameFn> = lib
            .get(b"get_task_lib_name")
            .map_err(|err| format!("missing get_task_lib_name: {err}"))?;
        let reported = std::ffi::CStr::from_ptr(lib_name())
            .to_string_lossy()
            .into_owned();
        if reported != name {
            return Err(format!("module reports name {reported:?}, expected {name:?}"));
        }
        let alloc_state: libloading::Symbol<'_, RawNewStateFn> = lib
            .get(b"alloc_state")
            .map_err(|err| format!("missing alloc_state: {err}"))?;
        *alloc_state
    };
    Ok(TaskLib::Dynamic(DynamicLib {
        alloc_state,
        _lib: lib,
    }))
}

/// Generate the exported symbol set of a dynamic task library.
///
/// The state type must implement `Default` and
/// [`TaskState`](crate::state::TaskState). The host resolves `alloc_state`
/// and dispatches the constructor verb inline on the caller; `create_state`
/// is exported for hosts that fold both steps into one call.
#[macro_export]
macro_rules! task_lib_export {
    ($state:ty, $name:literal) => {
        #[no_mangle]
        pub extern "C" fn alloc_state() -> *mut Box<dyn $crate::state::TaskState> {
            Box::into_raw(Box::new(
                Box::new(<$state>::default()) as Box<dyn $crate::state::TaskState>
            ))
        }

        #[no_mangle]
        pub extern "C" fn create_state() -> *mut Box<dyn $crate::state::TaskState> {
            alloc_state()
        }

        #[no_mangle]
        pub extern "C" fn get_task_lib_name() -> *const std::os::raw::c_char {
            concat!($name, "\0").as_ptr() as *const std::os::raw::c_char
        }

        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static is_quarry_task_lib: u8 = 1;
    };
}
