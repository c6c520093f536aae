//! Shared test fixtures: the `ping_bench` task state and cluster harness
//! helpers.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};

use quarry_client::Runtime;
use quarry_runtime::config::ServerConfig;
use quarry_runtime::ctx::RuntimeCtx;
use quarry_runtime::errors::RuntimeResult;
use quarry_runtime::ids::{DomainId, TaskStateId};
use quarry_runtime::registry::TaskLibDescriptor;
use quarry_runtime::state::{methods, LoadArchive, RunContext, SaveArchive, TaskState, xfer_flags};
use quarry_runtime::task::{TaskAddr, TaskPayload};

pub const PING_LIB: &str = "ping_bench";

pub const MD: u32 = methods::FIRST_CUSTOM;
pub const XOR: u32 = methods::FIRST_CUSTOM + 1;
pub const IO_WRITE: u32 = methods::FIRST_CUSTOM + 2;
pub const IO_READ: u32 = methods::FIRST_CUSTOM + 3;

pub const MAX_REPS: usize = 8;
pub const IO_SIZE: usize = 4096;
pub const XOR_SIZE: usize = 32;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MdPayload {
    /// One output slot per replica; resized by `replicate_start`.
    pub ret: quarry_shm::PodArray<i32>,
    pub nreps: u32,
    _pad: u32,
}
unsafe impl TaskPayload for MdPayload {}

impl MdPayload {
    pub fn new(region: &quarry_shm::ShmRegion) -> Self {
        Self {
            ret: quarry_shm::PodArray::alloc(region, 1).expect("allocate ret slots"),
            nreps: 1,
            _pad: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct XorPayload {
    pub input: [u8; XOR_SIZE],
    pub out: [[u8; XOR_SIZE]; MAX_REPS],
    pub key: u8,
    pub nreps: u8,
    _pad: [u8; 6],
}
unsafe impl TaskPayload for XorPayload {}

impl XorPayload {
    pub fn new(input: [u8; XOR_SIZE], key: u8) -> Self {
        Self {
            input,
            out: [[0; XOR_SIZE]; MAX_REPS],
            key,
            nreps: 1,
            _pad: [0; 6],
        }
    }
}

#[repr(C)]
pub struct IoPayload {
    pub data: [u8; IO_SIZE],
    pub ret: i32,
    _pad: u32,
}
unsafe impl TaskPayload for IoPayload {}

impl IoPayload {
    pub fn filled(byte: u8) -> Self {
        Self {
            data: [byte; IO_SIZE],
            ret: 0,
            _pad: 0,
        }
    }
}

impl Default for IoPayload {
    fn default() -> Self {
        Self::filled(0)
    }
}

/// A metadata/IO echo state, used by the scenario tests.
#[derive(Default)]
pub struct PingState {
    ctx: OnceLock<Arc<RuntimeCtx>>,
    id: OnceLock<TaskStateId>,
}

impl PingState {
    pub fn descriptor() -> TaskLibDescriptor {
        TaskLibDescriptor::new(PING_LIB, || Box::<PingState>::default())
    }

    fn ctx(&self) -> &Arc<RuntimeCtx> {
        self.ctx.get().expect("ping state constructed")
    }
}

impl TaskState for PingState {
    fn run(&self, method: u32, task: TaskAddr, rctx: &mut RunContext<'_>) {
        match method {
            methods::CONSTRUCT => {
                let _ = self.ctx.set(rctx.ctx.clone());
                let _ = self.id.set(task.header().state);
                task.header().set_module_complete();
            }
            methods::DESTRUCT => task.header().set_module_complete(),
            MD => {
                let p = task.payload::<MdPayload>();
                if let Ok(ret) = p.ret.as_mut_slice(&self.ctx().region) {
                    ret[0] = 1;
                }
                task.header().set_module_complete();
            }
            XOR => {
                let node = self.ctx().node_id() as u8;
                let p = task.payload::<XorPayload>();
                for i in 0..XOR_SIZE {
                    p.out[0][i] = p.input[i] ^ p.key;
                }
                // Stamp the executing node so replica ordering is visible.
                p.out[0][XOR_SIZE - 1] = node;
                task.header().set_module_complete();
            }
            IO_WRITE => {
                let p = task.payload::<IoPayload>();
                p.ret = i32::from(p.data.iter().all(|byte| *byte == 10));
                task.header().set_module_complete();
            }
            IO_READ => {
                let p = task.payload::<IoPayload>();
                p.data = [10; IO_SIZE];
                p.ret = 1;
                task.header().set_module_complete();
            }
            other => {
                tracing::error!(method = other, "unknown ping method");
                task.header().set_module_complete();
            }
        }
    }

    fn save_start(&self, method: u32, ar: &mut SaveArchive, task: TaskAddr) -> RuntimeResult<()> {
        ar.write_task_meta(task)?;
        match method {
            MD => Ok(()),
            XOR => {
                let p = task.payload::<XorPayload>();
                ar.write(&p.input)?;
                ar.write(&p.key)
            }
            IO_WRITE => {
                let p = task.payload::<IoPayload>();
                ar.add_xfer(xfer_flags::RECEIVER_READ, p.data.as_ptr(), IO_SIZE);
                Ok(())
            }
            IO_READ => {
                let p = task.payload::<IoPayload>();
                ar.add_xfer(xfer_flags::RECEIVER_WRITE, p.data.as_ptr(), IO_SIZE);
                Ok(())
            }
            _ => Err(quarry_runtime::RuntimeError::NotSerializable {
                state: self.id.get().copied().unwrap_or_else(TaskStateId::null),
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
        let id = *self.id.get().expect("ping state constructed");
        let meta = ar.read_task_meta()?;
        match method {
            MD => ctx.new_task(
                id,
                meta.task_node,
                DomainId::local(),
                meta.prio(),
                meta.lane_hash,
                method,
                0,
                MdPayload::new(&ctx.region),
            ),
            XOR => {
                let input: [u8; XOR_SIZE] = ar.read()?;
                let key: u8 = ar.read()?;
                ctx.new_task(
                    id,
                    meta.task_node,
                    DomainId::local(),
                    meta.prio(),
                    meta.lane_hash,
                    method,
                    0,
                    XorPayload::new(input, key),
                )
            }
            IO_WRITE => {
                let task = ctx.new_task(
                    id,
                    meta.task_node,
                    DomainId::local(),
                    meta.prio(),
                    meta.lane_hash,
                    method,
                    0,
                    IoPayload::default(),
                )?;
                let bulk = ar.take_bulk()?;
                let p = task.payload::<IoPayload>();
                let len = bulk.len().min(IO_SIZE);
                p.data[..len].copy_from_slice(&bulk[..len]);
                Ok(task)
            }
            IO_READ => ctx.new_task(
                id,
                meta.task_node,
                DomainId::local(),
                meta.prio(),
                meta.lane_hash,
                method,
                0,
                IoPayload::default(),
            ),
            _ => Err(quarry_runtime::RuntimeError::NotSerializable { state: id, method }),
        }
    }

    fn save_end(&self, method: u32, ar: &mut SaveArchive, task: TaskAddr) -> RuntimeResult<()> {
        match method {
            MD => {
                let p = task.payload::<MdPayload>();
                ar.write(&p.ret.as_slice(&self.ctx().region)?[0])
            }
            XOR => ar.write(&task.payload::<XorPayload>().out[0]),
            IO_WRITE => ar.write(&task.payload::<IoPayload>().ret),
            IO_READ => {
                let p = task.payload::<IoPayload>();
                ar.add_xfer(xfer_flags::RECEIVER_WRITE, p.data.as_ptr(), IO_SIZE);
                ar.write(&p.ret)
            }
            _ => Err(quarry_runtime::RuntimeError::NotSerializable {
                state: self.id.get().copied().unwrap_or_else(TaskStateId::null),
                method,
            }),
        }
    }

    fn load_end(
        &self,
        replica: u32,
        method: u32,
        ar: &mut LoadArchive<'_>,
        task: TaskAddr,
    ) -> RuntimeResult<()> {
        match method {
            MD => {
                let p = task.payload::<MdPayload>();
                p.ret.as_mut_slice(&self.ctx().region)?[replica as usize] = ar.read()?;
                Ok(())
            }
            XOR => {
                task.payload::<XorPayload>().out[replica as usize] = ar.read()?;
                Ok(())
            }
            IO_WRITE | IO_READ => {
                task.payload::<IoPayload>().ret = ar.read()?;
                Ok(())
            }
            _ => Err(quarry_runtime::RuntimeError::NotSerializable {
                state: self.id.get().copied().unwrap_or_else(TaskStateId::null),
                method,
            }),
        }
    }

    fn replicate_start(&self, method: u32, count: u32, task: TaskAddr) {
        match method {
            MD => {
                let p = task.payload::<MdPayload>();
                p.nreps = count;
                if let Err(err) = p.ret.resize(&self.ctx().region, count as usize) {
                    tracing::error!(%err, "failed to reserve replica slots");
                }
            }
            XOR => task.payload::<XorPayload>().nreps = count as u8,
            _ => {}
        }
    }

    fn del(&self, method: u32, task: TaskAddr, ctx: &RuntimeCtx) {
        if method == MD {
            task.payload::<MdPayload>().ret.free(&ctx.region);
        }
        quarry_runtime::task_alloc::free_task(&ctx.region, task);
    }
}

static NEXT_PORT: AtomicU16 = AtomicU16::new(0);

/// A port unlikely to collide across tests in this process.
pub fn unique_port() -> u16 {
    let slot = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    21000 + ((std::process::id() as u16) % 997) * 8 % 8000 + slot * 2
}

/// Config for one test node: private region, loopback transport.
pub fn node_config(dir: &std::path::Path, tag: &str, port: u16) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.queue_manager.shm_dir = dir.to_string_lossy().into_owned();
    config.queue_manager.shm_name = format!("quarry_{tag}");
    config.queue_manager.shm_size = 32 << 20;
    config.queue_manager.max_lanes = 4;
    config.work_orchestrator.max_dworkers = 2;
    config.work_orchestrator.max_oworkers = 0;
    config.rpc.port = port;
    config
}

/// Start a runtime with the ping state registered and created.
pub fn start_node(config: ServerConfig) -> (Runtime, TaskStateId) {
    let runtime = Runtime::start_with_config(config).expect("runtime start");
    runtime.ctx().registry.register_builtin(PingState::descriptor());
    let state = runtime
        .client()
        .create_task_state(
            PING_LIB,
            PING_LIB,
            TaskStateId::null(),
            quarry_runtime::admin::QueueSpec::default_for_state(4, 64),
        )
        .expect("create ping state");
    (runtime, state)
}
