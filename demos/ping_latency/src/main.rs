//! Round-trip latency of small metadata tasks through a single-node
//! runtime: submit N no-op tasks, wait for each, report percentiles.
//!
//! Usage: `ping_latency [count]` (default 10_000).

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use quarry_client::Runtime;
use quarry_runtime::admin::QueueSpec;
use quarry_runtime::config::ServerConfig;
use quarry_runtime::ctx::RuntimeCtx;
use quarry_runtime::ids::{DomainId, TaskStateId};
use quarry_runtime::registry::TaskLibDescriptor;
use quarry_runtime::state::{methods, RunContext, TaskState};
use quarry_runtime::task::{TaskAddr, TaskPayload, TaskPrio};

const PING: u32 = methods::FIRST_CUSTOM;

#[repr(C)]
#[derive(Default)]
struct PingPayload {
    ret: u32,
    _pad: u32,
}
unsafe impl TaskPayload for PingPayload {}

#[derive(Default)]
struct PingState {
    ctx: OnceLock<Arc<RuntimeCtx>>,
}

impl TaskState for PingState {
    fn run(&self, method: u32, task: TaskAddr, rctx: &mut RunContext<'_>) {
        match method {
            methods::CONSTRUCT => {
                let _ = self.ctx.set(rctx.ctx.clone());
                task.header().set_module_complete();
            }
            methods::DESTRUCT => task.header().set_module_complete(),
            PING => {
                task.payload::<PingPayload>().ret = 1;
                task.header().set_module_complete();
            }
            other => {
                tracing::error!(method = other, "unknown ping method");
                task.header().set_module_complete();
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let count: usize = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(10_000);

    let dir = tempfile::tempdir().expect("scratch dir");
    let mut config = ServerConfig::default();
    config.queue_manager.shm_dir = dir.path().to_string_lossy().into_owned();
    config.queue_manager.shm_name = format!("ping_latency_{}", std::process::id());
    config.rpc.port = 0; // ephemeral; this demo never leaves the node

    let runtime = Runtime::start_with_config(config).expect("runtime start");
    runtime
        .ctx()
        .registry
        .register_builtin(TaskLibDescriptor::new("ping", || {
            Box::<PingState>::default()
        }));
    let client = runtime.client();
    let state = client
        .create_task_state(
            "ping",
            "ping",
            TaskStateId::null(),
            QueueSpec::default_for_state(4, 1024),
        )
        .expect("create ping state");

    // Warm the lanes before timing.
    for i in 0..256u32 {
        run_one(client, state, i);
    }

    let mut samples = Vec::with_capacity(count);
    let wall = Instant::now();
    for i in 0..count {
        let started = Instant::now();
        run_one(client, state, i as u32);
        samples.push(started.elapsed().as_nanos() as u64);
    }
    let elapsed = wall.elapsed();

    samples.sort_unstable();
    let pct = |p: f64| samples[((samples.len() - 1) as f64 * p) as usize];
    println!("tasks:       {count}");
    println!(
        "throughput:  {:.0} tasks/sec",
        count as f64 / elapsed.as_secs_f64()
    );
    println!("p50 latency: {} ns", pct(0.50));
    println!("p99 latency: {} ns", pct(0.99));
    println!("max latency: {} ns", samples[samples.len() - 1]);

    runtime.stop();
    runtime.shutdown();
}

fn run_one(client: &quarry_client::Client, state: TaskStateId, lane_hash: u32) {
    let task = client
        .new_task_root(
            state,
            DomainId::local(),
            TaskPrio::LowLatency,
            lane_hash,
            PING,
            0,
            PingPayload::default(),
        )
        .expect("allocate task");
    client.submit_and_wait(task).expect("submit");
    assert_eq!(task.payload::<PingPayload>().ret, 1);
    client.del_task(task);
}
