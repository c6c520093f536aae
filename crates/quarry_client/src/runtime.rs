//! Runtime bootstrap: creates the region, queue manager, registry, worker
//! pool and transport, then serves until asked to stop.

use std::path::Path;
use std::sync::Arc;

use quarry_remote::{HostTable, RemoteHandle};
use quarry_runtime::admin::AdminState;
use quarry_runtime::config::ServerConfig;
use quarry_runtime::ctx::RuntimeCtx;
use quarry_runtime::ids::DomainId;
use quarry_runtime::ids::TaskStateId;
use quarry_runtime::orchestrator::WorkOrchestrator;
use quarry_runtime::proc_queue::ProcQueueState;
use quarry_runtime::queue_manager::QueueManager;
use quarry_runtime::registry::TaskRegistry;
use quarry_runtime::state::methods;
use quarry_runtime::task::TaskPrio;
use quarry_runtime::worch::{self, SchedProcsRr, SchedQueuesRr};
use quarry_shm::ShmRegion;

use crate::client::Client;
use crate::errors::ClientResult;

pub struct Runtime {
    ctx: Arc<RuntimeCtx>,
    client: Client,
    orchestrator: Arc<WorkOrchestrator>,
    remote: RemoteHandle,
    config: ServerConfig,
}

impl Runtime {
    /// Bring the node up. Setup failures are fatal for the daemon; they
    /// surface as errors here.
    pub fn start(server_conf: &str) -> ClientResult<Self> {
        let config = ServerConfig::load(server_conf)?;
        Self::start_with_config(config)
    }

    pub fn start_with_config(config: ServerConfig) -> ClientResult<Self> {
        let span = tracing::info_span!("runtime_start");
        let _enter = span.enter();

        // Node identity comes from the host table before anything touches
        // the region.
        let hosts = HostTable::from_config(&config.rpc)?;
        let node_id = hosts.this_node();

        let qm_config = &config.queue_manager;
        let region = Arc::new(ShmRegion::create(
            Path::new(&qm_config.shm_dir),
            &qm_config.shm_name,
            qm_config.shm_size,
        )?);
        region.set_node_id(node_id);

        let queues = QueueManager::server_init(region.clone(), node_id, qm_config)?;

        let registry = TaskRegistry::new();
        registry.register_builtin(AdminState::descriptor());
        registry.register_builtin(ProcQueueState::descriptor());
        registry.register_builtin(SchedQueuesRr::descriptor());
        registry.register_builtin(SchedProcsRr::descriptor());

        let ctx = RuntimeCtx::new(region.clone(), queues.clone(), registry);
        let orchestrator = WorkOrchestrator::server_init(&ctx, &config.work_orchestrator);

        // The admin state executes on the reserved admin queue.
        let admin_ctor = ctx.new_task_root(
            queues.admin_state,
            DomainId::local(),
            TaskPrio::Admin,
            0,
            methods::CONSTRUCT,
            0,
            (),
        )?;
        ctx.registry.create_task_state(
            quarry_runtime::admin::ADMIN_LIB,
            quarry_runtime::admin::ADMIN_LIB,
            queues.admin_state,
            admin_ctor,
            &ctx,
        )?;
        ctx.del_task(admin_ctor);

        // The process queue doubles as a task state so submitters can push
        // through it without addressing a state's own queue.
        let proc_state = TaskStateId::from(queues.process_queue);
        let proc_ctor = ctx.new_task_root(
            proc_state,
            DomainId::local(),
            TaskPrio::Admin,
            0,
            methods::CONSTRUCT,
            0,
            (),
        )?;
        ctx.registry.create_task_state(
            quarry_runtime::proc_queue::PROC_QUEUE_LIB,
            quarry_runtime::proc_queue::PROC_QUEUE_LIB,
            proc_state,
            proc_ctor,
            &ctx,
        )?;
        ctx.del_task(proc_ctor);

        // Default scheduling policies: queue RR + process RR, installed
        // through the admin verbs so later policy swaps retire them.
        let client = Client::from_parts(region.clone(), queues);
        let mut policies = Vec::new();
        for lib in [worch::SCHED_QUEUES_LIB, worch::SCHED_PROCS_LIB] {
            let policy = ctx.registry.get_or_create_state_id(lib, &ctx);
            let ctor = ctx.new_task_root(
                policy,
                DomainId::local(),
                TaskPrio::Admin,
                0,
                methods::CONSTRUCT,
                0,
                (),
            )?;
            ctx.registry.create_task_state(lib, lib, policy, ctor, &ctx)?;
            ctx.del_task(ctor);
            policies.push(policy);
        }
        client.set_work_orch_queue_policy(policies[0])?;
        client.set_work_orch_proc_policy(policies[1])?;

        let remote = quarry_remote::start_transport(
            &ctx,
            hosts,
            config.rpc.num_threads,
            qm_config.queue_depth,
        )?;

        // Bootstrap task libraries from the configuration.
        for lib in &config.task_libs {
            ctx.registry.register_lib(lib)?;
        }

        region.set_ready();
        tracing::info!(node_id, "runtime up");

        Ok(Self {
            ctx,
            client,
            orchestrator,
            remote,
            config,
        })
    }

    #[must_use]
    pub fn ctx(&self) -> &Arc<RuntimeCtx> {
        &self.ctx
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.orchestrator.is_runtime_alive()
    }

    /// Block until StopRuntime (or [`Runtime::stop`]) is observed, then
    /// tear the node down.
    pub fn wait_for_stop(self) {
        while self.orchestrator.is_runtime_alive() {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        self.shutdown();
    }

    /// Ask the runtime to come down without going through the admin queue.
    pub fn stop(&self) {
        self.orchestrator.finalize_runtime();
    }

    /// Join workers and transport, then drop the region.
    pub fn shutdown(self) {
        tracing::info!("runtime shutting down");
        self.orchestrator.join();
        self.remote.server.join();
        self.client.region().unlink();
    }
}
