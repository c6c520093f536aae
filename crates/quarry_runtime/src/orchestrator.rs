//! The work orchestrator: owns the worker pool, binds workers to CPUs and
//! decides which lanes each worker polls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::WorkOrchestratorConfig;
use crate::ctx::RuntimeCtx;
use crate::task::TaskPrio;
use crate::worker::{spawn_worker, WorkEntry, WorkerConfig, WorkerHandle};

pub struct WorkOrchestrator {
    workers: Vec<WorkerHandle>,
    /// Workers keep looping while set.
    alive: Arc<AtomicBool>,
    /// Cleared when StopRuntime asks the daemon to come down.
    stop_runtime: AtomicBool,
    worker_cores: Vec<usize>,
    all_cores: Vec<usize>,
}

impl WorkOrchestrator {
    /// Spawn the worker pool, pin workers round-robin over the online
    /// cores, and schedule the admin queue on worker 0.
    pub fn server_init(ctx: &Arc<RuntimeCtx>, config: &WorkOrchestratorConfig) -> Arc<Self> {
        let span = tracing::trace_span!("work_orchestrator_init");
        let _enter = span.enter();

        let cores = core_affinity::get_core_ids().unwrap_or_default();
        let num_workers = config.max_workers();
        let alive = Arc::new(AtomicBool::new(true));
        let worker_config = WorkerConfig {
            continuous_polling: config.continuous_polling,
            sleep_us: config.worker_sleep_us,
            retries: config.worker_retries,
        };

        let mut workers = Vec::with_capacity(num_workers);
        let mut worker_cores = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let core = if cores.is_empty() {
                None
            } else {
                Some(cores[worker_id % cores.len()])
            };
            worker_cores.push(core.map_or(usize::MAX, |c| c.id));
            workers.push(spawn_worker(
                worker_id as u32,
                ctx.clone(),
                alive.clone(),
                core,
                worker_config,
            ));
        }

        let orchestrator = Arc::new(Self {
            workers,
            alive,
            stop_runtime: AtomicBool::new(false),
            worker_cores,
            all_cores: cores.iter().map(|c| c.id).collect(),
        });
        ctx.set_orchestrator(orchestrator.clone());

        // Admin lanes always live on worker 0.
        if let Some(queue) = ctx.queues.get_queue(ctx.queues.admin_queue) {
            let group = queue.group(TaskPrio::Admin);
            for lane_id in 0..group.num_lanes {
                orchestrator.workers[0].poll_queues(vec![WorkEntry::new(
                    TaskPrio::Admin,
                    lane_id,
                    ctx.queues.admin_queue,
                    group.flags,
                )]);
            }
            group.set_num_scheduled(group.num_lanes);
        }

        tracing::info!(num_workers, "started workers");
        orchestrator
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn worker(&self, id: u32) -> &WorkerHandle {
        &self.workers[id as usize]
    }

    #[must_use]
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Sum of the flush gauges across the pool.
    #[must_use]
    pub fn total_pending_work(&self) -> i64 {
        self.workers.iter().map(WorkerHandle::pending_work).sum()
    }

    /// Cores the worker pool occupies.
    #[must_use]
    pub fn worker_cores(&self) -> &[usize] {
        &self.worker_cores
    }

    /// Online cores no worker is pinned to. Used by the process scheduler
    /// to place helper threads away from the pool.
    #[must_use]
    pub fn worker_cores_complement(&self) -> Vec<usize> {
        self.all_cores
            .iter()
            .copied()
            .filter(|core| !self.worker_cores.contains(core))
            .collect()
    }

    /// Begin finalizing the daemon: the main loop observes this and joins.
    pub fn finalize_runtime(&self) {
        self.stop_runtime.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_runtime_alive(&self) -> bool {
        !self.stop_runtime.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Stop and join every worker. Workers drain their current iteration
    /// before exiting.
    pub fn join(&self) {
        let span = tracing::trace_span!("work_orchestrator_join");
        let _enter = span.enter();
        self.alive.store(false, Ordering::Release);
        for worker in &self.workers {
            worker.join();
        }
        tracing::info!("work orchestrator joined");
    }
}
