//! Workers: OS threads that repeatedly poll their assigned lanes and run
//! tasks cooperatively.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use concurrent_queue::ConcurrentQueue;
use parking_lot::Mutex;

use crate::ctx::RuntimeCtx;
use crate::ids::{QueueId, TaskNode};
use crate::lane::LaneRef;
use crate::queue::QueueRef;
use crate::registry::RegisteredState;
use crate::state::{CoroFrame, GroupKey, RunContext, CORO_STACK_SIZE};
use crate::task::{flags, now_ns, TaskAddr, TaskPrio};

/// Non-low-latency lanes are only visited every this many ticks.
const SLOW_LANE_PERIOD: u32 = 4096;
/// Slots examined per lane per visit.
const MAX_SLOTS_PER_VISIT: usize = 1024;

/// Identifies one lane a worker polls.
#[derive(Clone, Copy, Debug)]
pub struct WorkEntry {
    pub prio: TaskPrio,
    pub lane_id: u32,
    pub queue: QueueId,
    /// Copied from the group flags; low-latency lanes are polled every
    /// tick, everything else is amortized.
    low_latency: bool,
    count: u32,
}

impl WorkEntry {
    #[must_use]
    pub fn new(prio: TaskPrio, lane_id: u32, queue: QueueId, group_flags: u32) -> Self {
        Self {
            prio,
            lane_id,
            queue,
            low_latency: group_flags & crate::lane::lane_flags::LOW_LATENCY != 0,
            count: 0,
        }
    }
}

impl PartialEq for WorkEntry {
    fn eq(&self, other: &Self) -> bool {
        self.queue == other.queue && self.prio == other.prio && self.lane_id == other.lane_id
    }
}

impl Eq for WorkEntry {}

/// State shared between a worker thread and its handle.
pub struct WorkerShared {
    pub id: u32,
    poll_queues: ConcurrentQueue<Vec<WorkEntry>>,
    relinquish_queues: ConcurrentQueue<Vec<WorkEntry>>,
    /// Incomplete, non-long-running tasks the worker saw on its last
    /// iteration; read by the flush verb.
    pending: AtomicI64,
    /// Core the worker should re-pin itself to (usize::MAX = leave as is).
    requested_core: AtomicUsize,
}

/// The orchestrator-facing side of a worker.
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Hand the worker additional lanes to poll. Single producer: the
    /// queue scheduler running on the admin worker.
    pub fn poll_queues(&self, entries: Vec<WorkEntry>) {
        if self.shared.poll_queues.push(entries).is_err() {
            tracing::error!(worker = self.shared.id, "poll queue channel full or closed");
        }
    }

    /// Revoke lanes from the worker.
    pub fn relinquish_queues(&self, entries: Vec<WorkEntry>) {
        if self.shared.relinquish_queues.push(entries).is_err() {
            tracing::error!(
                worker = self.shared.id,
                "relinquish queue channel full or closed"
            );
        }
    }

    /// Ask the worker to migrate itself onto `core`.
    pub fn request_core(&self, core: usize) {
        self.shared.requested_core.store(core, Ordering::Release);
    }

    #[must_use]
    pub fn pending_work(&self) -> i64 {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if let Err(err) = handle.join() {
                tracing::error!(worker = self.shared.id, ?err, "worker thread panicked");
            }
        }
    }
}

/// Worker polling configuration.
#[derive(Clone, Copy, Debug)]
pub struct WorkerConfig {
    pub continuous_polling: bool,
    pub sleep_us: u64,
    pub retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        // Continuous polling keeps the amortized (non-low-latency) lanes
        // responsive; deployments trade CPU for latency here.
        Self {
            continuous_polling: true,
            sleep_us: 0,
            retries: 1,
        }
    }
}

/// Spawn a worker thread. `alive` gates the loop; `core` pins the thread.
pub fn spawn_worker(
    id: u32,
    ctx: Arc<RuntimeCtx>,
    alive: Arc<AtomicBool>,
    core: Option<core_affinity::CoreId>,
    config: WorkerConfig,
) -> WorkerHandle {
    let shared = Arc::new(WorkerShared {
        id,
        poll_queues: ConcurrentQueue::bounded(1024),
        relinquish_queues: ConcurrentQueue::bounded(1024),
        pending: AtomicI64::new(0),
        requested_core: AtomicUsize::new(usize::MAX),
    });
    let thread_shared = shared.clone();
    let thread = std::thread::Builder::new()
        .name(format!("quarry_worker_{id}"))
        .spawn(move || {
            let span = tracing::trace_span!("worker", id);
            let _enter = span.enter();
            if let Some(core) = core {
                core_affinity::set_for_current(core);
            }
            let mut worker = Worker {
                id,
                ctx,
                shared: thread_shared,
                work_queue: Vec::new(),
                group_map: HashMap::new(),
                group_buf: Vec::with_capacity(512),
                frames: HashMap::new(),
                preemptive: HashMap::new(),
                config,
            };
            worker.run_loop(&alive);
        })
        .expect("spawn worker thread");
    WorkerHandle {
        shared,
        thread: Mutex::new(Some(thread)),
    }
}

struct Worker {
    id: u32,
    ctx: Arc<RuntimeCtx>,
    shared: Arc<WorkerShared>,
    work_queue: Vec<WorkEntry>,
    /// Serializes tasks that share a group key; see `check_task_group`.
    group_map: HashMap<Vec<u8>, TaskNode>,
    group_buf: Vec<u8>,
    /// Coroutine frames, keyed by task offset.
    frames: HashMap<u64, CoroFrame>,
    /// Preemptive task threads, keyed by task offset.
    preemptive: HashMap<u64, JoinHandle<()>>,
    config: WorkerConfig,
}

impl Worker {
    fn run_loop(&mut self, alive: &AtomicBool) {
        tracing::debug!(worker = self.id, "worker loop starting");
        while alive.load(Ordering::Acquire) {
            for _ in 0..self.config.retries.max(1) {
                self.run_iteration();
            }
            self.apply_core_request();
            self.yield_per_config();
        }
        // One drain pass so admin shutdown tasks complete before exit.
        self.run_iteration();
        tracing::debug!(worker = self.id, "worker loop finished");
    }

    fn yield_per_config(&self) {
        if self.config.continuous_polling {
            return;
        }
        if self.config.sleep_us > 0 {
            std::thread::sleep(std::time::Duration::from_micros(self.config.sleep_us));
        } else {
            std::thread::yield_now();
        }
    }

    fn apply_core_request(&self) {
        let requested = self.shared.requested_core.swap(usize::MAX, Ordering::AcqRel);
        if requested != usize::MAX {
            core_affinity::set_for_current(core_affinity::CoreId { id: requested });
            tracing::debug!(worker = self.id, core = requested, "worker re-pinned");
        }
    }

    fn run_iteration(&mut self) {
        self.drain_poll_queues();
        self.drain_relinquish_queues();

        let mut pending = 0i64;
        for i in 0..self.work_queue.len() {
            let entry = {
                let entry = &mut self.work_queue[i];
                // Skip slow lanes most ticks.
                if !entry.low_latency {
                    entry.count = entry.count.wrapping_add(1);
                    if entry.count % SLOW_LANE_PERIOD != 0 {
                        continue;
                    }
                }
                *entry
            };
            pending += self.poll_grouped(entry);
        }
        self.shared.pending.store(pending, Ordering::Release);
    }

    fn drain_poll_queues(&mut self) {
        while let Ok(entries) = self.shared.poll_queues.pop() {
            for entry in entries {
                tracing::debug!(
                    worker = self.id,
                    queue = %entry.queue,
                    prio = ?entry.prio,
                    lane = entry.lane_id,
                    "lane assigned"
                );
                self.work_queue.push(entry);
            }
        }
        // Admin before long-running before low-latency within a tick.
        self.work_queue
            .sort_by_key(|entry| (entry.prio as u32, entry.queue.unique(), entry.lane_id));
    }

    fn drain_relinquish_queues(&mut self) {
        while let Ok(entries) = self.shared.relinquish_queues.pop() {
            for entry in entries {
                self.work_queue.retain(|kept| *kept != entry);
            }
        }
    }

    /// Poll one lane, honoring group serialization. Returns the number of
    /// queued, incomplete, non-long-running tasks observed (flush gauge).
    fn poll_grouped(&mut self, entry: WorkEntry) -> i64 {
        let ctx = self.ctx.clone();
        let Some(queue) = ctx.queues.get_queue(entry.queue) else {
            return 0;
        };
        let group = queue.group(entry.prio);
        if !group.is_active() || entry.lane_id >= group.num_lanes {
            return 0;
        }
        let lane = queue.lane(entry.prio, entry.lane_id);

        let mut pending = 0i64;
        let mut off = 0u64;
        for _ in 0..MAX_SLOTS_PER_VISIT {
            let Some(slot) = lane.peek(off) else { break };
            if slot.is_complete() {
                Self::pop_task(&lane, &mut off);
                continue;
            }

            let task = match TaskAddr::from_shm(&ctx.region, quarry_shm::ShmPointer::from_offset(
                slot.task_offset(),
            )) {
                Ok(task) => task,
                Err(err) => {
                    tracing::error!(worker = self.id, %err, "lane slot points outside region");
                    slot.set_complete();
                    Self::pop_task(&lane, &mut off);
                    continue;
                }
            };
            let header = task.header();

            let Some(state) = ctx.registry.get_state(header.state) else {
                tracing::error!(
                    worker = self.id,
                    state = %header.state,
                    task = %header.task_node,
                    "could not find the task state"
                );
                slot.set_complete();
                self.end_task(&ctx, &lane, None, task, &mut off);
                continue;
            };

            let is_remote = header
                .domain
                .is_remote(ctx.num_hosts(), ctx.node_id());
            let now = now_ns();
            let should = !header.is_run_disabled()
                && self.check_task_group(&state, task, entry.lane_id, is_remote)
                && header.should_run(now, ctx.flush.is_flushing());

            if should {
                self.dispatch(&ctx, &queue, &entry, &state, task, is_remote);
                task.header_mut().did_run(now);
            }

            if header.is_module_complete() {
                slot.set_complete();
                self.frames.remove(&task.offset());
                if let Some(thread) = self.preemptive.remove(&task.offset()) {
                    if let Err(err) = thread.join() {
                        tracing::error!(worker = self.id, ?err, "preemptive task panicked");
                    }
                }
                self.remove_task_group(&state, task, entry.lane_id, is_remote);
                self.end_task(&ctx, &lane, Some(&state), task, &mut off);
            } else {
                if !header.is_long_running() {
                    pending += 1;
                }
                off += 1;
            }
        }
        pending
    }

    /// Execute or hand off one runnable task.
    fn dispatch(
        &mut self,
        ctx: &Arc<RuntimeCtx>,
        queue: &QueueRef<'_>,
        entry: &WorkEntry,
        state: &Arc<RegisteredState>,
        task: TaskAddr,
        is_remote: bool,
    ) {
        let header = task.header();
        if is_remote {
            let targets = ctx.resolve_domain(header.domain);
            match ctx.remote() {
                Some(remote) => {
                    remote.disperse(ctx, task, targets);
                    header.set_disable_run();
                    header.set_unordered();
                    header.unset_coroutine();
                }
                None => {
                    tracing::error!(
                        worker = self.id,
                        task = %header.task_node,
                        "remote task but no dispatcher installed"
                    );
                    header.set_module_complete();
                }
            }
        } else if header.is_lane_all() {
            self.disperse_local(ctx, queue, entry, state, task);
        } else if header.is_coroutine() {
            let frame = self
                .frames
                .entry(task.offset())
                .or_insert_with(|| CoroFrame::new(CORO_STACK_SIZE));
            if !header.is_started() {
                header.set_started();
            }
            let mut rctx = RunContext {
                worker_id: self.id,
                lane_id: entry.lane_id,
                ctx,
                frame: Some(frame),
            };
            state.state().run(header.method, task, &mut rctx);
        } else if header.is_preemptive() {
            header.set_disable_run();
            self.spawn_preemptive(ctx, state, task);
        } else {
            header.set_started();
            let mut rctx = RunContext {
                worker_id: self.id,
                lane_id: entry.lane_id,
                ctx,
                frame: None,
            };
            state.state().run(header.method, task, &mut rctx);
        }
    }

    /// Fan a LaneAll task out: one duplicate per lane of its group, then
    /// retire the original.
    fn disperse_local(
        &mut self,
        ctx: &Arc<RuntimeCtx>,
        queue: &QueueRef<'_>,
        entry: &WorkEntry,
        state: &Arc<RegisteredState>,
        task: TaskAddr,
    ) {
        let header = task.header();
        let group = queue.group(entry.prio);
        let dups = state
            .state()
            .dup(header.method, task, group.num_lanes, ctx);
        if dups.is_empty() {
            tracing::warn!(
                worker = self.id,
                state = %state.name,
                "lane-all task has no dup support; completing without fan-out"
            );
        }
        for (lane_id, dup) in dups.iter().enumerate() {
            let dup_header = dup.header();
            dup_header.unset_lane_all();
            dup_header.set_flags(flags::FIRE_AND_FORGET);
            queue.emplace_on_lane(entry.prio, lane_id as u32, dup.offset());
        }
        header.set_disable_run();
        header.set_unordered();
        header.unset_coroutine();
        header.unset_lane_all();
        header.set_module_complete();
    }

    fn spawn_preemptive(
        &mut self,
        ctx: &Arc<RuntimeCtx>,
        state: &Arc<RegisteredState>,
        task: TaskAddr,
    ) {
        let ctx = ctx.clone();
        let state = state.clone();
        let worker_id = self.id;
        let thread = std::thread::Builder::new()
            .name(format!("quarry_preempt_{}", task.offset()))
            .spawn(move || {
                let header = task.header();
                loop {
                    let now = now_ns();
                    if header.should_run(now, ctx.flush.is_flushing()) {
                        let mut rctx = RunContext {
                            worker_id,
                            lane_id: 0,
                            ctx: &ctx,
                            frame: None,
                        };
                        state.state().run(header.method, task, &mut rctx);
                        task.header_mut().did_run(now);
                    }
                    if header.is_module_complete() {
                        break;
                    }
                    let nap = header.period_ns.clamp(100_000, 5_000_000);
                    std::thread::sleep(std::time::Duration::from_nanos(nap));
                }
            })
            .expect("spawn preemptive thread");
        self.preemptive.insert(task.offset(), thread);
    }

    /// Whether the task may run now under group serialization. Remote,
    /// already-started and lane-all tasks bypass the group map.
    fn check_task_group(
        &mut self,
        state: &Arc<RegisteredState>,
        task: TaskAddr,
        lane_id: u32,
        is_remote: bool,
    ) -> bool {
        let header = task.header();
        if is_remote || header.is_started() || header.is_lane_all() {
            return true;
        }
        self.group_buf.clear();
        let key = state
            .state()
            .get_group(header.method, task, &mut self.group_buf);
        if key == GroupKey::Unordered || header.is_unordered() {
            return true;
        }
        // Scope the group to this lane on this worker.
        self.group_buf.extend_from_slice(&lane_id.to_le_bytes());

        let node = header.task_node;
        match self.group_map.get_mut(self.group_buf.as_slice()) {
            None => {
                let mut entry = node;
                entry.depth = 1;
                self.group_map.insert(self.group_buf.clone(), entry);
                true
            }
            Some(existing) if existing.root == node.root => {
                // Recursion on the same task graph is permitted.
                existing.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    fn remove_task_group(
        &mut self,
        state: &Arc<RegisteredState>,
        task: TaskAddr,
        lane_id: u32,
        is_remote: bool,
    ) {
        let header = task.header();
        if is_remote {
            return;
        }
        self.group_buf.clear();
        let key = state
            .state()
            .get_group(header.method, task, &mut self.group_buf);
        if key == GroupKey::Unordered || header.is_unordered() {
            return;
        }
        self.group_buf.extend_from_slice(&lane_id.to_le_bytes());

        match self.group_map.get_mut(self.group_buf.as_slice()) {
            Some(entry) => {
                assert!(
                    entry.depth > 0,
                    "group depth underflow for task {} on worker {}; runtime corrupted",
                    header.task_node,
                    self.id
                );
                entry.depth -= 1;
                if entry.depth == 0 {
                    self.group_map.remove(self.group_buf.as_slice());
                }
            }
            None => panic!(
                "group entry missing for task {} on worker {}; runtime corrupted",
                header.task_node, self.id
            ),
        }
    }

    fn end_task(
        &mut self,
        ctx: &Arc<RuntimeCtx>,
        lane: &LaneRef<'_>,
        state: Option<&Arc<RegisteredState>>,
        task: TaskAddr,
        off: &mut u64,
    ) {
        Self::pop_task(lane, off);
        match state {
            Some(state) if task.header().is_fire_and_forget() => {
                state.state().del(task.header().method, task, ctx);
            }
            _ => task.header().set_complete(),
        }
    }

    /// Advance past the current slot: pop when at the head, otherwise the
    /// entry retires later when it reaches the head.
    fn pop_task(lane: &LaneRef<'_>, off: &mut u64) {
        if *off == 0 {
            lane.pop();
        } else {
            *off += 1;
        }
    }
}
