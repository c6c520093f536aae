//! End-to-end worker-loop behavior: priority ordering, group
//! serialization, coroutine resumption, reclamation and fan-out.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use serial_test::serial;

use parking_lot::Mutex;

use quarry_runtime::config::{QueueManagerConfig, WorkOrchestratorConfig};
use quarry_runtime::ctx::RuntimeCtx;
use quarry_runtime::ids::{DomainId, QueueId, TaskStateId};
use quarry_runtime::lane::lane_flags;
use quarry_runtime::orchestrator::WorkOrchestrator;
use quarry_runtime::queue::PriorityInfo;
use quarry_runtime::queue_manager::QueueManager;
use quarry_runtime::registry::{TaskLibDescriptor, TaskRegistry};
use quarry_runtime::state::{methods, GroupKey, RunContext, TaskState};
use quarry_runtime::task::{flags, TaskAddr, TaskPayload, TaskPrio};
use quarry_runtime::worker::WorkEntry;
use quarry_shm::{ShmPointer, ShmRegion};

const MARK: u32 = methods::FIRST_CUSTOM;
const GMARK: u32 = methods::FIRST_CUSTOM + 1;
const HOLD: u32 = methods::FIRST_CUSTOM + 2;
const YIELDY: u32 = methods::FIRST_CUSTOM + 3;
const SPAWN_CHILD: u32 = methods::FIRST_CUSTOM + 4;
const DUPME: u32 = methods::FIRST_CUSTOM + 5;
const TICKER: u32 = methods::FIRST_CUSTOM + 6;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct MarkPayload {
    tag: u32,
    _pad: u32,
}
unsafe impl TaskPayload for MarkPayload {}

#[repr(C)]
struct SpawnPayload {
    child: ShmPointer<quarry_runtime::task::TaskHeader>,
}
unsafe impl TaskPayload for SpawnPayload {}

/// Observability shared between the test and the state instance.
#[derive(Default)]
struct ProbeShared {
    log: Mutex<Vec<u32>>,
    dels: AtomicU32,
    gate: AtomicBool,
    frame_ptrs: Mutex<Vec<usize>>,
    ticks: Mutex<Vec<Instant>>,
}

struct ProbeState {
    ctx: OnceLock<Arc<RuntimeCtx>>,
    shared: Arc<ProbeShared>,
}

impl ProbeState {
    fn descriptor(shared: Arc<ProbeShared>) -> TaskLibDescriptor {
        TaskLibDescriptor::new("probe", move || {
            Box::new(ProbeState {
                ctx: OnceLock::new(),
                shared: shared.clone(),
            })
        })
    }
}

impl TaskState for ProbeState {
    fn run(&self, method: u32, task: TaskAddr, rctx: &mut RunContext<'_>) {
        match method {
            methods::CONSTRUCT => {
                let _ = self.ctx.set(rctx.ctx.clone());
                task.header().set_module_complete();
            }
            methods::DESTRUCT => task.header().set_module_complete(),
            MARK | GMARK => {
                self.shared.log.lock().push(task.payload::<MarkPayload>().tag);
                task.header().set_module_complete();
            }
            HOLD => {
                // Holds its group until the test opens the gate.
                if self.shared.gate.load(Ordering::Acquire) {
                    self.shared.log.lock().push(task.payload::<MarkPayload>().tag);
                    task.header().set_module_complete();
                }
            }
            YIELDY => {
                let frame = rctx.frame.as_mut().expect("coroutine frame");
                self.shared
                    .frame_ptrs
                    .lock()
                    .push(frame.stack_ptr() as usize);
                let entries = frame.state_or_insert_with(|| 0u32);
                *entries += 1;
                if *entries >= 3 {
                    task.header().set_module_complete();
                }
            }
            SPAWN_CHILD => {
                let ctx = self.ctx.get().expect("constructed").clone();
                let p = task.payload::<SpawnPayload>();
                if p.child.is_null() {
                    // Same root, same group key, same lane: exercises group
                    // recursion.
                    let child = ctx
                        .new_task(
                            task.header().state,
                            task.header().task_node.child(1),
                            DomainId::local(),
                            TaskPrio::LowLatency,
                            task.header().lane_hash,
                            GMARK,
                            0,
                            MarkPayload { tag: 99, _pad: 0 },
                        )
                        .expect("allocate child");
                    ctx.submit(child);
                    p.child = child.shm();
                    return;
                }
                let child = TaskAddr::from_shm(&ctx.region, p.child).expect("child in region");
                if !child.header().is_complete() {
                    return;
                }
                ctx.del_task(child);
                self.shared.log.lock().push(100);
                task.header().set_module_complete();
            }
            DUPME => {
                self.shared.log.lock().push(1000 + rctx.lane_id);
                task.header().set_module_complete();
            }
            TICKER => {
                let mut ticks = self.shared.ticks.lock();
                ticks.push(Instant::now());
                if ticks.len() >= 3 {
                    task.header().set_module_complete();
                }
            }
            other => panic!("unexpected method {other}"),
        }
    }

    fn del(&self, _method: u32, task: TaskAddr, ctx: &RuntimeCtx) {
        self.shared.dels.fetch_add(1, Ordering::AcqRel);
        quarry_runtime::task_alloc::free_task(&ctx.region, task);
    }

    fn get_group(&self, method: u32, _task: TaskAddr, buf: &mut Vec<u8>) -> GroupKey {
        match method {
            HOLD | GMARK | SPAWN_CHILD => {
                buf.extend_from_slice(b"grp");
                GroupKey::Keyed
            }
            _ => GroupKey::Unordered,
        }
    }

    fn dup(
        &self,
        _method: u32,
        task: TaskAddr,
        count: u32,
        ctx: &Arc<RuntimeCtx>,
    ) -> Vec<TaskAddr> {
        let header = task.header();
        (0..count)
            .map(|lane| {
                ctx.new_task(
                    header.state,
                    header.task_node,
                    DomainId::local(),
                    TaskPrio::from_u32(header.prio),
                    lane,
                    header.method,
                    header.flag_bits(),
                    *task.payload::<MarkPayload>(),
                )
                .expect("allocate dup")
            })
            .collect()
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    ctx: Arc<RuntimeCtx>,
    orchestrator: Arc<WorkOrchestrator>,
    shared: Arc<ProbeShared>,
    state: TaskStateId,
}

impl Harness {
    /// Two workers; the probe state's lanes are all assigned to worker 1 so
    /// its scheduling is deterministic. Every group carries the low-latency
    /// flag to keep the test loop tight.
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let region = Arc::new(ShmRegion::create(dir.path(), "worker_loop", 32 << 20).unwrap());
        region.set_node_id(1);
        let queues = QueueManager::server_init(
            region.clone(),
            1,
            &QueueManagerConfig {
                max_queues: 64,
                max_lanes: 4,
                queue_depth: 64,
                proc_queue_depth: 64,
                ..Default::default()
            },
        )
        .unwrap();

        let shared = Arc::new(ProbeShared::default());
        let registry = TaskRegistry::new();
        registry.register_builtin(ProbeState::descriptor(shared.clone()));

        let ctx = RuntimeCtx::new(region, queues, registry);
        let orchestrator = WorkOrchestrator::server_init(
            &ctx,
            &WorkOrchestratorConfig {
                max_dworkers: 2,
                max_oworkers: 0,
                ..Default::default()
            },
        );

        let state = ctx.registry.get_or_create_state_id("probe", &ctx);
        let qid = QueueId::from(state);
        let queue = ctx
            .queues
            .create_queue(
                qid,
                &[
                    PriorityInfo::new(
                        TaskPrio::Admin,
                        1,
                        1,
                        64,
                        lane_flags::UNORDERED | lane_flags::LOW_LATENCY,
                    ),
                    PriorityInfo::new(
                        TaskPrio::LongRunning,
                        1,
                        1,
                        64,
                        lane_flags::LONG_RUNNING | lane_flags::LOW_LATENCY,
                    ),
                    PriorityInfo::new(TaskPrio::LowLatency, 4, 4, 64, lane_flags::LOW_LATENCY),
                ],
            )
            .unwrap();
        queue.set_ready();

        let ctor = ctx
            .new_task_root(state, DomainId::local(), TaskPrio::Admin, 0, 0, 0, ())
            .unwrap();
        ctx.registry
            .create_task_state("probe", "probe", state, ctor, &ctx)
            .unwrap();
        ctx.del_task(ctor);

        Self {
            _dir: dir,
            ctx,
            orchestrator,
            shared,
            state,
        }
    }

    /// Hand every probe lane to worker 1 in one batch.
    fn assign_lanes(&self) {
        let qid = QueueId::from(self.state);
        let queue = self.ctx.queues.get_queue(qid).unwrap();
        let mut entries = Vec::new();
        for group in queue.groups() {
            for lane_id in 0..group.num_lanes {
                entries.push(WorkEntry::new(
                    TaskPrio::from_u32(group.prio),
                    lane_id,
                    qid,
                    group.flags,
                ));
            }
        }
        self.orchestrator.worker(1).poll_queues(entries);
    }

    fn mark_task(&self, prio: TaskPrio, lane_hash: u32, method: u32, tag: u32, flag_bits: u32) -> TaskAddr {
        let task = self
            .ctx
            .new_task_root(
                self.state,
                DomainId::local(),
                prio,
                lane_hash,
                method,
                flag_bits,
                MarkPayload { tag, _pad: 0 },
            )
            .unwrap();
        self.ctx.submit(task);
        task
    }

    fn wait_until(&self, what: &str, pred: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !pred() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn stop(self) {
        self.orchestrator.join();
    }
}

#[test]
#[serial]
#[tracing_test::traced_test]
fn priority_groups_run_admin_first() {
    let h = Harness::start();

    // Emplace in inverse priority order, then assign all lanes in one
    // batch; the worker visits groups in priority order within a tick.
    let low = h.mark_task(TaskPrio::LowLatency, 0, MARK, 30, 0);
    let long = h.mark_task(TaskPrio::LongRunning, 0, MARK, 20, 0);
    let admin = h.mark_task(TaskPrio::Admin, 0, MARK, 10, 0);
    h.assign_lanes();

    h.wait_until("all marks", || h.shared.log.lock().len() >= 3);
    assert_eq!(&h.shared.log.lock()[..3], &[10, 20, 30]);

    for task in [low, long, admin] {
        assert!(task.header().is_complete());
        h.ctx.del_task(task);
    }
    h.stop();
}

#[test]
#[serial]
fn group_serialization_defers_other_roots() {
    let h = Harness::start();
    h.assign_lanes();

    // A holds group "grp" on lane 0; B (different root, same group, same
    // lane) must not run until A completes.
    let a = h.mark_task(TaskPrio::LowLatency, 0, HOLD, 7, flags::COROUTINE);
    let b = h.mark_task(TaskPrio::LowLatency, 0, GMARK, 8, 0);

    std::thread::sleep(Duration::from_millis(100));
    assert!(h.shared.log.lock().is_empty(), "B ran while A held the group");

    h.shared.gate.store(true, Ordering::Release);
    h.wait_until("hold + gmark", || h.shared.log.lock().len() >= 2);
    assert_eq!(&h.shared.log.lock()[..2], &[7, 8]);

    h.wait_until("completion", || {
        a.header().is_complete() && b.header().is_complete()
    });
    h.ctx.del_task(a);
    h.ctx.del_task(b);
    h.stop();
}

#[test]
#[serial]
fn group_recursion_on_same_root_is_allowed() {
    let h = Harness::start();
    h.assign_lanes();

    // The parent holds the group and spawns a child with the same root and
    // group key on the same lane; the child must still run.
    let parent = h
        .ctx
        .new_task_root(
            h.state,
            DomainId::local(),
            TaskPrio::LowLatency,
            0,
            SPAWN_CHILD,
            flags::COROUTINE,
            SpawnPayload {
                child: ShmPointer::null(),
            },
        )
        .unwrap();
    h.ctx.submit(parent);

    h.wait_until("parent completion", || parent.header().is_complete());
    let log = h.shared.log.lock().clone();
    assert_eq!(log, vec![99, 100], "child ran before parent finished");
    h.ctx.del_task(parent);
    h.stop();
}

#[test]
#[serial]
fn coroutine_resumes_on_the_same_frame() {
    let h = Harness::start();
    h.assign_lanes();

    let task = h.mark_task(TaskPrio::LowLatency, 1, YIELDY, 0, flags::COROUTINE);
    h.wait_until("yieldy completion", || task.header().is_complete());

    let ptrs = h.shared.frame_ptrs.lock().clone();
    assert_eq!(ptrs.len(), 3, "expected three entries into the task");
    assert!(
        ptrs.windows(2).all(|pair| pair[0] == pair[1]),
        "frame moved between resumes: {ptrs:?}"
    );
    h.ctx.del_task(task);
    h.stop();
}

#[test]
#[serial]
fn fire_and_forget_is_reclaimed_via_del() {
    let h = Harness::start();
    h.assign_lanes();

    h.mark_task(TaskPrio::LowLatency, 2, MARK, 5, flags::FIRE_AND_FORGET);
    h.wait_until("del call", || h.shared.dels.load(Ordering::Acquire) >= 1);
    assert_eq!(h.shared.log.lock().as_slice(), &[5]);
    h.stop();
}

#[test]
#[serial]
fn lane_all_runs_once_per_lane() {
    let h = Harness::start();
    h.assign_lanes();

    let task = h.mark_task(TaskPrio::LowLatency, 0, DUPME, 0, flags::LANE_ALL);
    h.wait_until("fan-out", || h.shared.log.lock().len() >= 4);

    let mut lanes = h.shared.log.lock().clone();
    lanes.sort_unstable();
    assert_eq!(lanes, vec![1000, 1001, 1002, 1003]);
    // The duplicates are runtime-owned and reclaimed through del.
    h.wait_until("dup reclaim", || h.shared.dels.load(Ordering::Acquire) >= 4);

    h.wait_until("original completion", || task.header().is_complete());
    h.ctx.del_task(task);
    h.stop();
}

#[test]
#[serial]
fn relinquished_lanes_stop_being_polled() {
    let h = Harness::start();
    h.assign_lanes();

    let first = h.mark_task(TaskPrio::LowLatency, 0, MARK, 1, 0);
    h.wait_until("first mark", || first.header().is_complete());
    h.ctx.del_task(first);

    // Revoke low-latency lane 0; work queued there must sit untouched.
    let qid = QueueId::from(h.state);
    let entry = WorkEntry::new(TaskPrio::LowLatency, 0, qid, lane_flags::LOW_LATENCY);
    h.orchestrator.worker(1).relinquish_queues(vec![entry]);
    std::thread::sleep(Duration::from_millis(50));

    let second = h.mark_task(TaskPrio::LowLatency, 0, MARK, 2, 0);
    std::thread::sleep(Duration::from_millis(100));
    assert!(
        !second.header().is_complete(),
        "revoked lane was still polled"
    );

    // Hand the lane back; the parked task drains.
    h.orchestrator.worker(1).poll_queues(vec![entry]);
    h.wait_until("second mark", || second.header().is_complete());
    h.ctx.del_task(second);
    h.stop();
}

#[test]
#[serial]
fn long_running_task_honors_its_period() {
    let h = Harness::start();
    h.assign_lanes();

    let task = h
        .ctx
        .new_task_root(
            h.state,
            DomainId::local(),
            TaskPrio::LongRunning,
            0,
            TICKER,
            flags::LONG_RUNNING,
            MarkPayload::default(),
        )
        .unwrap();
    task.header_mut().set_period_ms(30);
    h.ctx.submit(task);

    h.wait_until("three ticks", || task.header().is_complete());
    let ticks = h.shared.ticks.lock().clone();
    assert_eq!(ticks.len(), 3);
    for pair in ticks.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(25),
            "runs separated by only {gap:?}"
        );
    }
    h.ctx.del_task(task);
    h.stop();
}
