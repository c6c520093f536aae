//! The task: one invocation of one method of one task state, living in
//! shared memory.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use quarry_shm::{ShmPointer, ShmRegion};

use crate::ids::{DomainId, TaskNode, TaskStateId};

/// Task flag bits. Transitions are monotonic except where the worker or
/// dispatcher explicitly clears a bit (see the lifecycle table in the
/// runtime docs).
pub mod flags {
    /// Run has been entered at least once.
    pub const HAS_STARTED: u32 = 1 << 0;
    /// Suppresses local Run; ownership was handed to the dispatcher or a
    /// preemptive thread.
    pub const DISABLE_RUN: u32 = 1 << 1;
    /// The task yields; it needs a frame and is re-entered until done.
    pub const COROUTINE: u32 = 1 << 2;
    /// The task state finished its logical work.
    pub const MODULE_COMPLETE: u32 = 1 << 3;
    /// Observers may reclaim the task.
    pub const COMPLETE: u32 = 1 << 4;
    /// The runtime frees the task on completion.
    pub const FIRE_AND_FORGET: u32 = 1 << 5;
    /// The task owns side-allocated buffers.
    pub const DATA_OWNER: u32 = 1 << 6;
    /// Re-runs periodically until torn down. Implies UNORDERED.
    pub const LONG_RUNNING: u32 = (1 << 7) | UNORDERED;
    /// Execute once on every lane of the group.
    pub const LANE_ALL: u32 = 1 << 8;
    /// Exempt from group serialization.
    pub const UNORDERED: u32 = 1 << 9;
    /// Run on a dedicated thread instead of the worker loop.
    pub const PREEMPTIVE: u32 = 1 << 10;
    /// The task participates in a runtime flush.
    pub const FLUSH: u32 = 1 << 11;
    /// Debug-only toggle forcing remote execution under test.
    pub const REMOTE_DEBUG_MARK: u32 = 1 << 31;
}

/// Priority classes, in scheduling precedence order on a worker.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPrio {
    Admin = 0,
    LongRunning = 1,
    LowLatency = 2,
    /// Declared for future scheduling policies; carries no behavior.
    LongRunningTether = 3,
    /// Declared for future scheduling policies; carries no behavior.
    HighLatency = 4,
}

impl TaskPrio {
    pub const COUNT: usize = 5;

    #[must_use]
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Admin,
            1 => Self::LongRunning,
            3 => Self::LongRunningTether,
            4 => Self::HighLatency,
            _ => Self::LowLatency,
        }
    }
}

/// Monotonic nanoseconds since process start; used for long-running task
/// periods. Only the owning worker reads or writes a task's stamp, so the
/// epoch does not need to be shared between processes.
#[must_use]
pub fn now_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// POD header at the front of every task allocation.
#[repr(C)]
pub struct TaskHeader {
    /// Which task state executes this task.
    pub state: TaskStateId,
    /// Identity within its task graph. Immutable for the task's lifetime.
    pub task_node: TaskNode,
    /// Where the task should run.
    pub domain: DomainId,
    /// Priority class, as `TaskPrio as u32`.
    pub prio: u32,
    /// Picks a lane within the priority group.
    pub lane_hash: u32,
    /// Which verb of the task state to invoke.
    pub method: u32,
    flags: AtomicU32,
    /// Minimum interval between runs of a long-running task.
    pub period_ns: u64,
    /// Last dispatch stamp; maintained by the owning worker.
    pub last_run_ns: u64,
    /// Total allocation size (header + payload), for reclamation.
    pub alloc_size: u32,
    _pad: u32,
}

/// Payload bytes start here, keeping any payload alignment up to the
/// region's 64-byte guarantee.
pub const PAYLOAD_OFFSET: usize = (std::mem::size_of::<TaskHeader>() + 63) & !63;

impl TaskHeader {
    /// Write a fresh header in place. Used by task constructors after raw
    /// allocation; the payload is written separately.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &mut self,
        state: TaskStateId,
        task_node: TaskNode,
        domain: DomainId,
        prio: TaskPrio,
        lane_hash: u32,
        method: u32,
        flag_bits: u32,
        alloc_size: u32,
    ) {
        self.state = state;
        self.task_node = task_node;
        self.domain = domain;
        self.prio = prio as u32;
        self.lane_hash = lane_hash;
        self.method = method;
        self.flags = AtomicU32::new(flag_bits);
        self.period_ns = 0;
        self.last_run_ns = 0;
        self.alloc_size = alloc_size;
        self._pad = 0;
    }

    #[inline]
    pub fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    #[inline]
    pub fn unset_flags(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    #[inline]
    #[must_use]
    pub fn any_flags(&self, bits: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bits != 0
    }

    #[inline]
    #[must_use]
    pub fn flag_bits(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    /// Restore raw flag bits (used when materializing a task from the wire).
    pub fn store_flag_bits(&self, bits: u32) {
        self.flags.store(bits, Ordering::Release);
    }

    pub fn set_module_complete(&self) {
        self.set_flags(flags::MODULE_COMPLETE);
    }

    #[must_use]
    pub fn is_module_complete(&self) -> bool {
        self.any_flags(flags::MODULE_COMPLETE)
    }

    /// Mark the task complete for observers.
    pub fn set_complete(&self) {
        self.set_flags(flags::MODULE_COMPLETE | flags::COMPLETE);
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.any_flags(flags::COMPLETE)
    }

    #[must_use]
    pub fn is_fire_and_forget(&self) -> bool {
        self.any_flags(flags::FIRE_AND_FORGET)
    }

    pub fn unset_fire_and_forget(&self) {
        self.unset_flags(flags::FIRE_AND_FORGET);
    }

    #[must_use]
    pub fn is_long_running(&self) -> bool {
        self.any_flags(flags::LONG_RUNNING & !flags::UNORDERED)
    }

    pub fn unset_long_running(&self) {
        self.unset_flags(flags::LONG_RUNNING & !flags::UNORDERED);
    }

    #[must_use]
    pub fn is_unordered(&self) -> bool {
        self.any_flags(flags::UNORDERED)
    }

    pub fn set_unordered(&self) {
        self.set_flags(flags::UNORDERED);
    }

    pub fn set_disable_run(&self) {
        self.set_flags(flags::DISABLE_RUN);
    }

    pub fn unset_disable_run(&self) {
        self.unset_flags(flags::DISABLE_RUN);
    }

    #[must_use]
    pub fn is_run_disabled(&self) -> bool {
        self.any_flags(flags::DISABLE_RUN)
    }

    pub fn set_data_owner(&self) {
        self.set_flags(flags::DATA_OWNER);
    }

    pub fn unset_data_owner(&self) {
        self.unset_flags(flags::DATA_OWNER);
    }

    #[must_use]
    pub fn is_data_owner(&self) -> bool {
        self.any_flags(flags::DATA_OWNER)
    }

    pub fn set_started(&self) {
        self.set_flags(flags::HAS_STARTED);
    }

    pub fn unset_started(&self) {
        self.unset_flags(flags::HAS_STARTED);
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.any_flags(flags::HAS_STARTED)
    }

    #[must_use]
    pub fn is_coroutine(&self) -> bool {
        self.any_flags(flags::COROUTINE)
    }

    pub fn unset_coroutine(&self) {
        self.unset_flags(flags::COROUTINE);
    }

    #[must_use]
    pub fn is_preemptive(&self) -> bool {
        self.any_flags(flags::PREEMPTIVE)
    }

    #[must_use]
    pub fn is_lane_all(&self) -> bool {
        self.any_flags(flags::LANE_ALL)
    }

    pub fn unset_lane_all(&self) {
        self.unset_flags(flags::LANE_ALL);
    }

    #[must_use]
    pub fn is_flush(&self) -> bool {
        self.any_flags(flags::FLUSH)
    }

    pub fn set_period_ns(&mut self, ns: u64) {
        self.period_ns = ns;
    }

    pub fn set_period_us(&mut self, us: u64) {
        self.period_ns = us * 1_000;
    }

    pub fn set_period_ms(&mut self, ms: u64) {
        self.period_ns = ms * 1_000_000;
    }

    pub fn set_period_sec(&mut self, sec: u64) {
        self.period_ns = sec * 1_000_000_000;
    }

    /// Whether the worker should dispatch the task right now. Long-running
    /// tasks are throttled to their period, except while a flush is
    /// forcing work through the runtime.
    #[must_use]
    pub fn should_run(&self, now: u64, flushing: bool) -> bool {
        if !self.is_long_running() {
            return true;
        }
        if !self.is_started() || flushing {
            return true;
        }
        now.saturating_sub(self.last_run_ns) >= self.period_ns
    }

    /// Stamp the task as dispatched.
    pub fn did_run(&mut self, now: u64) {
        self.last_run_ns = now;
    }

    /// Block the calling (non-worker) thread until the task completes:
    /// spin briefly, then park in short intervals.
    pub fn wait(&self) {
        let mut spins = 0u32;
        while !self.is_complete() {
            if spins < 4096 {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
                std::thread::park_timeout(std::time::Duration::from_micros(50));
            }
        }
    }
}

/// A task address: the process-local view plus the region-relative pointer
/// other processes understand.
#[derive(Clone, Copy, Debug)]
pub struct TaskAddr {
    ptr: *mut TaskHeader,
    shm: ShmPointer<TaskHeader>,
}

// Tasks are mutated only by their owning worker (or by the submitter before
// emplacement); the address itself is freely shareable.
unsafe impl Send for TaskAddr {}
unsafe impl Sync for TaskAddr {}

impl TaskAddr {
    #[must_use]
    pub fn new(ptr: *mut TaskHeader, shm: ShmPointer<TaskHeader>) -> Self {
        Self { ptr, shm }
    }

    /// Resolve from a region offset.
    pub fn from_shm(
        region: &ShmRegion,
        shm: ShmPointer<TaskHeader>,
    ) -> Result<Self, quarry_shm::ShmError> {
        Ok(Self {
            ptr: region.resolve(shm)?,
            shm,
        })
    }

    #[must_use]
    pub fn shm(&self) -> ShmPointer<TaskHeader> {
        self.shm
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.shm.offset()
    }

    #[allow(clippy::missing_safety_doc)]
    #[must_use]
    pub fn header(&self) -> &TaskHeader {
        unsafe { &*self.ptr }
    }

    /// Mutable view of the header. Sound only under the runtime's ownership
    /// contract: a task is either in flight (touched only by its owning
    /// worker) or awaited (not mutated).
    #[allow(clippy::mut_from_ref)]
    #[must_use]
    pub fn header_mut(&self) -> &mut TaskHeader {
        unsafe { &mut *self.ptr }
    }

    /// Typed payload view, starting at [`PAYLOAD_OFFSET`].
    ///
    /// The caller asserts `T` is the payload type this task was constructed
    /// with; the same ownership contract as [`TaskAddr::header_mut`]
    /// applies.
    #[allow(clippy::mut_from_ref)]
    #[must_use]
    pub fn payload<T: TaskPayload>(&self) -> &mut T {
        unsafe { &mut *((self.ptr as *mut u8).add(PAYLOAD_OFFSET) as *mut T) }
    }
}

/// Marker for types that may be embedded as a task payload: plain data,
/// `repr(C)`, no process-local pointers (shared buffers go through
/// `ShmBuf`/`ShmString`).
///
/// # Safety
///
/// Implementors guarantee the type is valid for any bit pattern written by
/// a cooperating process and contains no absolute addresses.
pub unsafe trait TaskPayload: Send + 'static {}

unsafe impl TaskPayload for () {}
