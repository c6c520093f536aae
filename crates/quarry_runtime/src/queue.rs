//! The multi-lane priority queue: a named queue owning one group of lanes
//! per priority class, laid out flat in shared memory.

use std::sync::atomic::{AtomicU32, Ordering};

use quarry_shm::{ShmPointer, ShmRegion};

use crate::errors::{RuntimeError, RuntimeResult};
use crate::ids::QueueId;
use crate::lane::{lane_stride, LaneRef, LANE_ALIGN};
use crate::task::TaskPrio;

pub use crate::lane::lane_flags as group_flags;

/// Queue-wide flag bits.
pub mod queue_flags {
    pub const READY: u32 = 1 << 0;
    /// Plug bit quiescing producers during a resize.
    pub const RESIZE: u32 = 1 << 1;
    /// Plug bit quiescing consumers during task updates.
    pub const UPDATE: u32 = 1 << 2;
}

/// Configuration of one priority group at queue-creation time.
#[derive(Clone, Copy, Debug)]
pub struct PriorityInfo {
    pub prio: TaskPrio,
    pub max_lanes: u32,
    pub num_lanes: u32,
    pub depth: u32,
    pub flags: u32,
}

impl PriorityInfo {
    #[must_use]
    pub fn new(prio: TaskPrio, max_lanes: u32, num_lanes: u32, depth: u32, flags: u32) -> Self {
        Self {
            prio,
            max_lanes,
            num_lanes,
            depth,
            flags,
        }
    }
}

/// Shared-memory descriptor of one priority group.
#[repr(C)]
pub struct GroupDesc {
    pub prio: u32,
    pub flags: u32,
    pub depth: u32,
    pub num_lanes: u32,
    pub max_lanes: u32,
    /// Lanes already assigned to workers by the queue scheduler.
    pub num_scheduled: AtomicU32,
    /// Prio group whose worker placement this group follows (reserved).
    pub tether: u32,
    _pad: u32,
    /// Region offset of the first lane; lanes are contiguous with
    /// `lane_stride(depth)` spacing.
    lanes_off: u64,
}

impl GroupDesc {
    #[must_use]
    pub fn is_low_latency(&self) -> bool {
        self.flags & group_flags::LOW_LATENCY != 0
    }

    /// Long-running or admin groups are scheduled on worker 0.
    #[must_use]
    pub fn is_low_priority(&self) -> bool {
        self.flags & group_flags::LONG_RUNNING != 0 || self.prio == TaskPrio::Admin as u32
    }

    #[must_use]
    pub fn num_scheduled(&self) -> u32 {
        self.num_scheduled.load(Ordering::Acquire)
    }

    pub fn set_num_scheduled(&self, value: u32) {
        self.num_scheduled.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.num_lanes > 0
    }
}

#[repr(C)]
pub struct QueueHeader {
    pub id: QueueId,
    flags: AtomicU32,
    _pad: u32,
    groups: [GroupDesc; TaskPrio::COUNT],
}

const fn header_span() -> usize {
    (std::mem::size_of::<QueueHeader>() + LANE_ALIGN - 1) & !(LANE_ALIGN - 1)
}

/// Bytes needed for a queue with the given groups. Lane space is reserved
/// for `max_lanes` so a future resize does not need to move memory.
#[must_use]
pub fn queue_span(prios: &[PriorityInfo]) -> usize {
    let mut span = header_span();
    for info in prios {
        span += info.max_lanes as usize * lane_stride(info.depth);
    }
    span
}

/// Process-local view of a shared queue.
#[derive(Clone, Copy)]
pub struct QueueRef<'a> {
    region: &'a ShmRegion,
    header: *mut QueueHeader,
    offset: u64,
}

unsafe impl Send for QueueRef<'_> {}
unsafe impl Sync for QueueRef<'_> {}

impl<'a> QueueRef<'a> {
    /// Allocate and initialize a queue in the region.
    pub fn create(
        region: &'a ShmRegion,
        id: QueueId,
        prios: &[PriorityInfo],
    ) -> RuntimeResult<Self> {
        if id.is_null() {
            return Err(RuntimeError::QueueMissing(id));
        }
        let span = queue_span(prios);
        let base_ptr = region.alloc(span, LANE_ALIGN)?;
        let offset = base_ptr.offset();
        let raw = region.resolve_slice(base_ptr, span)?;

        unsafe {
            let header = raw as *mut QueueHeader;
            (*header).id = id;
            (*header).flags = AtomicU32::new(0);
            (*header)._pad = 0;
            for desc in &mut (*header).groups {
                *desc = std::mem::zeroed();
            }

            let mut lane_cursor = offset + header_span() as u64;
            for info in prios {
                let desc = &mut (*header).groups[info.prio as usize];
                desc.prio = info.prio as u32;
                desc.flags = info.flags;
                desc.depth = info.depth;
                desc.num_lanes = info.num_lanes;
                desc.max_lanes = info.max_lanes;
                desc.num_scheduled = AtomicU32::new(0);
                desc.tether = 0;
                desc.lanes_off = lane_cursor;

                let stride = lane_stride(info.depth) as u64;
                for lane_id in 0..info.num_lanes {
                    let lane_base = raw.add((lane_cursor - offset) as usize
                        + lane_id as usize * stride as usize);
                    LaneRef::init_at(lane_base, info.depth, info.flags);
                }
                lane_cursor += info.max_lanes as u64 * stride;
            }
        }

        tracing::debug!(%id, span, offset, "created queue");
        Ok(Self {
            region,
            header: raw as *mut QueueHeader,
            offset,
        })
    }

    /// View a queue previously created at `offset`.
    pub fn from_offset(region: &'a ShmRegion, offset: u64) -> RuntimeResult<Self> {
        let ptr: ShmPointer<QueueHeader> = ShmPointer::from_offset(offset);
        let header = region.resolve(ptr)?;
        Ok(Self {
            region,
            header,
            offset,
        })
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn id(&self) -> QueueId {
        unsafe { (*self.header).id }
    }

    fn flags(&self) -> &AtomicU32 {
        unsafe { &(*self.header).flags }
    }

    pub fn set_ready(&self) {
        self.flags().fetch_or(queue_flags::READY, Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.flags().load(Ordering::Acquire) & queue_flags::READY != 0
    }

    /// Begin plugging producers for a resize. The resize mechanism itself
    /// is a placeholder; only the plug protocol is implemented.
    pub fn plug_for_resize(&self) {
        self.flags().fetch_or(queue_flags::RESIZE, Ordering::AcqRel);
    }

    pub fn unplug_for_resize(&self) {
        self.flags().fetch_and(!queue_flags::RESIZE, Ordering::AcqRel);
    }

    pub fn plug_for_update(&self) {
        self.flags().fetch_or(queue_flags::UPDATE, Ordering::AcqRel);
    }

    pub fn unplug_for_update(&self) {
        self.flags().fetch_and(!queue_flags::UPDATE, Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_emplace_plugged(&self) -> bool {
        self.flags().load(Ordering::Acquire) & queue_flags::RESIZE != 0
    }

    fn wait_for_emplace_plug(&self) {
        while self.is_emplace_plugged() {
            std::thread::yield_now();
        }
    }

    /// Change the number of active lanes. Scaffolded: plug bits are
    /// honored by producers, the lane count itself does not change yet.
    pub fn resize(&self, _num_lanes: u32) {}

    #[must_use]
    pub fn group(&self, prio: TaskPrio) -> &'a GroupDesc {
        unsafe { &(*self.header).groups[prio as usize] }
    }

    /// Iterate the active groups in priority order.
    pub fn groups(&self) -> impl Iterator<Item = &'a GroupDesc> {
        let header = self.header;
        (0..TaskPrio::COUNT)
            .map(move |i| unsafe { &(*header).groups[i] })
            .filter(|desc| desc.is_active())
    }

    #[must_use]
    pub fn lane(&self, prio: TaskPrio, lane_id: u32) -> LaneRef<'a> {
        let desc = self.group(prio);
        debug_assert!(lane_id < desc.num_lanes);
        let stride = lane_stride(desc.depth) as u64;
        let lane_off = desc.lanes_off + lane_id as u64 * stride;
        let base = self
            .region
            .resolve_slice(ShmPointer::from_offset(lane_off), lane_stride(desc.depth))
            .expect("lane memory inside region");
        unsafe { LaneRef::from_raw(base) }
    }

    /// Push a task handle onto the lane selected by the priority and hash.
    pub fn emplace(&self, prio: TaskPrio, lane_hash: u32, task_offset: u64) -> bool {
        if self.is_emplace_plugged() {
            self.wait_for_emplace_plug();
        }
        let desc = self.group(prio);
        if !desc.is_active() {
            tracing::error!(queue = %self.id(), prio = ?prio, "emplace on inactive group");
            return false;
        }
        let lane_id = lane_hash % desc.num_lanes;
        self.lane(prio, lane_id).emplace(task_offset);
        true
    }

    /// Like [`QueueRef::emplace`], but refuses when the chosen lane is more
    /// than half full. Used by runtime-internal schedulers to avoid
    /// self-deadlock.
    pub fn emplace_frac(&self, prio: TaskPrio, lane_hash: u32, task_offset: u64) -> bool {
        if self.is_emplace_plugged() {
            self.wait_for_emplace_plug();
        }
        let desc = self.group(prio);
        if !desc.is_active() {
            return false;
        }
        let lane_id = lane_hash % desc.num_lanes;
        let lane = self.lane(prio, lane_id);
        if lane.len() * 2 > lane.depth() {
            return false;
        }
        lane.emplace(task_offset);
        true
    }

    /// Push one handle directly onto a specific lane (LaneAll fan-out).
    pub fn emplace_on_lane(&self, prio: TaskPrio, lane_id: u32, task_offset: u64) {
        self.lane(prio, lane_id).emplace(task_offset);
    }
}
