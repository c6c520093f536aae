//! The queue directory: an O(1), shm-resident map from queue ids to queue
//! offsets, plus the two built-in queues every node carries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quarry_shm::{ShmPointer, ShmRegion};

use crate::config::QueueManagerConfig;
use crate::errors::{RuntimeError, RuntimeResult};
use crate::ids::{NodeId, QueueId, TaskStateId};
use crate::lane::lane_flags;
use crate::queue::{PriorityInfo, QueueRef};
use crate::task::TaskPrio;

/// Reserved uniques for the built-in queues/states (below the region's
/// first dynamic unique). Dynamic state ids are minted by the node-1
/// naming authority, so reserved and dynamic uniques never collide in the
/// directory.
pub const ADMIN_UNIQUE: u64 = 1;
pub const PROCESS_UNIQUE: u64 = 2;
pub const REMOTE_QUEUE_UNIQUE: u64 = 3;

#[repr(C)]
struct DirHeader {
    max_queues: u64,
    admin_queue: QueueId,
    process_queue: QueueId,
    admin_state: TaskStateId,
    // max_queues entries (queue offsets) follow.
}

const fn entries_offset() -> usize {
    (std::mem::size_of::<DirHeader>() + 63) & !63
}

/// Process-local handle on the queue directory. Cheap to clone.
#[derive(Clone)]
pub struct QueueManager {
    region: Arc<ShmRegion>,
    dir_off: u64,
    max_queues: u64,
    pub admin_queue: QueueId,
    pub process_queue: QueueId,
    pub admin_state: TaskStateId,
}

impl QueueManager {
    /// Create the directory and the built-in queues. Runtime side only.
    pub fn server_init(
        region: Arc<ShmRegion>,
        node_id: NodeId,
        config: &QueueManagerConfig,
    ) -> RuntimeResult<Self> {
        let max_queues = config.max_queues as u64;
        let span = entries_offset() + max_queues as usize * std::mem::size_of::<AtomicU64>();
        let dir_ptr = region.alloc(span, 64)?;
        let dir_off = dir_ptr.offset();

        let admin_queue = QueueId::new(node_id, ADMIN_UNIQUE);
        let process_queue = QueueId::new(node_id, PROCESS_UNIQUE);
        let admin_state = TaskStateId::new(node_id, ADMIN_UNIQUE);

        unsafe {
            let raw = region.resolve_slice(dir_ptr, span)?;
            let header = raw as *mut DirHeader;
            (*header).max_queues = max_queues;
            (*header).admin_queue = admin_queue;
            (*header).process_queue = process_queue;
            (*header).admin_state = admin_state;
            let entries = raw.add(entries_offset()) as *mut AtomicU64;
            for i in 0..max_queues as usize {
                *entries.add(i) = AtomicU64::new(0);
            }
        }

        let manager = Self {
            region,
            dir_off,
            max_queues,
            admin_queue,
            process_queue,
            admin_state,
        };

        // The admin queue: one unordered admin lane, pinned to worker 0.
        let queue = manager.create_queue(
            admin_queue,
            &[PriorityInfo::new(
                TaskPrio::Admin,
                1,
                1,
                config.queue_depth,
                lane_flags::UNORDERED,
            )],
        )?;
        queue.set_ready();

        // The process queue: admin + long-running + low-latency groups for
        // submissions that have no dedicated state queue.
        let queue = manager.create_queue(
            process_queue,
            &[
                PriorityInfo::new(
                    TaskPrio::Admin,
                    1,
                    1,
                    config.queue_depth,
                    lane_flags::UNORDERED,
                ),
                PriorityInfo::new(
                    TaskPrio::LongRunning,
                    1,
                    1,
                    config.queue_depth,
                    lane_flags::LONG_RUNNING,
                ),
                PriorityInfo::new(
                    TaskPrio::LowLatency,
                    config.max_lanes,
                    config.max_lanes,
                    config.proc_queue_depth,
                    lane_flags::LOW_LATENCY,
                ),
            ],
        )?;
        queue.set_ready();

        manager.region.set_root(dir_off);
        tracing::info!(node_id, max_queues, "queue manager initialized");
        Ok(manager)
    }

    /// Attach to the directory a runtime published. Client side.
    pub fn client_init(region: Arc<ShmRegion>) -> RuntimeResult<Self> {
        let dir_off = region.root();
        let ptr: ShmPointer<DirHeader> = ShmPointer::from_offset(dir_off);
        let header = region.resolve(ptr)?;
        let (max_queues, admin_queue, process_queue, admin_state) = unsafe {
            (
                (*header).max_queues,
                (*header).admin_queue,
                (*header).process_queue,
                (*header).admin_state,
            )
        };
        Ok(Self {
            region,
            dir_off,
            max_queues,
            admin_queue,
            process_queue,
            admin_state,
        })
    }

    fn entry(&self, unique: u64) -> RuntimeResult<&AtomicU64> {
        if unique >= self.max_queues {
            return Err(RuntimeError::DirectoryFull {
                max: self.max_queues as u32,
            });
        }
        let base = self
            .region
            .resolve_slice(ShmPointer::from_offset(self.dir_off), entries_offset())?;
        Ok(unsafe { &*((base.add(entries_offset()) as *const AtomicU64).add(unique as usize)) })
    }

    /// Create a queue with a pre-allocated id.
    pub fn create_queue(
        &self,
        id: QueueId,
        prios: &[PriorityInfo],
    ) -> RuntimeResult<QueueRef<'_>> {
        if id.is_null() {
            return Err(RuntimeError::QueueMissing(id));
        }
        let entry = self.entry(id.unique())?;
        let queue = QueueRef::create(&self.region, id, prios)?;
        if entry
            .compare_exchange(0, queue.offset(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Lost the race; the winner's queue stands. The fresh
            // allocation is abandoned (queue blocks are not recycled).
            tracing::warn!(%id, "queue already exists");
            return Err(RuntimeError::QueueExists(id));
        }
        Ok(queue)
    }

    /// O(1) queue lookup.
    #[must_use]
    pub fn get_queue(&self, id: QueueId) -> Option<QueueRef<'_>> {
        let entry = self.entry(id.unique()).ok()?;
        let off = entry.load(Ordering::Acquire);
        if off == 0 {
            return None;
        }
        QueueRef::from_offset(&self.region, off).ok()
    }

    /// Remove a queue from the directory. Assumes no producer or consumer
    /// still touches it.
    pub fn destroy_queue(&self, id: QueueId) -> RuntimeResult<()> {
        let entry = self.entry(id.unique())?;
        let off = entry.swap(0, Ordering::AcqRel);
        if off == 0 {
            return Err(RuntimeError::QueueMissing(id));
        }
        tracing::debug!(%id, "destroyed queue");
        Ok(())
    }

    /// All live queues, in directory order.
    #[must_use]
    pub fn live_queues(&self) -> Vec<QueueRef<'_>> {
        let mut queues = Vec::new();
        for unique in 0..self.max_queues {
            if let Ok(entry) = self.entry(unique) {
                let off = entry.load(Ordering::Acquire);
                if off != 0 {
                    if let Ok(queue) = QueueRef::from_offset(&self.region, off) {
                        queues.push(queue);
                    }
                }
            }
        }
        queues
    }

    #[must_use]
    pub fn region(&self) -> &Arc<ShmRegion> {
        &self.region
    }
}
