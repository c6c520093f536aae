//! A lane: a bounded, lock-free multi-producer / single-consumer ring of
//! task handles, laid out flat in shared memory.
//!
//! Producers reserve a slot with a fetch-add on `tail` and cooperatively
//! spin-yield while the ring is full. A slot becomes observable to the
//! consumer only once its producer release-stores the ready bit. The single
//! consumer may `peek` without advancing `head`, which is what keeps
//! suspended coroutine tasks in the queue across yields.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Lane/group flag bits (shared with the queue's priority groups).
pub mod lane_flags {
    pub const LOW_LATENCY: u32 = 1 << 0;
    pub const LONG_RUNNING: u32 = 1 << 1;
    pub const UNORDERED: u32 = 1 << 2;
    pub const DISABLED: u32 = 1 << 3;
    pub const TETHERED: u32 = 1 << 4;
}

#[repr(C)]
pub struct LaneHeader {
    head: AtomicU64,
    tail: AtomicU64,
    depth: u64,
    flags: u32,
    _pad: u32,
}

/// One ring slot: the task's shm offset, the producer's ready bit, and the
/// consumer-side complete bit used to retire entries that finished while
/// queued behind a suspended task.
#[repr(C)]
pub struct LaneSlot {
    ready: AtomicU32,
    complete: AtomicU32,
    task: AtomicU64,
}

impl LaneSlot {
    #[must_use]
    pub fn task_offset(&self) -> u64 {
        self.task.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire) != 0
    }

    pub fn set_complete(&self) {
        self.complete.store(1, Ordering::Release);
    }
}

pub(crate) const LANE_ALIGN: usize = 64;

#[inline]
fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Bytes occupied by one lane of the given depth.
#[must_use]
pub fn lane_stride(depth: u32) -> usize {
    round_up(
        round_up(std::mem::size_of::<LaneHeader>(), LANE_ALIGN)
            + depth as usize * std::mem::size_of::<LaneSlot>(),
        LANE_ALIGN,
    )
}

/// A process-local view of one lane.
#[derive(Clone, Copy)]
pub struct LaneRef<'a> {
    header: &'a LaneHeader,
    slots: *mut LaneSlot,
}

unsafe impl Send for LaneRef<'_> {}
unsafe impl Sync for LaneRef<'_> {}

impl<'a> LaneRef<'a> {
    /// Initialize lane memory in place and return a view of it.
    ///
    /// # Safety
    ///
    /// `base` must point at `lane_stride(depth)` writable bytes aligned to
    /// [`LANE_ALIGN`].
    pub unsafe fn init_at(base: *mut u8, depth: u32, flags: u32) -> Self {
        let header = base as *mut LaneHeader;
        (*header).head = AtomicU64::new(0);
        (*header).tail = AtomicU64::new(0);
        (*header).depth = depth as u64;
        (*header).flags = flags;
        (*header)._pad = 0;
        let slots =
            base.add(round_up(std::mem::size_of::<LaneHeader>(), LANE_ALIGN)) as *mut LaneSlot;
        for i in 0..depth as usize {
            let slot = &mut *slots.add(i);
            slot.ready = AtomicU32::new(0);
            slot.complete = AtomicU32::new(0);
            slot.task = AtomicU64::new(0);
        }
        Self {
            header: &*header,
            slots,
        }
    }

    /// View lane memory previously initialized with [`LaneRef::init_at`].
    ///
    /// # Safety
    ///
    /// Same layout requirements as `init_at`; the memory must already be
    /// initialized.
    pub unsafe fn from_raw(base: *mut u8) -> Self {
        let header = &*(base as *const LaneHeader);
        let slots =
            base.add(round_up(std::mem::size_of::<LaneHeader>(), LANE_ALIGN)) as *mut LaneSlot;
        Self { header, slots }
    }

    #[must_use]
    pub fn depth(&self) -> u64 {
        self.header.depth
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.header.flags
    }

    #[must_use]
    pub fn is_low_latency(&self) -> bool {
        self.header.flags & lane_flags::LOW_LATENCY != 0
    }

    /// Entries currently between head and tail (including unpublished
    /// reservations).
    #[must_use]
    pub fn len(&self) -> u64 {
        let tail = self.header.tail.load(Ordering::Acquire);
        let head = self.header.head.load(Ordering::Acquire);
        tail.saturating_sub(head)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, index: u64) -> &LaneSlot {
        unsafe { &*self.slots.add((index % self.header.depth) as usize) }
    }

    /// Push a task handle. Spin-yields while the ring is full; there is no
    /// timeout path, producers wait for the consumer to drain.
    pub fn emplace(&self, task_offset: u64) {
        let tail = self.header.tail.fetch_add(1, Ordering::AcqRel);
        loop {
            let head = self.header.head.load(Ordering::Acquire);
            if tail - head < self.header.depth {
                break;
            }
            std::thread::yield_now();
        }
        let slot = self.slot(tail);
        slot.task.store(task_offset, Ordering::Relaxed);
        slot.complete.store(0, Ordering::Relaxed);
        slot.ready.store(1, Ordering::Release);
    }

    /// Examine the entry `offset` positions past the head without removing
    /// it. Returns `None` when no published entry exists there.
    #[must_use]
    pub fn peek(&self, offset: u64) -> Option<&'a LaneSlot> {
        let head = self.header.head.load(Ordering::Acquire) + offset;
        let tail = self.header.tail.load(Ordering::Acquire);
        if head >= tail {
            return None;
        }
        let slot = unsafe { &*self.slots.add((head % self.header.depth) as usize) };
        if slot.ready.load(Ordering::Acquire) != 0 {
            Some(slot)
        } else {
            None
        }
    }

    /// Advance the head past the current front entry. Only the owning
    /// worker may call this.
    pub fn pop(&self) -> Option<u64> {
        let head = self.header.head.load(Ordering::Acquire);
        let tail = self.header.tail.load(Ordering::Acquire);
        if head >= tail {
            return None;
        }
        let slot = self.slot(head);
        if slot.ready.load(Ordering::Acquire) == 0 {
            return None;
        }
        let task = slot.task.load(Ordering::Acquire);
        slot.ready.store(0, Ordering::Release);
        self.header.head.fetch_add(1, Ordering::AcqRel);
        Some(task)
    }
}

#[cfg(test)]
mod test_lane {
    use super::*;

    struct LaneMem {
        buf: Vec<u8>,
    }

    impl LaneMem {
        fn new(depth: u32) -> Self {
            // Over-allocate so we can align the base to LANE_ALIGN.
            Self {
                buf: vec![0u8; lane_stride(depth) + LANE_ALIGN],
            }
        }

        fn base(&mut self) -> *mut u8 {
            let addr = self.buf.as_mut_ptr() as usize;
            let aligned = (addr + LANE_ALIGN - 1) & !(LANE_ALIGN - 1);
            aligned as *mut u8
        }
    }

    #[test]
    fn single_producer_fifo() {
        let mut mem = LaneMem::new(64);
        let lane = unsafe { LaneRef::init_at(mem.base(), 64, lane_flags::LOW_LATENCY) };
        for v in 1..=32u64 {
            lane.emplace(v);
        }
        // Peek sees everything in order without consuming.
        for (i, expected) in (1..=32u64).enumerate() {
            let slot = lane.peek(i as u64).expect("published entry");
            assert_eq!(slot.task_offset(), expected);
        }
        assert_eq!(lane.len(), 32);
        for expected in 1..=32u64 {
            assert_eq!(lane.pop(), Some(expected));
        }
        assert_eq!(lane.pop(), None);
    }

    #[test]
    fn peek_does_not_advance() {
        let mut mem = LaneMem::new(8);
        let lane = unsafe { LaneRef::init_at(mem.base(), 8, 0) };
        lane.emplace(7);
        assert!(lane.peek(0).is_some());
        assert!(lane.peek(0).is_some());
        assert_eq!(lane.len(), 1);
        assert!(lane.peek(1).is_none());
    }

    #[test]
    fn wraps_around_depth() {
        let mut mem = LaneMem::new(4);
        let lane = unsafe { LaneRef::init_at(mem.base(), 4, 0) };
        for round in 0..10u64 {
            lane.emplace(round * 2 + 1);
            lane.emplace(round * 2 + 2);
            assert_eq!(lane.pop(), Some(round * 2 + 1));
            assert_eq!(lane.pop(), Some(round * 2 + 2));
        }
    }

    #[test]
    fn mpsc_no_loss_no_duplication() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: u64 = 2000;

        let mut mem = LaneMem::new(128);
        let base = mem.base() as usize;
        unsafe { LaneRef::init_at(base as *mut u8, 128, 0) };

        let mut handles = Vec::new();
        for p in 0..PRODUCERS as u64 {
            handles.push(std::thread::spawn(move || {
                let lane = unsafe { LaneRef::from_raw(base as *mut u8) };
                for i in 0..PER_PRODUCER {
                    // Encode producer id so duplicates are detectable.
                    lane.emplace(p * PER_PRODUCER + i + 1);
                }
            }));
        }

        let consumer = std::thread::spawn(move || {
            let lane = unsafe { LaneRef::from_raw(base as *mut u8) };
            let mut seen = std::collections::HashSet::new();
            let total = PRODUCERS as u64 * PER_PRODUCER;
            while (seen.len() as u64) < total {
                if let Some(v) = lane.pop() {
                    assert!(seen.insert(v), "duplicate value {v}");
                } else {
                    std::thread::yield_now();
                }
            }
            seen
        });

        for handle in handles {
            handle.join().unwrap();
        }
        let seen = consumer.join().unwrap();
        assert_eq!(seen.len() as u64, PRODUCERS as u64 * PER_PRODUCER);
    }

    #[test]
    fn full_lane_blocks_producer_until_pop() {
        let mut mem = LaneMem::new(2);
        let base = mem.base() as usize;
        let lane = unsafe { LaneRef::init_at(base as *mut u8, 2, 0) };
        lane.emplace(1);
        lane.emplace(2);

        let producer = std::thread::spawn(move || {
            let lane = unsafe { LaneRef::from_raw(base as *mut u8) };
            // Blocks until the consumer makes room.
            lane.emplace(3);
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!producer.is_finished());
        assert_eq!(lane.pop(), Some(1));
        producer.join().unwrap();
        assert_eq!(lane.pop(), Some(2));
        assert_eq!(lane.pop(), Some(3));
    }

    #[test]
    fn complete_bit_is_consumer_state() {
        let mut mem = LaneMem::new(8);
        let lane = unsafe { LaneRef::init_at(mem.base(), 8, 0) };
        lane.emplace(11);
        lane.emplace(12);
        let slot = lane.peek(1).unwrap();
        assert!(!slot.is_complete());
        slot.set_complete();
        assert!(lane.peek(1).unwrap().is_complete());
        // The head entry is untouched.
        assert!(!lane.peek(0).unwrap().is_complete());
    }
}
