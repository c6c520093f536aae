use std::sync::atomic::{AtomicU64, Ordering};

use crate::{ShmError, ShmPointer, ShmRegion, ShmResult};

/// Base size class in bytes. Every allocation is rounded up to a power-of-two
/// multiple of this, which also serves as the region-wide alignment
/// guarantee.
pub const SIZE_CLASS_BASE: usize = 64;

/// Number of size classes: 64 B .. 1 MiB.
pub const SIZE_CLASS_COUNT: usize = 15;

pub(crate) const SHM_ALIGN: usize = SIZE_CLASS_BASE;

/// Free-list heads pack a 16-bit ABA tag above a 48-bit offset so a stale
/// head observed by a racing process cannot be confused with a recycled one.
const OFFSET_BITS: u64 = 48;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

#[inline]
pub(crate) fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[inline]
fn pack(tag: u64, offset: u64) -> u64 {
    (tag << OFFSET_BITS) | (offset & OFFSET_MASK)
}

#[inline]
fn unpack(head: u64) -> (u64, u64) {
    (head >> OFFSET_BITS, head & OFFSET_MASK)
}

fn class_of(size: usize) -> Option<usize> {
    let mut class_size = SIZE_CLASS_BASE;
    for class in 0..SIZE_CLASS_COUNT {
        if size <= class_size {
            return Some(class);
        }
        class_size <<= 1;
    }
    None
}

fn class_size(class: usize) -> usize {
    SIZE_CLASS_BASE << class
}

/// Allocator state embedded in the region header.
///
/// Allocation strategy: per-size-class lock-free free lists (linked through
/// the first 8 bytes of each free block), refilled from an atomic bump
/// pointer. Blocks larger than the largest class come straight off the bump
/// pointer and are not recycled.
#[repr(C)]
pub struct AllocHeader {
    bump: AtomicU64,
    limit: u64,
    free_heads: [AtomicU64; SIZE_CLASS_COUNT],
}

impl AllocHeader {
    pub(crate) fn init(&mut self, heap_start: u64, limit: u64) {
        self.bump = AtomicU64::new(heap_start);
        self.limit = limit;
        for head in &mut self.free_heads {
            *head = AtomicU64::new(0);
        }
    }

    pub(crate) fn alloc(
        &self,
        region: &ShmRegion,
        size: usize,
        align: usize,
    ) -> ShmResult<ShmPointer<u8>> {
        if align > SHM_ALIGN {
            return Err(ShmError::BadAlignment { align });
        }
        if size == 0 {
            return Err(ShmError::OutOfMemory { requested: 0 });
        }
        match class_of(size) {
            Some(class) => {
                if let Some(ptr) = self.pop_free(region, class) {
                    return Ok(ptr);
                }
                self.bump_alloc(class_size(class))
            }
            None => {
                // Oversize blocks are never recycled; they are expected to
                // be rare, long-lived structures (queues, directories).
                tracing::debug!(size, "oversize shm allocation from bump region");
                self.bump_alloc(round_up(size as u64, SHM_ALIGN as u64) as usize)
            }
        }
    }

    pub(crate) fn free(&self, region: &ShmRegion, ptr: ShmPointer<u8>, size: usize) {
        if ptr.is_null() {
            return;
        }
        match class_of(size) {
            Some(class) => self.push_free(region, class, ptr),
            None => {
                tracing::warn!(size, offset = ptr.offset(), "leaking oversize shm block");
            }
        }
    }

    fn bump_alloc(&self, size: usize) -> ShmResult<ShmPointer<u8>> {
        let start = self.bump.fetch_add(size as u64, Ordering::AcqRel);
        if start + size as u64 > self.limit {
            // The bump pointer has overshot; further allocations of this
            // size will fail the same way, which is the intended behavior.
            return Err(ShmError::OutOfMemory { requested: size });
        }
        Ok(ShmPointer::from_offset(start))
    }

    fn pop_free(&self, region: &ShmRegion, class: usize) -> Option<ShmPointer<u8>> {
        let head = &self.free_heads[class];
        loop {
            let observed = head.load(Ordering::Acquire);
            let (tag, offset) = unpack(observed);
            if offset == 0 {
                return None;
            }
            let block = ShmPointer::<u8>::from_offset(offset);
            let next = unsafe {
                let raw = region.resolve(block.cast::<u64>()).ok()?;
                std::ptr::read_volatile(raw)
            };
            let replacement = pack(tag.wrapping_add(1), next);
            if head
                .compare_exchange(observed, replacement, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(block);
            }
        }
    }

    fn push_free(&self, region: &ShmRegion, class: usize, ptr: ShmPointer<u8>) {
        let head = &self.free_heads[class];
        let raw = match region.resolve(ptr.cast::<u64>()) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(%err, "freeing pointer outside the region");
                return;
            }
        };
        loop {
            let observed = head.load(Ordering::Acquire);
            let (tag, offset) = unpack(observed);
            unsafe { std::ptr::write_volatile(raw, offset) };
            let replacement = pack(tag.wrapping_add(1), ptr.offset());
            if head
                .compare_exchange(observed, replacement, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Bytes consumed from the bump region so far.
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.bump.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test_alloc {
    use super::*;

    fn region() -> (tempfile::TempDir, ShmRegion) {
        let dir = tempfile::tempdir().unwrap();
        let region = ShmRegion::create(dir.path(), "alloc_test", 4 << 20).unwrap();
        (dir, region)
    }

    #[test]
    fn classes_round_up() {
        assert_eq!(class_of(1), Some(0));
        assert_eq!(class_of(64), Some(0));
        assert_eq!(class_of(65), Some(1));
        assert_eq!(class_of(1 << 20), Some(14));
        assert_eq!(class_of((1 << 20) + 1), None);
    }

    #[test]
    fn alloc_free_reuses_blocks() {
        let (_dir, region) = region();
        let first = region.alloc(100, 8).unwrap();
        region.free(first, 100);
        // Same class, freed block comes back.
        let second = region.alloc(120, 8).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_allocations_do_not_alias() {
        let (_dir, region) = region();
        let a = region.alloc(64, 8).unwrap();
        let b = region.alloc(64, 8).unwrap();
        assert_ne!(a, b);
        assert!(b.offset() >= a.offset() + 64 || a.offset() >= b.offset() + 64);
    }

    #[test]
    fn rejects_overlarge_alignment() {
        let (_dir, region) = region();
        assert!(matches!(
            region.alloc(64, 4096),
            Err(ShmError::BadAlignment { .. })
        ));
    }

    #[test]
    fn exhaustion_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let region = ShmRegion::create(dir.path(), "tiny", 64 << 10).unwrap();
        let mut live = Vec::new();
        loop {
            match region.alloc(4096, 8) {
                Ok(ptr) => live.push(ptr),
                Err(ShmError::OutOfMemory { .. }) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert!(!live.is_empty());
    }

    #[test]
    fn concurrent_alloc_free_keeps_blocks_distinct() {
        let (_dir, region) = region();
        let region = std::sync::Arc::new(region);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let region = region.clone();
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..200 {
                    let ptr = region.alloc(256, 8).unwrap();
                    seen.push(ptr.offset());
                    region.free(ptr, 256);
                }
                seen
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
