use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapMut;

use crate::alloc::AllocHeader;
use crate::{ShmError, ShmPointer, ShmResult};

/// Magic number stamped at the start of every quarry region file.
pub const REGION_MAGIC: u64 = 0x5155_4152_5259_0001;

/// Fixed header at offset 0 of the region.
///
/// The header is written once by the creating process; the atomic fields
/// are shared working state for every attached process.
#[repr(C)]
pub struct RegionHeader {
    pub magic: u64,
    pub size: u64,
    /// Node id of the runtime that owns this region. 0 until assigned.
    pub node_id: AtomicU32,
    /// Set to 1 once the runtime finished initializing the region.
    pub ready: AtomicU32,
    /// Process-wide counter for task/state/queue uniques.
    pub unique: AtomicU64,
    /// Offset of the root object the runtime publishes for attaching
    /// clients (the queue directory). 0 until published.
    pub root: AtomicU64,
    pub alloc: AllocHeader,
}

/// The first unique value handed to callers. Lower values are reserved for
/// the built-in queues created at server init.
pub const FIRST_DYNAMIC_UNIQUE: u64 = 16;

/// A named, file-backed shared-memory region.
///
/// The runtime process calls [`ShmRegion::create`]; client processes call
/// [`ShmRegion::attach`] with the same name. All cross-process references
/// into the region are [`ShmPointer`] offsets resolved through
/// [`ShmRegion::resolve`].
#[derive(Debug)]
pub struct ShmRegion {
    // Kept for the lifetime of the mapping.
    _map: MmapMut,
    base: *mut u8,
    size: usize,
    path: PathBuf,
    owner: bool,
}

// All mutation of shared state goes through atomics or protocols layered on
// top (lane ready bits, allocator CAS loops); the raw base pointer itself
// is stable for the lifetime of the mapping.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create (or recreate) the region file and initialize its header.
    pub fn create(dir: &Path, name: &str, size: usize) -> ShmResult<Self> {
        let path = dir.join(name);
        if size < std::mem::size_of::<RegionHeader>() + 4096 {
            return Err(ShmError::TooSmall { path });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| ShmError::OpenFailed {
                path: path.clone(),
                source,
            })?;
        file.set_len(size as u64).map_err(|source| ShmError::OpenFailed {
            path: path.clone(),
            source,
        })?;
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| ShmError::MapFailed {
            path: path.clone(),
            source,
        })?;
        let base = map.as_mut_ptr();

        let region = Self {
            _map: map,
            base,
            size,
            path,
            owner: true,
        };
        region.init_header();
        tracing::debug!(
            path = %region.path.display(),
            size,
            "created shm region"
        );
        Ok(region)
    }

    /// Attach to a region another process created.
    pub fn attach(dir: &Path, name: &str) -> ShmResult<Self> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| ShmError::OpenFailed {
                path: path.clone(),
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| ShmError::OpenFailed {
                path: path.clone(),
                source,
            })?
            .len() as usize;
        if len < std::mem::size_of::<RegionHeader>() {
            return Err(ShmError::TooSmall { path });
        }
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| ShmError::MapFailed {
            path: path.clone(),
            source,
        })?;
        let base = map.as_mut_ptr();
        let region = Self {
            _map: map,
            base,
            size: len,
            path: path.clone(),
            owner: false,
        };
        if region.header().magic != REGION_MAGIC {
            return Err(ShmError::BadMagic { path });
        }
        tracing::debug!(path = %region.path.display(), size = len, "attached shm region");
        Ok(region)
    }

    fn init_header(&self) {
        let header = unsafe { &mut *(self.base as *mut RegionHeader) };
        header.magic = REGION_MAGIC;
        header.size = self.size as u64;
        header.node_id = AtomicU32::new(0);
        header.ready = AtomicU32::new(0);
        header.unique = AtomicU64::new(FIRST_DYNAMIC_UNIQUE);
        header.root = AtomicU64::new(0);
        let heap_start = crate::alloc::round_up(
            std::mem::size_of::<RegionHeader>() as u64,
            crate::alloc::SHM_ALIGN as u64,
        );
        header.alloc.init(heap_start, self.size as u64);
    }

    #[must_use]
    pub fn header(&self) -> &RegionHeader {
        unsafe { &*(self.base as *const RegionHeader) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    #[must_use]
    pub fn node_id(&self) -> u32 {
        self.header().node_id.load(Ordering::Acquire)
    }

    pub fn set_node_id(&self, node_id: u32) {
        self.header().node_id.store(node_id, Ordering::Release);
    }

    pub fn set_ready(&self) {
        self.header().ready.store(1, Ordering::Release);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.header().ready.load(Ordering::Acquire) == 1
    }

    /// Allocate a fresh unique value from the process-wide counter.
    #[must_use]
    pub fn next_unique(&self) -> u64 {
        self.header().unique.fetch_add(1, Ordering::AcqRel)
    }

    /// Publish the runtime's root object for attaching clients.
    pub fn set_root(&self, off: u64) {
        self.header().root.store(off, Ordering::Release);
    }

    #[must_use]
    pub fn root(&self) -> u64 {
        self.header().root.load(Ordering::Acquire)
    }

    /// Resolve an offset to a process-local pointer, bounds checked for
    /// `size_of::<T>()` bytes.
    pub fn resolve<T>(&self, ptr: ShmPointer<T>) -> ShmResult<*mut T> {
        let len = std::mem::size_of::<T>();
        let off = ptr.offset();
        if ptr.is_null() || off as usize + len > self.size {
            return Err(ShmError::OutOfBounds {
                offset: off,
                len,
                size: self.size,
            });
        }
        Ok(unsafe { self.base.add(off as usize) as *mut T })
    }

    /// Resolve a raw byte range.
    pub fn resolve_slice(&self, ptr: ShmPointer<u8>, len: usize) -> ShmResult<*mut u8> {
        let off = ptr.offset();
        if ptr.is_null() || off as usize + len > self.size {
            return Err(ShmError::OutOfBounds {
                offset: off,
                len,
                size: self.size,
            });
        }
        Ok(unsafe { self.base.add(off as usize) })
    }

    /// Convert a process-local pointer obtained from this region back to an
    /// offset. Returns null if the pointer is outside the mapping.
    #[must_use]
    pub fn offset_of<T>(&self, raw: *const T) -> ShmPointer<T> {
        let addr = raw as usize;
        let base = self.base as usize;
        if addr < base || addr >= base + self.size {
            return ShmPointer::null();
        }
        ShmPointer::from_offset((addr - base) as u64)
    }

    /// Allocate `size` bytes with the given alignment.
    pub fn alloc(&self, size: usize, align: usize) -> ShmResult<ShmPointer<u8>> {
        self.header().alloc.alloc(self, size, align)
    }

    /// Return an allocation to the region.
    pub fn free(&self, ptr: ShmPointer<u8>, size: usize) {
        self.header().alloc.free(self, ptr, size);
    }

    /// Allocate and move `value` into the region.
    pub fn construct<T>(&self, value: T) -> ShmResult<ShmPointer<T>> {
        let raw = self.alloc(std::mem::size_of::<T>(), std::mem::align_of::<T>())?;
        let ptr = raw.cast::<T>();
        unsafe { std::ptr::write(self.resolve(ptr)?, value) };
        Ok(ptr)
    }

    /// Drop the pointee in place and free its allocation.
    ///
    /// The caller must guarantee the pointer came from [`construct`] with
    /// the same `T` and has not been destructed before.
    ///
    /// [`construct`]: ShmRegion::construct
    pub fn destruct<T>(&self, ptr: ShmPointer<T>) -> ShmResult<()> {
        let raw = self.resolve(ptr)?;
        unsafe { std::ptr::drop_in_place(raw) };
        self.free(ptr.cast(), std::mem::size_of::<T>());
        Ok(())
    }

    /// Remove the backing file. Only meaningful on the creating process
    /// during teardown; attached clients keep their mapping alive.
    pub fn unlink(&self) {
        if self.owner {
            if let Err(err) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), %err, "failed to unlink region file");
            }
        }
    }
}
