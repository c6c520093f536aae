use serde::{Deserialize, Serialize};

use crate::{ShmError, ShmPointer, ShmRegion, ShmResult};

/// An allocator-owned byte buffer usable inside task payloads.
///
/// `ShmBuf` does not free itself on drop: payloads are plain data that may
/// be copied between processes, so ownership is tracked by the task's
/// `DATA_OWNER` flag and released explicitly through [`ShmBuf::free`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmBuf {
    pub ptr: ShmPointer<u8>,
    pub len: u64,
}

impl ShmBuf {
    pub fn alloc(region: &ShmRegion, len: usize) -> ShmResult<Self> {
        let ptr = region.alloc(len.max(1), 8)?;
        Ok(Self {
            ptr,
            len: len as u64,
        })
    }

    /// Allocate and fill from `data`.
    pub fn copy_from(region: &ShmRegion, data: &[u8]) -> ShmResult<Self> {
        let buf = Self::alloc(region, data.len())?;
        let raw = region.resolve_slice(buf.ptr, data.len())?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), raw, data.len()) };
        Ok(buf)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice<'a>(&self, region: &'a ShmRegion) -> ShmResult<&'a [u8]> {
        let raw = region.resolve_slice(self.ptr, self.len())?;
        Ok(unsafe { std::slice::from_raw_parts(raw, self.len()) })
    }

    pub fn as_mut_slice<'a>(&self, region: &'a ShmRegion) -> ShmResult<&'a mut [u8]> {
        let raw = region.resolve_slice(self.ptr, self.len())?;
        Ok(unsafe { std::slice::from_raw_parts_mut(raw, self.len()) })
    }

    pub fn free(self, region: &ShmRegion) {
        if !self.is_null() {
            region.free(self.ptr, self.len().max(1));
        }
    }
}

/// A UTF-8 string stored in the region.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmString {
    buf: ShmBuf,
}

impl ShmString {
    pub fn copy_from(region: &ShmRegion, value: &str) -> ShmResult<Self> {
        Ok(Self {
            buf: ShmBuf::copy_from(region, value.as_bytes())?,
        })
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.buf.is_null()
    }

    pub fn as_str<'a>(&self, region: &'a ShmRegion) -> ShmResult<&'a str> {
        let bytes = self.buf.as_slice(region)?;
        std::str::from_utf8(bytes).map_err(|_| ShmError::BadString)
    }

    pub fn free(self, region: &ShmRegion) {
        self.buf.free(region);
    }
}

/// A resizable array of plain-data elements inside the region. Task states
/// use this for per-replica output slots: `resize` before dispatch, index
/// per replica on completion.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodArray<T> {
    ptr: ShmPointer<T>,
    len: u64,
}

impl<T: Copy + Default> PodArray<T> {
    pub fn alloc(region: &ShmRegion, len: usize) -> ShmResult<Self> {
        let bytes = (len * std::mem::size_of::<T>()).max(1);
        let raw = region.alloc(bytes, std::mem::align_of::<T>())?;
        let array = Self {
            ptr: raw.cast(),
            len: len as u64,
        };
        for slot in array.as_mut_slice(region)? {
            *slot = T::default();
        }
        Ok(array)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice<'a>(&self, region: &'a ShmRegion) -> ShmResult<&'a [T]> {
        let bytes = self.len() * std::mem::size_of::<T>();
        let raw = region.resolve_slice(self.ptr.cast(), bytes)?;
        Ok(unsafe { std::slice::from_raw_parts(raw as *const T, self.len()) })
    }

    #[allow(clippy::mut_from_ref)]
    pub fn as_mut_slice<'a>(&self, region: &'a ShmRegion) -> ShmResult<&'a mut [T]> {
        let bytes = self.len() * std::mem::size_of::<T>();
        let raw = region.resolve_slice(self.ptr.cast(), bytes)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(raw as *mut T, self.len()) })
    }

    /// Grow (or shrink) the array, preserving the prefix that fits.
    pub fn resize(&mut self, region: &ShmRegion, len: usize) -> ShmResult<()> {
        if len == self.len() {
            return Ok(());
        }
        let fresh = Self::alloc(region, len)?;
        let keep = len.min(self.len());
        if keep > 0 {
            let src = self.as_slice(region)?;
            fresh.as_mut_slice(region)?[..keep].copy_from_slice(&src[..keep]);
        }
        self.free(region);
        *self = fresh;
        Ok(())
    }

    pub fn free(&self, region: &ShmRegion) {
        if !self.is_null() {
            region.free(
                self.ptr.cast(),
                (self.len() * std::mem::size_of::<T>()).max(1),
            );
        }
    }
}
