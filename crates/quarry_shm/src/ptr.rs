use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// A region-relative pointer.
///
/// The offset is measured in bytes from the base of the owning
/// [`ShmRegion`](crate::ShmRegion). Offset 0 lands on the region header and
/// is therefore never a valid allocation; it doubles as the null sentinel.
///
/// `ShmPointer` is plain data: it can be embedded in task payloads, copied
/// between processes and serialized onto the wire. Dereferencing requires
/// the region it came from.
#[repr(C)]
#[derive(Serialize, Deserialize)]
pub struct ShmPointer<T> {
    off: u64,
    #[serde(skip)]
    _marker: PhantomData<*mut T>,
}

impl<T> ShmPointer<T> {
    #[must_use]
    pub fn from_offset(off: u64) -> Self {
        Self {
            off,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn null() -> Self {
        Self::from_offset(0)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.off == 0
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.off
    }

    /// Reinterpret the pointee type. The offset is unchanged.
    #[must_use]
    pub fn cast<U>(self) -> ShmPointer<U> {
        ShmPointer::from_offset(self.off)
    }

    /// Offset arithmetic in bytes.
    #[must_use]
    pub fn add_bytes(self, bytes: u64) -> Self {
        Self::from_offset(self.off + bytes)
    }
}

impl<T> Clone for ShmPointer<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ShmPointer<T> {}

impl<T> Default for ShmPointer<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for ShmPointer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.off == other.off
    }
}

impl<T> Eq for ShmPointer<T> {}

impl<T> std::hash::Hash for ShmPointer<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.off.hash(state);
    }
}

impl<T> core::fmt::Debug for ShmPointer<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ShmPointer({:#x})", self.off)
    }
}

// The pointer itself is just an offset; whether the pointee may be shared
// is decided by whoever dereferences it.
unsafe impl<T> Send for ShmPointer<T> {}
unsafe impl<T> Sync for ShmPointer<T> {}

#[cfg(test)]
mod test_shm_pointer {
    use super::*;

    #[test]
    fn null_roundtrip() {
        let p: ShmPointer<u32> = ShmPointer::null();
        assert!(p.is_null());
        assert_eq!(p.offset(), 0);

        let q: ShmPointer<u64> = p.cast();
        assert!(q.is_null());
    }

    #[test]
    fn arithmetic_and_equality() {
        let p: ShmPointer<u8> = ShmPointer::from_offset(128);
        assert_eq!(p.add_bytes(64).offset(), 192);
        assert_eq!(p, ShmPointer::from_offset(128));
        assert_ne!(p, ShmPointer::from_offset(129));
    }
}
