//! Shared-memory backbone of the quarry runtime.
//!
//! Every task, queue and piece of per-state metadata the runtime exchanges
//! between processes lives inside a single named [`ShmRegion`]. Processes
//! with different mappings exchange [`ShmPointer`]s — region-relative byte
//! offsets — never absolute addresses.

mod alloc;
mod buf;
mod errors;
mod ptr;
mod region;

pub use alloc::{AllocHeader, SIZE_CLASS_BASE, SIZE_CLASS_COUNT};
pub use buf::{PodArray, ShmBuf, ShmString};
pub use errors::ShmError;
pub use ptr::ShmPointer;
pub use region::{RegionHeader, ShmRegion, REGION_MAGIC};

pub type ShmResult<T> = Result<T, ShmError>;
