//! The quarry task runtime: a shared-memory, lock-free, cooperatively
//! scheduled dispatch fabric.
//!
//! Work is described by [`task::TaskHeader`]s allocated in a
//! [`quarry_shm::ShmRegion`], queued on the multi-lane priority queues of
//! [`queue`], executed by the [`worker`] pool under the
//! [`orchestrator::WorkOrchestrator`], and routed to pluggable
//! [`state::TaskState`] modules resolved through the
//! [`registry::TaskRegistry`]. Tasks whose domain resolves to another node
//! are handed to the remote dispatcher installed in the [`ctx::RuntimeCtx`].

pub mod admin;
pub mod config;
pub mod ctx;
pub mod errors;
pub mod ids;
pub mod lane;
pub mod orchestrator;
pub mod proc_queue;
pub mod queue;
pub mod queue_manager;
pub mod registry;
pub mod state;
pub mod task;
pub mod task_alloc;
pub mod worch;
pub mod worker;

pub use errors::{RuntimeError, RuntimeResult};
