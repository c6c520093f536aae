//! Client and runtime façades for the quarry task runtime.
//!
//! [`Runtime::start`] brings a node up (region, queues, registry, workers,
//! transport); [`Client::connect`] attaches a separate process to it. Both
//! expose the submit/await surface tasks are built on.

mod client;
mod errors;
mod runtime;

pub use client::Client;
pub use errors::{ClientError, ClientResult};
pub use runtime::Runtime;
