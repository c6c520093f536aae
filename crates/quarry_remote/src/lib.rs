//! Remote dispatch for the quarry runtime: a TCP request/response transport
//! plus the remote-queue task state that carries tasks between nodes.

mod client;
mod errors;
mod hosts;
mod proto;
mod server;
mod state;

pub use client::RpcClient;
pub use errors::{RpcError, RpcResult};
pub use hosts::{HostInfo, HostTable};
pub use proto::IoType;
pub use server::RpcServer;
pub use state::{
    start_transport, PushPayload, RemoteHandle, RemoteQueue, RemoteQueueState, MAX_REPLICAS,
    REMOTE_QUEUE_LIB,
};
