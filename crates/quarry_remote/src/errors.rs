#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("host file {path} could not be read: {detail}")]
    HostFile { path: String, detail: String },

    #[error("no hosts configured")]
    NoHosts,

    #[error("could not identify this host in the host table")]
    UnknownSelf,

    #[error("node {0} is not in the host table")]
    UnknownNode(u32),

    #[error("connection to node {node} failed: {source}")]
    Connect {
        node: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o failure talking to node {node}: {source}")]
    Io {
        node: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("bad frame: {0}")]
    BadFrame(String),

    #[error("peer returned an empty reply (unknown state at peer)")]
    EmptyReply,

    #[error(transparent)]
    Runtime(#[from] quarry_runtime::RuntimeError),
}

pub type RpcResult<T> = Result<T, RpcError>;
