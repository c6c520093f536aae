#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Shm(#[from] quarry_shm::ShmError),

    #[error(transparent)]
    Runtime(#[from] quarry_runtime::RuntimeError),

    #[error(transparent)]
    Rpc(#[from] quarry_remote::RpcError),

    #[error("runtime region {name} did not become ready")]
    NotReady { name: String },

    #[error("task submission failed: {0}")]
    Submit(String),
}

pub type ClientResult<T> = Result<T, ClientError>;
