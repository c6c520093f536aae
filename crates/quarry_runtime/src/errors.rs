use crate::ids::{QueueId, TaskStateId};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to load config {path}: {detail}")]
    Config { path: String, detail: String },

    #[error(transparent)]
    Shm(#[from] quarry_shm::ShmError),

    #[error("queue {0} already exists")]
    QueueExists(QueueId),

    #[error("queue {0} does not exist")]
    QueueMissing(QueueId),

    #[error("queue directory is full ({max} queues)")]
    DirectoryFull { max: u32 },

    #[error("task lib {0} is not registered")]
    LibMissing(String),

    #[error("task lib {name} failed to load: {detail}")]
    LibLoad { name: String, detail: String },

    #[error("task lib {0} still has live task states")]
    LibBusy(String),

    #[error("task state {0} does not exist")]
    StateMissing(TaskStateId),

    #[error("task state {name} ({id}) could not be created")]
    StateCreate { name: String, id: TaskStateId },

    #[error("method {method} of state {state} does not support remote serialization")]
    NotSerializable { state: TaskStateId, method: u32 },

    #[error("serialization failed: {0}")]
    Serde(String),

    #[error("archive exhausted: expected another data transfer")]
    ArchiveExhausted,
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
