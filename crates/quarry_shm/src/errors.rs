use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("failed to open region file {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to map region file {path}: {source}")]
    MapFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("region file {path} is smaller than its header")]
    TooSmall { path: PathBuf },

    #[error("region file {path} has a bad magic number (not a quarry region?)")]
    BadMagic { path: PathBuf },

    #[error("region is out of memory (requested {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("allocation alignment {align} exceeds the region alignment guarantee")]
    BadAlignment { align: usize },

    #[error("offset {offset} (+{len} bytes) is outside the region of {size} bytes")]
    OutOfBounds { offset: u64, len: usize, size: usize },

    #[error("shm string is not valid utf-8")]
    BadString,
}
