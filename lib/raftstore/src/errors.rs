use crate::cell::CellId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("log unavailable")]
    Unavailable,
    #[error("temporarily unavailable")]
    TemporarilyUnavailable,
    #[error("stale command")]
    StaleCommand,
    #[error("cell {0} not found")]
    CellNotFound(CellId),
    #[error("snapshot generation failed after repeated attempts")]
    SnapshotFailed,
    #[error("engine error: {0}")]
    Engine(#[from] engine::EngineError),
    #[error("corrupt state: {0}")]
    Corrupt(String),
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct OtherRaftError(String);

impl From<Error> for raft::Error {
    fn from(err: Error) -> raft::Error {
        match err {
            Error::Unavailable => raft::Error::Store(raft::StorageError::Unavailable),
            Error::TemporarilyUnavailable => {
                raft::Error::Store(raft::StorageError::SnapshotTemporarilyUnavailable)
            }
            other => raft::Error::Store(raft::StorageError::Other(Box::new(OtherRaftError(
                other.to_string(),
            )))),
        }
    }
}

/// Logs and aborts the process. Used at the one boundary this module designates
/// as unrecoverable: a violated durability or ordering invariant, or a
/// meta-engine write that fails on the ready-processing path, where silent
/// divergence would be worse than a crash.
///
/// Test builds panic instead of aborting, so `#[should_panic]` tests can
/// observe the invariant violation without taking down the whole test binary.
#[cfg(not(test))]
pub fn fatal(msg: impl std::fmt::Display) -> ! {
    log::error!("fatal raftstore error, aborting: {}", msg);
    std::process::abort();
}

#[cfg(test)]
pub fn fatal(msg: impl std::fmt::Display) -> ! {
    panic!("fatal raftstore error: {}", msg);
}
