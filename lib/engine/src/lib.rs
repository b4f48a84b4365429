//! Trait-level interface to the two logical keyspaces backing a cell store
//! replica: the *meta engine* (raft log/state) and the *data engine* (user
//! keys). Both are external collaborators from the perspective of the raft
//! integration core — this crate only fixes their contract and ships a
//! `sled`-backed implementation so the rest of the workspace has something
//! concrete to run against and test with.

pub mod keys;

mod error;
mod sled_engine;

pub use error::EngineError;
pub use sled_engine::{SledDataEngine, SledMetaEngine};

/// A batch of key mutations applied atomically by a single `write` call.
///
/// Mirrors the meta engine's "single-key crash atomicity" contract: multiple
/// keys queued in one `WriteBatch` are committed together.
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

pub(crate) enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// The meta engine: raft log entries and per-cell raft/apply/peer state.
pub trait MetaEngine: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;
    fn write(&self, batch: WriteBatch) -> Result<(), EngineError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        let mut batch = WriteBatch::new();
        batch.put(key.to_vec(), value.to_vec());
        self.write(batch)
    }
    fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        let mut batch = WriteBatch::new();
        batch.delete(key.to_vec());
        self.write(batch)
    }
    /// Entries ordered by key, i.e. by index for a `raft_log_prefix`.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError>;
}

/// The data engine: the user keyspace, scanned/split by cell range.
pub trait DataEngine: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError>;
    fn delete(&self, key: &[u8]) -> Result<(), EngineError>;
    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError>;
    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<(), EngineError>;
    /// Cheap approximation used by the split-check scan; a real engine would
    /// consult SST metadata instead of summing key/value lengths.
    fn approximate_size(&self, start: &[u8], end: &[u8]) -> Result<u64, EngineError>;
}
