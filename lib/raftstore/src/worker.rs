//! Shared worker pools backing the two asynchronous job families that may
//! not block a raft worker's own thread: apply jobs
//! (`ApplyDelegate::apply_committed_entries`) and snapshot jobs (generation
//! and application). Each pool is a dedicated `tokio` runtime, following the
//! pattern of owning a separate `Runtime` per concern (`search_runtime`,
//! `collection_management_runtime` in `common/helpers.rs`) rather than
//! sharing the binary's main runtime.

use std::io;
use std::sync::Arc;

use engine::DataEngine;
use raft::eraftpb::Entry;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedSender;

use crate::apply::{ApplyDelegate, AsyncApplyResult};
use crate::cell::CellId;
use crate::peer_storage::{GenSnapOutcome, GenerateSnapTask, SnapshotScheduler};

/// A unit of apply work: run `delegate.apply_committed_entries` off the raft
/// worker thread and deliver the result to the cell's inbox.
pub struct ApplyTask {
    pub delegate: Arc<ApplyDelegate>,
    pub term: u64,
    pub entries: Vec<Entry>,
    pub result_tx: UnboundedSender<AsyncApplyResult>,
}

/// Dispatches apply jobs. Production code backs this with
/// [`ApplyWorkerPool`]; tests can run a job inline with a synchronous
/// stand-in the same way `peer_storage` tests stub `SnapshotScheduler`.
pub trait ApplyScheduler: Send + Sync {
    fn schedule_apply(&self, task: ApplyTask);
}

/// Installs a generated-and-fetched snapshot's key/value contents into the
/// data engine. Split out from [`GenerateSnapTask`] because it runs on the
/// *applying* side of a peer rather than the generating side, but shares the
/// same pool.
pub struct InstallSnapTask {
    pub cell_id: CellId,
    pub data_engine: Arc<dyn DataEngine>,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    pub done_tx: UnboundedSender<CellId>,
}

/// A named, fixed-size `tokio` multi-thread runtime used purely as a worker
/// pool — nothing here depends on async I/O, but reusing `tokio` (already a
/// workspace dependency for its channel and oneshot types) avoids pulling in
/// a second executor.
pub struct WorkerPool {
    runtime: Runtime,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name(name.to_owned())
            .enable_time()
            .build()?;
        Ok(Self { runtime })
    }
}

impl ApplyScheduler for WorkerPool {
    fn schedule_apply(&self, task: ApplyTask) {
        self.runtime.spawn_blocking(move || {
            let result = task.delegate.apply_committed_entries(task.term, task.entries);
            let _ = task.result_tx.send(result);
        });
    }
}

impl SnapshotScheduler for WorkerPool {
    fn schedule_generate(&self, task: GenerateSnapTask) {
        self.runtime.spawn_blocking(move || {
            let outcome = generate_snapshot(&task);
            task.complete(outcome);
        });
    }

    /// Installs a received snapshot's data into the data engine: clears any
    /// prior contents in the new range first (a covering snapshot is
    /// expected to fully determine the range's contents), then writes every
    /// entry. Notifies `done_tx` with the cell id on completion so the
    /// owning `PeerReplicate` can transition out of `Applying`.
    fn schedule_install(&self, task: InstallSnapTask) {
        self.runtime.spawn_blocking(move || {
            if let Err(e) = task.data_engine.delete_range(&task.start_key, &task.end_key) {
                log::error!("cell {}: failed to clear range before snapshot install: {e}", task.cell_id);
            }
            for (key, value) in &task.entries {
                if let Err(e) = task.data_engine.put(key, value) {
                    log::error!("cell {}: failed to install snapshot key: {e}", task.cell_id);
                }
            }
            let _ = task.done_tx.send(task.cell_id);
        });
    }
}

fn generate_snapshot(task: &GenerateSnapTask) -> crate::errors::Result<GenSnapOutcome> {
    let entries = task
        .data_engine
        .scan_range(&task.cell.start_key, &task.cell.end_key)
        .map_err(crate::errors::Error::from)?;
    Ok(GenSnapOutcome {
        index: task.index,
        term: task.term,
        data: crate::peer_storage::SnapshotData { cell: task.cell.clone(), entries },
    })
}
