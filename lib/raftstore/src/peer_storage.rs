//! [`PeerStorage`] implements the storage contract the `raft` crate requires
//! (log entries, terms, hard state, snapshot fetch) against the meta engine,
//! and owns a cell's durable raft state.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use engine::{keys, DataEngine, MetaEngine, WriteBatch};
use parking_lot::{Mutex, RwLock};
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot, SnapshotMetadata};
use raft::{GetEntriesContext, RaftState, Storage};
use serde::{Deserialize, Serialize};

use crate::cell::{CellDescriptor, CellId};
use crate::errors::{Error, Result};

/// After this many consecutive failed generation attempts, `snapshot()`
/// surfaces a permanent error instead of retrying forever.
pub const MAX_SNAP_TRY: usize = 5;

/// Synthetic index/term seeded for a cell that starts out already
/// initialized without ever receiving a snapshot — a freshly split cell, or
/// the first cell of a new deployment. Matches index/term 0 being reserved
/// for "nothing has ever been written"; seeding 5/5 instead of 0/0 keeps
/// `initial_state`'s "hard state empty ⇒ corrupt" check from
/// firing on a cell that is legitimately initialized but has no raft log yet.
pub const RAFT_INIT_LOG_INDEX: u64 = 5;
pub const RAFT_INIT_LOG_TERM: u64 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PersistedRaftState {
    term: u64,
    vote: u64,
    commit: u64,
    last_index: u64,
}

impl PersistedRaftState {
    fn hard_state(&self) -> HardState {
        let mut hs = HardState::default();
        hs.term = self.term;
        hs.vote = self.vote;
        hs.commit = self.commit;
        hs
    }

    fn is_empty(&self) -> bool {
        *self == PersistedRaftState::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedState {
    pub index: u64,
    pub term: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PersistedApplyState {
    applied_index: u64,
    applied_index_term: u64,
    truncated: TruncatedState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerLifecycle {
    Normal,
    Applying,
    Tombstone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPeerState {
    pub lifecycle: PeerLifecycle,
    pub cell: CellDescriptor,
}

/// Data embedded in a generated `raft::eraftpb::Snapshot`: enough to
/// reconstruct the data engine contents and the cell descriptor on the
/// receiving peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    pub cell: CellDescriptor,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl SnapshotData {
    fn encode(&self) -> Vec<u8> {
        serde_cbor::to_vec(self).expect("SnapshotData is always serializable")
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        serde_cbor::from_slice(bytes)
            .map_err(|e| Error::Corrupt(format!("malformed snapshot payload: {e}")))
    }
}

/// Outcome of an asynchronous snapshot-generation job, placed into a cell's
/// [`SnapGenSlot`] by whatever runs [`SnapshotScheduler`].
pub struct GenSnapOutcome {
    pub index: u64,
    pub term: u64,
    pub data: SnapshotData,
}

enum SnapGenSlot {
    Idle,
    Generating,
    Done(Result<GenSnapOutcome>),
}

/// A generation job handed to a [`SnapshotScheduler`]. The job owns a handle
/// into the same slot `snapshot()` reads from, so it can report its result
/// without needing a back-reference to the owning `PeerStorage`, which
/// `raft::RawNode` holds by value, not behind an `Arc`.
pub struct GenerateSnapTask {
    pub cell_id: CellId,
    pub index: u64,
    pub term: u64,
    pub cell: CellDescriptor,
    pub data_engine: Arc<dyn DataEngine>,
    slot: Arc<Mutex<SnapGenSlot>>,
}

impl GenerateSnapTask {
    pub fn complete(&self, outcome: Result<GenSnapOutcome>) {
        *self.slot.lock() = SnapGenSlot::Done(outcome);
    }
}

/// Dispatches asynchronous snapshot-generation work. Production code backs
/// this with the shared snapshot worker pool (see `crate::worker`); tests can
/// supply a synchronous stand-in that runs the task inline.
pub trait SnapshotScheduler: Send + Sync {
    fn schedule_generate(&self, task: GenerateSnapTask);

    /// Installs a received snapshot's contents into the data engine.
    fn schedule_install(&self, task: crate::worker::InstallSnapTask);
}

pub struct PeerStorage {
    engine: Arc<dyn MetaEngine>,
    data_engine: Arc<dyn DataEngine>,
    scheduler: Arc<dyn SnapshotScheduler>,
    cell_id: CellId,
    peer_id: crate::cell::PeerId,

    cell: RwLock<CellDescriptor>,
    raft_state: RwLock<PersistedRaftState>,
    apply_state: RwLock<PersistedApplyState>,
    last_term: AtomicU64,

    /// Cell descriptor and data-engine contents staged by `append_snapshot`,
    /// consumed by `PeerReplicate::do_apply_snap`.
    pub snap_data: Mutex<Option<SnapshotData>>,

    snap_gen: Arc<Mutex<SnapGenSlot>>,
    snap_try_cnt: AtomicUsize,
}

impl PeerStorage {
    pub fn new(
        engine: Arc<dyn MetaEngine>,
        data_engine: Arc<dyn DataEngine>,
        scheduler: Arc<dyn SnapshotScheduler>,
        cell_id: CellId,
        peer_id: crate::cell::PeerId,
        cell: CellDescriptor,
    ) -> Result<Self> {
        let raft_state = Self::load_raft_state(&engine, cell_id)?;
        let apply_state = Self::load_apply_state(&engine, cell_id)?;

        if raft_state.is_empty() && cell.is_initialized() {
            return Err(Error::Corrupt(format!(
                "cell {cell_id} is initialized but has empty persisted hard state"
            )));
        }

        let last_term = if apply_state.truncated.index == apply_state.applied_index {
            apply_state.truncated.term
        } else {
            Self::term_from_log(&engine, cell_id, raft_state.last_index)?.unwrap_or(0)
        };

        Ok(Self {
            engine,
            data_engine,
            scheduler,
            cell_id,
            peer_id,
            cell: RwLock::new(cell),
            raft_state: RwLock::new(raft_state),
            apply_state: RwLock::new(apply_state),
            last_term: AtomicU64::new(last_term),
            snap_data: Mutex::new(None),
            snap_gen: Arc::new(Mutex::new(SnapGenSlot::Idle)),
            snap_try_cnt: AtomicUsize::new(0),
        })
    }

    fn load_raft_state(engine: &Arc<dyn MetaEngine>, cell_id: CellId) -> Result<PersistedRaftState> {
        match engine.get(&keys::raft_state_key(cell_id))? {
            Some(bytes) => serde_cbor::from_slice(&bytes)
                .map_err(|e| Error::Corrupt(format!("bad raft state for cell {cell_id}: {e}"))),
            None => Ok(PersistedRaftState::default()),
        }
    }

    fn load_apply_state(engine: &Arc<dyn MetaEngine>, cell_id: CellId) -> Result<PersistedApplyState> {
        match engine.get(&keys::apply_state_key(cell_id))? {
            Some(bytes) => serde_cbor::from_slice(&bytes)
                .map_err(|e| Error::Corrupt(format!("bad apply state for cell {cell_id}: {e}"))),
            None => Ok(PersistedApplyState::default()),
        }
    }

    /// Seeds a brand-new, already-initialized cell's persisted state at
    /// `(RAFT_INIT_LOG_INDEX, RAFT_INIT_LOG_TERM)` before constructing the
    /// `PeerStorage`, so `Storage::initial_state` sees a non-empty hard
    /// state immediately. Used for a cell's very first peer on this store
    /// (deployment bootstrap) and for the new half of a split, which starts
    /// with a full peer set but no raft log of its own.
    pub fn bootstrap(
        engine: Arc<dyn MetaEngine>,
        data_engine: Arc<dyn DataEngine>,
        scheduler: Arc<dyn SnapshotScheduler>,
        cell_id: CellId,
        peer_id: crate::cell::PeerId,
        cell: CellDescriptor,
    ) -> Result<Self> {
        debug_assert!(cell.is_initialized());
        let raft_state = PersistedRaftState {
            term: RAFT_INIT_LOG_TERM,
            vote: 0,
            commit: RAFT_INIT_LOG_INDEX,
            last_index: RAFT_INIT_LOG_INDEX,
        };
        let apply_state = PersistedApplyState {
            applied_index: RAFT_INIT_LOG_INDEX,
            applied_index_term: RAFT_INIT_LOG_TERM,
            truncated: TruncatedState { index: RAFT_INIT_LOG_INDEX, term: RAFT_INIT_LOG_TERM },
        };
        engine.put(&keys::raft_state_key(cell_id), &serde_cbor::to_vec(&raft_state).expect("serializable"))?;
        engine.put(&keys::apply_state_key(cell_id), &serde_cbor::to_vec(&apply_state).expect("serializable"))?;
        Self::new(engine, data_engine, scheduler, cell_id, peer_id, cell)
    }

    fn term_from_log(engine: &Arc<dyn MetaEngine>, cell_id: CellId, index: u64) -> Result<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        match engine.get(&keys::raft_log_key(cell_id, index))? {
            Some(bytes) => {
                let entry = decode_entry(&bytes)?;
                Ok(Some(entry.term))
            }
            None => Ok(None),
        }
    }

    pub fn cell_id(&self) -> CellId {
        self.cell_id
    }

    pub fn cell(&self) -> CellDescriptor {
        self.cell.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.read().is_initialized()
    }

    pub fn truncated_index(&self) -> u64 {
        self.apply_state.read().truncated.index
    }

    pub fn truncated_term(&self) -> u64 {
        self.apply_state.read().truncated.term
    }

    pub fn applied_index(&self) -> u64 {
        self.apply_state.read().applied_index
    }

    pub fn applied_index_term(&self) -> u64 {
        self.apply_state.read().applied_index_term
    }

    pub fn commit_index(&self) -> u64 {
        self.raft_state.read().commit
    }

    pub fn last_term(&self) -> u64 {
        self.last_term.load(Ordering::Acquire)
    }

    pub fn set_applied(&self, index: u64, term: u64) {
        let mut state = self.apply_state.write();
        state.applied_index = index;
        state.applied_index_term = term;
    }

    pub fn set_commit(&self, commit: u64) {
        self.raft_state.write().commit = commit;
    }

    pub fn set_hard_state(&self, hs: &HardState) {
        let mut state = self.raft_state.write();
        state.term = hs.term;
        state.vote = hs.vote;
        state.commit = hs.commit;
    }

    // ---- internal durable operations ----------------------

    /// Maintains the invariant that for every index in `(truncated, last]`,
    /// `raft_log_key` exists. Overwrite semantics: a new leader's log
    /// supersedes any uncommitted tail left over from a previous term.
    pub fn append_entries(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let old_last = self.raft_state.read().last_index;
        let new_last = entries.last().unwrap().index;
        let new_last_term = entries.last().unwrap().term;

        let mut batch = WriteBatch::new();
        for entry in entries {
            batch.put(keys::raft_log_key(self.cell_id, entry.index), encode_entry(entry));
        }
        for stale in (new_last + 1)..=old_last {
            batch.delete(keys::raft_log_key(self.cell_id, stale));
        }
        self.engine.write(batch)?;

        let mut state = self.raft_state.write();
        state.last_index = new_last;
        drop(state);
        self.last_term.store(new_last_term, Ordering::Release);

        log::debug!(
            "cell {} appended entries up to index {} (term {}), truncating stale suffix {}..={}",
            self.cell_id,
            new_last,
            new_last_term,
            new_last + 1,
            old_last
        );
        Ok(())
    }

    /// Stages a received snapshot: validates the embedded cell descriptor,
    /// clears prior log/state if this cell was already initialized, marks
    /// the peer `Applying`, and records the snapshot point.
    pub fn append_snapshot(&self, snap: &Snapshot) -> Result<()> {
        let data = SnapshotData::decode(snap.get_data())?;
        if data.cell.id != self.cell_id {
            return Err(Error::Corrupt(format!(
                "snapshot names cell {} but this is cell {}",
                data.cell.id, self.cell_id
            )));
        }

        if self.is_initialized() {
            let prefix = keys::raft_log_prefix(self.cell_id);
            let mut batch = WriteBatch::new();
            for (key, _) in self.engine.scan_prefix(&prefix)? {
                batch.delete(key);
            }
            batch.delete(keys::raft_state_key(self.cell_id));
            batch.delete(keys::apply_state_key(self.cell_id));
            self.engine.write(batch)?;
        }

        self.set_peer_lifecycle(PeerLifecycle::Applying)?;

        let meta = snap.get_metadata();
        {
            let mut raft_state = self.raft_state.write();
            raft_state.last_index = meta.index;
            raft_state.commit = meta.index;
            raft_state.term = meta.term;
        }
        self.last_term.store(meta.term, Ordering::Release);
        {
            let mut apply_state = self.apply_state.write();
            apply_state.applied_index = meta.index;
            apply_state.applied_index_term = meta.term;
            apply_state.truncated = TruncatedState {
                index: meta.index,
                term: meta.term,
            };
        }
        log::debug!(
            "cell {} staged snapshot at index {} term {} ({} rows)",
            self.cell_id,
            meta.index,
            meta.term,
            data.entries.len()
        );
        *self.snap_data.lock() = Some(data);
        Ok(())
    }

    /// Applies a committed `CompactLog` admin command locally: deletes log
    /// entries below `first_index_kept` and advances the truncated state.
    /// Handled entirely within the owning `PeerReplicate`/`PeerStorage` —
    /// unlike `ConfChange`/`Split`, compaction touches no store-wide index.
    pub fn apply_compact(&self, first_index_kept: u64) -> Result<()> {
        let truncated = self.truncated_index();
        if first_index_kept <= truncated + 1 {
            return Ok(());
        }
        let new_truncated_index = first_index_kept - 1;
        let term = Self::term_from_log(&self.engine, self.cell_id, new_truncated_index)?
            .ok_or_else(|| Error::Corrupt(format!(
                "cell {}: compact target index {} missing from log",
                self.cell_id, new_truncated_index
            )))?;

        let mut batch = WriteBatch::new();
        for idx in (truncated + 1)..=new_truncated_index {
            batch.delete(keys::raft_log_key(self.cell_id, idx));
        }
        self.engine.write(batch)?;

        let mut apply_state = self.apply_state.write();
        apply_state.truncated = TruncatedState { index: new_truncated_index, term };
        Ok(())
    }

    /// Peer lifecycle isn't cached in memory; persisted immediately since it
    /// gates whether proposals and apply are accepted for this cell.
    pub fn set_peer_lifecycle(&self, lifecycle: PeerLifecycle) -> Result<()> {
        let cell = self.cell.read().clone();
        let persisted = PersistedPeerState { lifecycle, cell };
        self.engine.put(
            &keys::peer_state_key(self.cell_id),
            &serde_cbor::to_vec(&persisted).expect("serializable"),
        )?;
        Ok(())
    }

    /// Persists raft state then apply state (step 3 of ready processing);
    /// the meta engine gives crash atomicity per key, so ordering here is
    /// what determines what a crash mid-write can leave behind.
    pub fn persist(&self) -> Result<()> {
        let raft_state = *self.raft_state.read();
        self.engine.put(
            &keys::raft_state_key(self.cell_id),
            &serde_cbor::to_vec(&raft_state).expect("serializable"),
        )?;
        let apply_state = *self.apply_state.read();
        self.engine.put(
            &keys::apply_state_key(self.cell_id),
            &serde_cbor::to_vec(&apply_state).expect("serializable"),
        )?;
        Ok(())
    }

    /// Installs the cell descriptor carried by a just-applied snapshot and
    /// clears the staging slot. Called by `PeerReplicate::do_apply_snap`.
    pub fn finish_apply_snap(&self, cell: CellDescriptor) -> Result<()> {
        *self.cell.write() = cell;
        self.set_peer_lifecycle(PeerLifecycle::Normal)?;
        *self.snap_data.lock() = None;
        Ok(())
    }

    pub fn set_cell(&self, cell: CellDescriptor) {
        *self.cell.write() = cell;
    }

    // ---- snapshot generation state machine --------------------------------

    /// Builds a task anchored at the current applied index/term and hands it
    /// to the scheduler. Caller must already hold `snap_gen` in `Generating`.
    fn dispatch_generate(&self) {
        let apply_state = *self.apply_state.read();
        let task = GenerateSnapTask {
            cell_id: self.cell_id,
            index: apply_state.applied_index,
            term: apply_state.applied_index_term,
            cell: self.cell.read().clone(),
            data_engine: self.data_engine.clone(),
            slot: self.snap_gen.clone(),
        };
        log::debug!(
            "cell {} dispatching snapshot generation at index {}",
            self.cell_id,
            task.index
        );
        self.scheduler.schedule_generate(task);
    }
}

impl Storage for PeerStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let raft_state = *self.raft_state.read();
        if raft_state.is_empty() {
            if self.is_initialized() {
                Err(Error::Corrupt(format!(
                    "cell {} is initialized but hard state is empty",
                    self.cell_id
                )))?;
            }
            return Ok(RaftState::new(HardState::default(), ConfState::default()));
        }
        Ok(RaftState::new(raft_state.hard_state(), self.cell.read().conf_state()))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let truncated = self.truncated_index();
        let last = self.raft_state.read().last_index;
        if low <= truncated || high > last + 1 {
            return Err(Error::Unavailable.into());
        }
        if low == high {
            return Ok(vec![]);
        }
        if high == low + 1 {
            let bytes = self
                .engine
                .get(&keys::raft_log_key(self.cell_id, low))
                .map_err(Error::from)?
                .ok_or(Error::Unavailable)
                .map_err(raft::Error::from)?;
            return Ok(vec![decode_entry(&bytes).map_err(raft::Error::from)?]);
        }

        let max_size = max_size.into();
        let prefix = keys::raft_log_prefix(self.cell_id);
        let all = self.engine.scan_prefix(&prefix).map_err(Error::from)?;
        let mut out = Vec::new();
        let mut acc_size: u64 = 0;
        for (key, value) in all {
            let idx = keys::decode_raft_log_index(&key);
            if idx < low {
                continue;
            }
            if idx >= high {
                break;
            }
            let entry = decode_entry(&value).map_err(raft::Error::from)?;
            acc_size += value.len() as u64;
            out.push(entry);
            if let Some(max_size) = max_size {
                if acc_size > max_size && out.len() >= 1 {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let truncated = self.truncated_index();
        if idx == truncated {
            return Ok(self.truncated_term());
        }
        let last = self.raft_state.read().last_index;
        if idx == last {
            return Ok(self.last_term());
        }
        if self.truncated_term() == self.last_term() {
            return Ok(self.last_term());
        }
        let bytes = self
            .engine
            .get(&keys::raft_log_key(self.cell_id, idx))
            .map_err(Error::from)?
            .ok_or(Error::Unavailable)
            .map_err(raft::Error::from)?;
        Ok(decode_entry(&bytes).map_err(raft::Error::from)?.term)
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.truncated_index() + 1)
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.raft_state.read().last_index)
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let mut slot = self.snap_gen.lock();
        match std::mem::replace(&mut *slot, SnapGenSlot::Idle) {
            SnapGenSlot::Generating => {
                *slot = SnapGenSlot::Generating;
                Err(Error::TemporarilyUnavailable.into())
            }
            SnapGenSlot::Done(Ok(outcome)) => {
                if outcome.index < request_index {
                    self.bump_try_count_and_maybe_regenerate(&mut slot)
                } else {
                    self.snap_try_cnt.store(0, Ordering::Release);
                    let mut snap = Snapshot::default();
                    snap.set_data(outcome.data.encode());
                    let mut meta = SnapshotMetadata::default();
                    meta.index = outcome.index;
                    meta.term = outcome.term;
                    meta.set_conf_state(outcome.data.cell.conf_state());
                    snap.set_metadata(meta);
                    Ok(snap)
                }
            }
            SnapGenSlot::Done(Err(_)) => self.bump_try_count_and_maybe_regenerate(&mut slot),
            SnapGenSlot::Idle => {
                *slot = SnapGenSlot::Generating;
                log::debug!("cell {} starting snapshot generation", self.cell_id);
                Err(Error::TemporarilyUnavailable.into())
            }
        }
    }
}

impl PeerStorage {
    fn bump_try_count_and_maybe_regenerate(
        &self,
        slot: &mut parking_lot::MutexGuard<'_, SnapGenSlot>,
    ) -> raft::Result<Snapshot> {
        let tries = self.snap_try_cnt.fetch_add(1, Ordering::AcqRel) + 1;
        if tries >= MAX_SNAP_TRY {
            self.snap_try_cnt.store(0, Ordering::Release);
            **slot = SnapGenSlot::Idle;
            return Err(Error::SnapshotFailed.into());
        }
        **slot = SnapGenSlot::Generating;
        log::debug!(
            "cell {} snapshot generation attempt {} failed, retrying",
            self.cell_id,
            tries
        );
        Err(Error::TemporarilyUnavailable.into())
    }

    pub fn peer_id(&self) -> crate::cell::PeerId {
        self.peer_id
    }
}

pub fn encode_entry(entry: &Entry) -> Vec<u8> {
    use prost::Message;
    let mut buf = Vec::new();
    entry.encode(&mut buf).expect("encoding an Entry cannot fail");
    buf
}

pub fn decode_entry(bytes: &[u8]) -> Result<Entry> {
    use prost::Message;
    Entry::decode(bytes).map_err(|e| Error::Corrupt(format!("malformed log entry: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Epoch;
    use engine::{SledDataEngine, SledMetaEngine};
    use proptest::prelude::*;

    struct NoopScheduler;
    impl SnapshotScheduler for NoopScheduler {
        fn schedule_generate(&self, _task: GenerateSnapTask) {}
        fn schedule_install(&self, _task: crate::worker::InstallSnapTask) {}
    }

    fn scheduler() -> Arc<dyn SnapshotScheduler> {
        Arc::new(NoopScheduler)
    }

    fn descriptor(id: CellId, peers: &[(u64, u64)]) -> CellDescriptor {
        CellDescriptor {
            id,
            start_key: vec![],
            end_key: vec![],
            epoch: Epoch::default(),
            peers: peers.iter().map(|&(pid, sid)| crate::cell::PeerMeta { id: pid, store_id: sid }).collect(),
        }
    }

    fn uninitialized_storage(cell_id: CellId) -> PeerStorage {
        let meta = Arc::new(SledMetaEngine::open_temporary().unwrap());
        let data = Arc::new(SledDataEngine::open_temporary().unwrap());
        PeerStorage::new(meta, data, scheduler(), cell_id, 1, descriptor(cell_id, &[])).unwrap()
    }

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e
    }

    fn ctx() -> raft::GetEntriesContext {
        raft::GetEntriesContext::empty(false)
    }

    /// Scenario 1: bootstrap a cell with entries 1..10 at term 2, then append
    /// new entries 6..8 at term 3 as a new leader would. 1..5 unchanged,
    /// 6..8 carry term 3, 9..10 are gone, last_index == 8.
    #[test]
    fn log_overwrite_on_leader_change() {
        let ps = uninitialized_storage(1);
        let original: Vec<Entry> = (1..=10).map(|i| entry(i, 2)).collect();
        ps.append_entries(&original).unwrap();
        assert_eq!(Storage::last_index(&ps).unwrap(), 10);

        let overwrite: Vec<Entry> = (6..=8).map(|i| entry(i, 3)).collect();
        ps.append_entries(&overwrite).unwrap();

        assert_eq!(Storage::last_index(&ps).unwrap(), 8);
        for i in 1..=5 {
            let fetched = Storage::entries(&ps, i, i + 1, None, ctx()).unwrap();
            assert_eq!(fetched[0].term, 2, "index {i} should keep its original term");
        }
        for i in 6..=8 {
            let fetched = Storage::entries(&ps, i, i + 1, None, ctx()).unwrap();
            assert_eq!(fetched[0].term, 3, "index {i} should carry the new term");
        }
        for i in 9..=10 {
            assert!(
                Storage::entries(&ps, i, i + 1, None, ctx()).is_err(),
                "index {i} should have been truncated away"
            );
        }
    }

    /// Scenario 2: applying a snapshot onto an already-initialized cell wipes
    /// the prior log and installs the snapshot's apply/truncated state.
    #[test]
    fn snapshot_onto_initialized_cell() {
        let ps = PeerStorage::bootstrap(
            Arc::new(SledMetaEngine::open_temporary().unwrap()),
            Arc::new(SledDataEngine::open_temporary().unwrap()),
            scheduler(),
            1,
            1,
            descriptor(1, &[(1, 1)]),
        )
        .unwrap();
        let entries: Vec<Entry> = (6..=50).map(|i| entry(i, 1)).collect();
        ps.append_entries(&entries).unwrap();
        assert!(Storage::entries(&ps, 6, 7, None, ctx()).is_ok());

        let new_cell = descriptor(1, &[(1, 1), (2, 2), (3, 3)]);
        let mut snap = Snapshot::default();
        snap.set_data(SnapshotData { cell: new_cell.clone(), entries: vec![(b"k".to_vec(), b"v".to_vec())] }.encode());
        let mut meta = SnapshotMetadata::default();
        meta.index = 100;
        meta.term = 7;
        snap.set_metadata(meta);

        ps.append_snapshot(&snap).unwrap();

        assert!(Storage::entries(&ps, 6, 7, None, ctx()).is_err(), "old log entries must be gone");
        assert_eq!(ps.applied_index(), 100);
        assert_eq!(ps.applied_index_term(), 7);
        assert_eq!(ps.truncated_index(), 100);
        assert_eq!(ps.truncated_term(), 7);
        let staged = ps.snap_data.lock().clone().unwrap();
        assert_eq!(staged.cell.peers.len(), 3);

        // `PeerReplicate::do_apply_snap` installs the staged cell onto
        // `PeerStorage` synchronously, in the same tick the snapshot is
        // applied — the data-engine row install is what stays async.
        ps.set_cell(staged.cell.clone());
        assert_eq!(ps.cell().peers.len(), 3);
        assert_eq!(ps.cell().peers, new_cell.peers);
    }

    /// Scenario 6: after MAX_SNAP_TRY consecutive failed generation attempts,
    /// `snapshot()` surfaces a permanent error and the counter resets so the
    /// next call restarts generation from scratch.
    #[test]
    fn snapshot_generation_retry_cap() {
        let ps = uninitialized_storage(1);
        for attempt in 0..MAX_SNAP_TRY {
            *ps.snap_gen.lock() = SnapGenSlot::Done(Err(Error::Corrupt("boom".into())));
            let result = Storage::snapshot(&ps, 1, 0);
            if attempt + 1 < MAX_SNAP_TRY {
                assert!(
                    matches!(result, Err(raft::Error::Store(raft::StorageError::SnapshotTemporarilyUnavailable))),
                    "attempt {attempt} should retry"
                );
            } else {
                assert!(result.is_err(), "final attempt should surface a permanent failure");
            }
        }
        assert_eq!(ps.snap_try_cnt.load(Ordering::Acquire), 0);

        // Next call restarts generation rather than staying failed forever.
        let result = Storage::snapshot(&ps, 1, 0);
        assert!(matches!(
            result,
            Err(raft::Error::Store(raft::StorageError::SnapshotTemporarilyUnavailable))
        ));
    }

    #[test]
    fn single_entry_fetch_is_shortcut() {
        let ps = uninitialized_storage(1);
        ps.append_entries(&[entry(1, 1)]).unwrap();
        let fetched = Storage::entries(&ps, 1, 2, None, ctx()).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].index, 1);
    }

    proptest! {
        /// P1/P2: appending entries 1..=n at term 1 then overwriting a
        /// suffix starting at `cut` with a new term leaves the prefix
        /// intact, replaces the overwritten range with the new term, and
        /// drops everything the new tail didn't cover.
        #[test]
        fn append_then_overwrite_suffix(n in 3u64..30, cut in 1u64..30) {
            prop_assume!(cut <= n);
            let ps = uninitialized_storage(1);
            let original: Vec<Entry> = (1..=n).map(|i| entry(i, 1)).collect();
            ps.append_entries(&original).unwrap();
            let old_last = n;

            let new_last = cut + 1;
            let overwrite: Vec<Entry> = (cut..=new_last).map(|i| entry(i, 2)).collect();
            ps.append_entries(&overwrite).unwrap();

            prop_assert_eq!(Storage::last_index(&ps).unwrap(), new_last);
            for i in 1..cut {
                let fetched = Storage::entries(&ps, i, i + 1, None, ctx()).unwrap();
                prop_assert_eq!(fetched[0].term, 1);
            }
            for i in cut..=new_last {
                let fetched = Storage::entries(&ps, i, i + 1, None, ctx()).unwrap();
                prop_assert_eq!(fetched[0].term, 2);
            }
            for i in (new_last + 1)..=old_last {
                prop_assert!(Storage::entries(&ps, i, i + 1, None, ctx()).is_err());
            }
        }

        /// P4: a ranged `entries()` call returns either every entry in
        /// `[low, high)` or stops early once the accumulated size exceeds
        /// `max_size`, but never returns zero entries when some exist.
        #[test]
        fn ranged_entries_respect_max_size(n in 1u64..40, max_size in proptest::option::of(1u64..200)) {
            let ps = uninitialized_storage(1);
            let entries: Vec<Entry> = (1..=n).map(|i| entry(i, 1)).collect();
            ps.append_entries(&entries).unwrap();

            let fetched = Storage::entries(&ps, 1, n + 1, max_size, ctx()).unwrap();
            prop_assert!(!fetched.is_empty());
            match max_size {
                Some(_) => prop_assert!(fetched.len() as u64 <= n),
                None => prop_assert_eq!(fetched.len() as u64, n),
            }
        }
    }
}
