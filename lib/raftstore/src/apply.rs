//! The asynchronous mutator that consumes committed raft log entries and
//! applies them to the data engine. This module treats
//! `ApplyDelegate` as an external collaborator with a narrow contract
//! surface; this module is a reference implementation of that contract,
//! backed by the shared apply worker pool (`crate::worker::ApplyWorkerPool`).
//!
//! Conf-change proposals ride the `raft` crate's native `EntryConfChangeV2`
//! entry type rather than the generic `Command` envelope used for normal
//! writes and the `Split`/`CompactLog` admin commands: the consensus library
//! owns conf-change entries specially (they're what `RawNode::apply_conf_change`
//! consumes), so the only way to carry the *new peer's store id* alongside one
//! is in the entry's opaque `context` field, not its `data`. See
//! `ProposalContext`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use engine::DataEngine;
use parking_lot::Mutex;
use raft::eraftpb::{ConfChangeType, ConfChangeV2, Entry, EntryType};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::cell::{CellDescriptor, CellId, PeerMeta};
use crate::errors::{fatal, Error, Result};

/// A client-facing write, or a structural admin operation that doesn't go
/// through the consensus library's own conf-change machinery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Admin(AdminRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdminRequest {
    Split {
        split_key: Vec<u8>,
        new_cell_id: CellId,
        new_peer_ids: Vec<u64>,
    },
    CompactLog {
        compact_index: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeKind {
    AddNode,
    RemoveNode,
}

/// The peer-directory half of a change-peer proposal: who is being added or
/// removed, threaded alongside the raft-native `ConfChangeV2` via the
/// entry's `context` field (see module docs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePeerRequest {
    pub peer: PeerMeta,
    pub change_type: ConfChangeKind,
}

/// Carried in `Entry::context` for every proposal this crate makes,
/// regardless of entry type, so the apply layer can resolve the matching
/// pending proposal and, for conf changes, recover the peer directory
/// information `ConfChangeV2` itself doesn't carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalContext {
    pub id: Uuid,
    pub change_peer: Option<ChangePeerRequest>,
}

impl ProposalContext {
    pub fn encode(&self) -> Vec<u8> {
        serde_cbor::to_vec(self).expect("ProposalContext is always serializable")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_cbor::from_slice(bytes).map_err(|e| Error::Corrupt(format!("malformed proposal context: {e}")))
    }
}

/// Outcome of applying a change-peer entry: the cell's new peer set plus
/// enough of the raw change to let `Store::post_apply_result` update its
/// caches without re-deriving a diff.
#[derive(Debug, Clone)]
pub struct ConfChangeOutcome {
    pub cell: CellDescriptor,
    pub change_type: ConfChangeKind,
    pub changed_peer: PeerMeta,
    /// Handed back to `RawNode::apply_conf_change` by the caller — the apply
    /// layer already decoded it once to compute the peer-set diff above, but
    /// only the raft library's own state machine knows how to fold it into
    /// voter/learner progress tracking.
    pub cc: ConfChangeV2,
}

#[derive(Debug, Clone)]
pub enum ExecResult {
    /// `changed_peer.id == 0` signals the raft layer rejected the change
    /// (e.g. it would leave the group without a majority); the caller should
    /// treat it as a no-op.
    ConfChange(ConfChangeOutcome),
    Split { left: CellDescriptor, right: CellDescriptor },
    CompactLog { first_index_kept: u64 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyMetrics {
    pub written_bytes: u64,
    pub written_keys: u64,
    pub size_diff_hint: i64,
    pub delete_keys_hint: u64,
}

/// Emitted after every apply batch and routed back to the owning
/// `PeerReplicate::post_apply`.
pub struct AsyncApplyResult {
    pub cell_id: CellId,
    pub applied_index: u64,
    pub applied_index_term: u64,
    pub metrics: ApplyMetrics,
    pub exec_result: Option<ExecResult>,
}

/// A registered client submission, resolved exactly once: applied, stale
/// (term mismatch or superseded), or dropped with the delegate on
/// cell destruction.
pub struct Proposal {
    pub id: Uuid,
    pub term: u64,
    replier: oneshot::Sender<CmdResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdResponse {
    Success,
    Stale,
}

/// Per-cell apply state: pending proposal bookkeeping plus the data-engine
/// mutations themselves. Owned by the `Store`'s apply map, reached by
/// `PeerReplicate` through a `CellId` lookup rather than a direct
/// reference, treated as an external collaborator with a narrow contract.
pub struct ApplyDelegate {
    cell_id: CellId,
    data_engine: Arc<dyn DataEngine>,
    cell: Mutex<CellDescriptor>,
    pending_cmds: Mutex<HashMap<Uuid, Proposal>>,
    pending_change_peer: Mutex<Option<Proposal>>,
    /// At most one `apply_committed_entries` job in flight at a time.
    applying: AtomicBool,
}

impl ApplyDelegate {
    pub fn new(cell_id: CellId, data_engine: Arc<dyn DataEngine>, cell: CellDescriptor) -> Self {
        Self {
            cell_id,
            data_engine,
            cell: Mutex::new(cell),
            pending_cmds: Mutex::new(HashMap::new()),
            pending_change_peer: Mutex::new(None),
            applying: AtomicBool::new(false),
        }
    }

    pub fn cell(&self) -> CellDescriptor {
        self.cell.lock().clone()
    }

    pub fn set_cell(&self, cell: CellDescriptor) {
        *self.cell.lock() = cell;
    }

    /// Registers a normal write's pending proposal.
    pub fn append_pending_cmd(&self, term: u64, id: Uuid, replier: oneshot::Sender<CmdResponse>) {
        self.pending_cmds.lock().insert(id, Proposal { id, term, replier });
    }

    /// Installs a pending change-peer proposal. At most one at a time —
    /// a second call supersedes the first, which is notified stale.
    pub fn set_pending_change_peer(&self, term: u64, id: Uuid, replier: oneshot::Sender<CmdResponse>) {
        let mut slot = self.pending_change_peer.lock();
        if let Some(old) = slot.take() {
            let _ = old.replier.send(CmdResponse::Stale);
        }
        *slot = Some(Proposal { id, term, replier });
    }

    /// Drops any pending proposals without resolving them — used when the
    /// cell is destroyed and in-flight work is cancelled rather than
    /// answered.
    pub fn discard_pending(&self) {
        self.pending_cmds.lock().clear();
        *self.pending_change_peer.lock() = None;
    }

    fn resolve(&self, id: Uuid, term: u64, ok: CmdResponse) {
        if let Some(p) = self.pending_cmds.lock().remove(&id) {
            let _ = p.replier.send(if p.term == term { ok } else { CmdResponse::Stale });
            return;
        }
        let mut slot = self.pending_change_peer.lock();
        if slot.as_ref().is_some_and(|p| p.id == id) {
            let p = slot.take().unwrap();
            let _ = p.replier.send(if p.term == term { ok } else { CmdResponse::Stale });
        }
    }

    /// Applies one committed batch. Fatal on any engine or decode failure —
    /// apply-path corruption is treated the same as the ready-loop's
    /// persistence failures.
    pub fn apply_committed_entries(self: &Arc<Self>, term: u64, entries: Vec<Entry>) -> AsyncApplyResult {
        if self.applying.swap(true, Ordering::AcqRel) {
            fatal(format!(
                "cell {}: overlapping apply jobs",
                self.cell_id
            ));
        }

        let mut metrics = ApplyMetrics::default();
        let mut exec_result = None;
        let mut applied_index = 0;

        for entry in &entries {
            applied_index = entry.index;
            let outcome = match entry.get_entry_type() {
                EntryType::EntryNormal => self.apply_normal(entry, term, &mut metrics),
                EntryType::EntryConfChange | EntryType::EntryConfChangeV2 => {
                    self.apply_conf_change(entry, term)
                }
            };
            match outcome {
                Ok(Some(result)) => exec_result = Some(result),
                Ok(None) => {}
                Err(e) => fatal(format!("cell {} apply failure at index {}: {e}", self.cell_id, entry.index)),
            }
        }

        self.applying.store(false, Ordering::Release);
        AsyncApplyResult {
            cell_id: self.cell_id,
            applied_index,
            applied_index_term: term,
            metrics,
            exec_result,
        }
    }

    fn apply_normal(&self, entry: &Entry, term: u64, metrics: &mut ApplyMetrics) -> Result<Option<ExecResult>> {
        // `raft` emits an empty no-op entry on every new leader's first term;
        // nothing to decode or resolve.
        if entry.get_data().is_empty() {
            return Ok(None);
        }
        let id = ProposalContext::decode(entry.get_context()).ok().map(|c| c.id);
        let command: Command = serde_cbor::from_slice(entry.get_data())
            .map_err(|e| Error::Corrupt(format!("malformed command: {e}")))?;

        let result = match command {
            Command::Put { key, value } => {
                metrics.written_bytes += (key.len() + value.len()) as u64;
                metrics.written_keys += 1;
                self.data_engine.put(&key, &value)?;
                None
            }
            Command::Delete { key } => {
                metrics.delete_keys_hint += 1;
                self.data_engine.delete(&key)?;
                None
            }
            Command::Admin(AdminRequest::CompactLog { compact_index }) => {
                Some(ExecResult::CompactLog { first_index_kept: compact_index + 1 })
            }
            Command::Admin(AdminRequest::Split { split_key, new_cell_id, new_peer_ids }) => {
                Some(self.apply_split(split_key, new_cell_id, new_peer_ids))
            }
        };

        if let Some(id) = id {
            self.resolve(id, term, CmdResponse::Success);
        }
        Ok(result)
    }

    /// Splits the current cell at `split_key`: `left` keeps this cell's id
    /// and the current peer set, `right` takes `new_cell_id` and a fresh
    /// peer set on the same stores (PD allocates peer ids 1:1 with the
    /// existing store set; see `Store::do_ask_split`).
    fn apply_split(&self, split_key: Vec<u8>, new_cell_id: CellId, new_peer_ids: Vec<u64>) -> ExecResult {
        let mut cell = self.cell.lock();
        let mut left = cell.clone();
        left.end_key = split_key.clone();
        left.epoch.version += 1;

        let mut right = cell.clone();
        right.id = new_cell_id;
        right.start_key = split_key;
        right.epoch.version += 1;
        right.peers = cell
            .peers
            .iter()
            .zip(new_peer_ids.iter())
            .map(|(p, &id)| PeerMeta { id, store_id: p.store_id })
            .collect();

        *cell = left.clone();
        ExecResult::Split { left, right }
    }

    fn apply_conf_change(&self, entry: &Entry, term: u64) -> Result<Option<ExecResult>> {
        let ctx = ProposalContext::decode(entry.get_context())?;
        let cc = decode_conf_change_v2(entry.get_data())?;
        let outcome = self.mutate_peer_set(&cc, ctx.change_peer.as_ref(), cc.clone());
        if let Some(outcome) = &outcome {
            log::info!(
                "cell {} applied conf change: {:?} peer {}",
                self.cell_id,
                outcome.change_type,
                outcome.changed_peer.id
            );
        }
        self.resolve(ctx.id, term, CmdResponse::Success);
        Ok(outcome.map(ExecResult::ConfChange))
    }

    /// `node_id == 0` in every change of `cc` signals the raft layer applied
    /// an empty/rejected conf change; returns `None` so the caller treats it
    /// as a no-op.
    fn mutate_peer_set(
        &self,
        cc: &ConfChangeV2,
        request: Option<&ChangePeerRequest>,
        raw_cc: ConfChangeV2,
    ) -> Option<ConfChangeOutcome> {
        let change = cc.get_changes().first()?;
        if change.node_id == 0 {
            return Some(ConfChangeOutcome {
                cell: self.cell.lock().clone(),
                change_type: ConfChangeKind::AddNode,
                changed_peer: PeerMeta { id: 0, store_id: 0 },
                cc: raw_cc,
            });
        }
        let mut cell = self.cell.lock();
        let change_type = match change.get_change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => ConfChangeKind::AddNode,
            ConfChangeType::RemoveNode => ConfChangeKind::RemoveNode,
        };
        let changed_peer = match (change_type, request) {
            (ConfChangeKind::AddNode, Some(req)) => {
                cell.peers.push(req.peer);
                req.peer
            }
            (ConfChangeKind::RemoveNode, _) => {
                let peer = cell.peer(change.node_id).copied();
                cell.peers.retain(|p| p.id != change.node_id);
                peer?
            }
            (ConfChangeKind::AddNode, None) => return None,
        };
        cell.epoch.conf_version += 1;
        Some(ConfChangeOutcome { cell: cell.clone(), change_type, changed_peer, cc: raw_cc })
    }
}

fn decode_conf_change_v2(bytes: &[u8]) -> Result<ConfChangeV2> {
    use prost::Message;
    ConfChangeV2::decode(bytes).map_err(|e| Error::Corrupt(format!("malformed conf change: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::SledDataEngine;
    use raft::eraftpb::ConfChangeSingle;

    fn descriptor(id: CellId, peers: &[(u64, u64)]) -> CellDescriptor {
        CellDescriptor {
            id,
            start_key: vec![],
            end_key: vec![],
            epoch: Default::default(),
            peers: peers.iter().map(|&(pid, sid)| PeerMeta { id: pid, store_id: sid }).collect(),
        }
    }

    fn delegate() -> Arc<ApplyDelegate> {
        let data = Arc::new(SledDataEngine::open_temporary().unwrap());
        Arc::new(ApplyDelegate::new(1, data, descriptor(1, &[(1, 1)])))
    }

    fn normal_entry(index: u64, id: Uuid, command: &Command) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = 1;
        e.set_entry_type(EntryType::EntryNormal);
        e.data = serde_cbor::to_vec(command).unwrap();
        e.context = ProposalContext { id, change_peer: None }.encode();
        e
    }

    #[test]
    fn apply_put_and_delete_resolves_pending_proposal() {
        let delegate = delegate();
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        delegate.append_pending_cmd(1, id, tx);

        let entry = normal_entry(1, id, &Command::Put { key: b"a".to_vec(), value: b"1".to_vec() });
        let result = delegate.apply_committed_entries(1, vec![entry]);
        assert_eq!(result.applied_index, 1);
        assert_eq!(result.metrics.written_keys, 1);
        assert_eq!(rx.try_recv().unwrap(), CmdResponse::Success);
    }

    #[test]
    fn stale_term_resolves_as_stale() {
        let delegate = delegate();
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        delegate.append_pending_cmd(1, id, tx); // registered at term 1

        let entry = normal_entry(1, id, &Command::Delete { key: b"a".to_vec() });
        delegate.apply_committed_entries(2, vec![entry]); // applied at term 2
        assert_eq!(rx.try_recv().unwrap(), CmdResponse::Stale);
    }

    #[test]
    fn split_produces_disjoint_halves_with_remapped_peers() {
        let delegate = delegate();
        let id = Uuid::new_v4();
        let (_tx, _rx) = oneshot::channel();
        let command = Command::Admin(AdminRequest::Split {
            split_key: b"m".to_vec(),
            new_cell_id: 2,
            new_peer_ids: vec![10],
        });
        let entry = normal_entry(1, id, &command);
        let result = delegate.apply_committed_entries(1, vec![entry]);
        match result.exec_result {
            Some(ExecResult::Split { left, right }) => {
                assert_eq!(left.end_key, b"m");
                assert_eq!(right.start_key, b"m");
                assert_eq!(right.id, 2);
                assert_eq!(right.peers[0].id, 10);
                assert_eq!(right.peers[0].store_id, 1);
            }
            other => panic!("expected split exec result, got {other:?}"),
        }
    }

    impl std::fmt::Debug for ExecResult {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                ExecResult::ConfChange(o) => write!(f, "ConfChange({:?})", o.change_type),
                ExecResult::Split { .. } => write!(f, "Split"),
                ExecResult::CompactLog { first_index_kept } => write!(f, "CompactLog({first_index_kept})"),
            }
        }
    }

    #[test]
    #[should_panic]
    fn overlapping_apply_jobs_abort() {
        // Simulates a second apply job landing while the guard is still held
        // from a (pretend) in-flight one. `fatal` panics instead of aborting
        // in test builds, so `#[should_panic]` can observe this without
        // taking down the whole test binary.
        let delegate = delegate();
        delegate.applying.store(true, Ordering::SeqCst);
        let entry = normal_entry(1, Uuid::new_v4(), &Command::Delete { key: b"a".to_vec() });
        delegate.apply_committed_entries(1, vec![entry]);
    }

    #[test]
    fn conf_change_add_node_updates_peer_set() {
        let delegate = delegate();
        let mut cc = ConfChangeV2::default();
        let mut single = ConfChangeSingle::default();
        single.set_change_type(ConfChangeType::AddNode);
        single.node_id = 2;
        cc.mut_changes().push(single);

        let id = Uuid::new_v4();
        let mut entry = Entry::default();
        entry.index = 1;
        entry.term = 1;
        entry.set_entry_type(EntryType::EntryConfChangeV2);
        {
            use prost::Message;
            let mut buf = Vec::new();
            cc.encode(&mut buf).unwrap();
            entry.data = buf;
        }
        entry.context = ProposalContext {
            id,
            change_peer: Some(ChangePeerRequest { peer: PeerMeta { id: 2, store_id: 2 }, change_type: ConfChangeKind::AddNode }),
        }
        .encode();

        let result = delegate.apply_committed_entries(1, vec![entry]);
        match result.exec_result {
            Some(ExecResult::ConfChange(outcome)) => {
                assert_eq!(outcome.changed_peer.id, 2);
                assert_eq!(outcome.cell.peers.len(), 2);
            }
            other => panic!("expected conf change exec result, got {other:?}"),
        }
    }
}
