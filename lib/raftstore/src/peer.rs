//! [`PeerReplicate`]: the per-cell driver. Wraps a
//! `raft::RawNode<PeerStorage>`, routes proposals, drains ready batches in
//! the fixed nine-step order, and turns `AsyncApplyResult`s into local state
//! changes plus, where an exec-result is carried, a notification to the
//! owning `Store`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use engine::DataEngine;
use parking_lot::Mutex as PLMutex;
use raft::eraftpb::{ConfChangeV2, ConfState, Message};
use raft::{RawNode, StateRole};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::apply::{
    ApplyDelegate, AsyncApplyResult, ChangePeerRequest, Command, ExecResult, ProposalContext,
};
use crate::cell::{CellDescriptor, CellId, Epoch, PeerId, PeerMeta, StoreId};
use crate::errors::{fatal, Error, Result};
use crate::peer_storage::PeerStorage;
use crate::read_queue::{ReadCmd, ReadCmdResult, ReadIndexQueue};
use crate::worker::{ApplyScheduler, ApplyTask, InstallSnapTask};

/// Configurable split thresholds. Values match
/// the order of magnitude TiKV itself ships as defaults, scaled down for a
/// demo-sized data engine.
pub const CELL_SPLIT_SIZE: u64 = 64 * 1024 * 1024;
pub const CELL_MAX_SIZE: u64 = 80 * 1024 * 1024;

/// What a cell reports to the `Store` once it has observed something the
/// store-wide indexes need to react to.
pub enum PeerNotification {
    /// Split-check crossed `CELL_SPLIT_SIZE`; the store should `ask_split`
    /// and propose the resulting admin command.
    AskSplit { cell_id: CellId, split_key: Vec<u8>, epoch: Epoch },
    /// A committed admin command produced an exec result that mutates
    /// store-wide state. `CompactLog` is
    /// handled locally by `PeerReplicate` and never reaches this variant.
    ApplyResult { cell_id: CellId, exec_result: ExecResult },
    /// A received snapshot finished staging this tick; `Store` rebalances
    /// `key_ranges` and `peer_cache` from `prev_cell`/`cell`.
    SnapshotApplied { cell_id: CellId, prev_cell: Option<CellDescriptor>, cell: CellDescriptor },
}

/// Resolves a raft-internal peer id to its `(store_id, peer_id)` and
/// network address, so ready-state messages can be handed to the
/// transport. Backed by the `Store`'s `peer_cache` without giving
/// `PeerReplicate` a direct reference to `Store` — a narrow handle avoids
/// the cyclic `Arc<Store>` <-> `Arc<PeerReplicate>` reference that a direct
/// pointer back would create.
pub trait PeerLocator: Send + Sync {
    fn locate(&self, peer_id: PeerId) -> Option<PeerMeta>;
}

/// Outcome of applying a received snapshot locally: the range this store
/// owned before and after, handed to `Store::update_key_range`.
pub struct ApplySnapResult {
    pub prev_cell: Option<CellDescriptor>,
    pub cell: CellDescriptor,
}

pub struct PeerReplicate {
    cell_id: CellId,
    peer_id: PeerId,
    store_id: StoreId,

    raw_node: PLMutex<RawNode<PeerStorage>>,
    read_queue: ReadIndexQueue,

    data_engine: Arc<dyn DataEngine>,
    apply_delegate: Arc<ApplyDelegate>,
    apply_scheduler: Arc<dyn ApplyScheduler>,
    snapshot_scheduler: Arc<dyn crate::peer_storage::SnapshotScheduler>,
    transport: Arc<dyn crate::transport::Transport>,
    peer_locator: Arc<dyn PeerLocator>,

    apply_result_tx: UnboundedSender<AsyncApplyResult>,
    apply_result_rx: PLMutex<UnboundedReceiver<AsyncApplyResult>>,
    install_done_tx: UnboundedSender<CellId>,
    install_done_rx: PLMutex<UnboundedReceiver<CellId>>,

    notify_tx: UnboundedSender<PeerNotification>,

    is_applying_snapshot: AtomicBool,
    is_leader: AtomicBool,
    approx_size: AtomicU64,
}

impl PeerReplicate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: raft::Config,
        store_id: StoreId,
        peer_id: PeerId,
        storage: PeerStorage,
        data_engine: Arc<dyn DataEngine>,
        apply_scheduler: Arc<dyn ApplyScheduler>,
        snapshot_scheduler: Arc<dyn crate::peer_storage::SnapshotScheduler>,
        transport: Arc<dyn crate::transport::Transport>,
        peer_locator: Arc<dyn PeerLocator>,
        notify_tx: UnboundedSender<PeerNotification>,
        logger: &slog::Logger,
    ) -> Result<Self> {
        let cell_id = storage.cell_id();
        let cell = storage.cell();
        let raw_node = RawNode::new(&cfg, storage, logger).map_err(|e| Error::Corrupt(e.to_string()))?;
        let (apply_result_tx, apply_result_rx) = mpsc::unbounded_channel();
        let (install_done_tx, install_done_rx) = mpsc::unbounded_channel();
        Ok(Self {
            cell_id,
            peer_id,
            store_id,
            raw_node: PLMutex::new(raw_node),
            read_queue: ReadIndexQueue::new(),
            apply_delegate: Arc::new(ApplyDelegate::new(cell_id, data_engine.clone(), cell)),
            data_engine,
            apply_scheduler,
            snapshot_scheduler,
            transport,
            peer_locator,
            apply_result_tx,
            apply_result_rx: PLMutex::new(apply_result_rx),
            install_done_tx,
            install_done_rx: PLMutex::new(install_done_rx),
            notify_tx,
            is_applying_snapshot: AtomicBool::new(false),
            is_leader: AtomicBool::new(false),
            approx_size: AtomicU64::new(0),
        })
    }

    pub fn cell_id(&self) -> CellId {
        self.cell_id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn cell(&self) -> CellDescriptor {
        self.apply_delegate.cell()
    }

    pub fn is_initialized(&self) -> bool {
        self.raw_node.lock().store().is_initialized()
    }

    // ---- proposal submission ----------------------

    /// Proposes a normal write. Assumes the caller already confirmed this
    /// cell exists — `CellNotFound` is a `Store`-level concern raised before
    /// a `PeerReplicate` is looked up at all.
    pub fn propose(&self, command: Command) -> oneshot::Receiver<crate::apply::CmdResponse> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let mut node = self.raw_node.lock();
        let term = node.raft.term;
        self.apply_delegate.append_pending_cmd(term, id, tx);
        let ctx = ProposalContext { id, change_peer: None }.encode();
        let data = serde_cbor::to_vec(&command).expect("Command is always serializable");
        if node.propose(ctx, data).is_err() {
            // Not leader, or proposal dropped for some other raft-internal
            // reason: the proposal will never be applied, so fail it now
            // rather than leaving the caller waiting forever.
            self.apply_delegate.cancel(id, crate::apply::CmdResponse::Stale);
        }
        rx
    }

    /// Proposes a conf change. Overwrites (and fails stale) any
    /// previously pending change-peer proposal for this cell.
    pub fn propose_conf_change(
        &self,
        change: ChangePeerRequest,
        cc: ConfChangeV2,
    ) -> oneshot::Receiver<crate::apply::CmdResponse> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let mut node = self.raw_node.lock();
        let term = node.raft.term;
        self.apply_delegate.set_pending_change_peer(term, id, tx);
        let ctx = ProposalContext { id, change_peer: Some(change) }.encode();
        if node.propose_conf_change(ctx, cc).is_err() {
            self.apply_delegate.cancel(id, crate::apply::CmdResponse::Stale);
        }
        rx
    }

    /// Submits a linearizable read. Serviced once the matching read state
    /// comes back ready in a later ready batch.
    pub fn propose_read(&self, key: Vec<u8>) -> oneshot::Receiver<ReadCmdResult> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let request_ctx = id.as_bytes().to_vec();
        self.read_queue.push(ReadCmd { id, key, request_ctx: request_ctx.clone(), replier: tx });
        self.raw_node.lock().read_index(request_ctx);
        rx
    }

    /// Steps an inbound raft message into the node.
    pub fn step(&self, msg: Message) -> Result<()> {
        self.raw_node
            .lock()
            .step(msg)
            .map_err(|e| Error::Corrupt(format!("raft step failed: {e}")))
    }

    // ---- ready-state processing ------------------------------

    /// Runs one tick: drains any apply/install results queued since the last
    /// call, then processes a ready batch if one is pending. Cadence is
    /// externally driven (caller decides how often to call this) rather
    /// than owning a hidden internal timer.
    pub fn on_tick(&self) {
        self.drain_apply_results();
        self.drain_install_results();

        let mut node = self.raw_node.lock();
        if !node.has_ready() {
            node.tick();
            return;
        }
        let mut ready = node.ready();

        // Step 1: snapshot.
        if !ready.snapshot().get_data().is_empty() || ready.snapshot().get_metadata().index != 0 {
            if let Err(e) = node.store().append_snapshot(ready.snapshot()) {
                fatal(format!("cell {}: append_snapshot failed: {e}", self.cell_id));
            }
            self.is_applying_snapshot.store(true, Ordering::Release);
        }

        // Step 2: append entries.
        if !ready.entries().is_empty() {
            if let Err(e) = node.store().append_entries(ready.entries()) {
                fatal(format!("cell {}: append_entries failed: {e}", self.cell_id));
            }
        }

        // Step 3: persist raft state then apply state.
        if let Err(e) = node.store().persist() {
            fatal(format!("cell {}: persist failed: {e}", self.cell_id));
        }

        // Step 4: apply snapshot effects.
        let snap_result = self.do_apply_snap(&mut node);

        // Step 5: send messages.
        for msg in ready.take_messages() {
            self.dispatch(msg);
        }

        // Step 6: apply committed entries (suspended while snapshot-applying).
        let committed = ready.take_committed_entries();
        if !self.is_applying_snapshot.load(Ordering::Acquire) && !committed.is_empty() {
            let term = node.raft.term;
            self.apply_scheduler.schedule_apply(ApplyTask {
                delegate: self.apply_delegate.clone(),
                term,
                entries: committed,
                result_tx: self.apply_result_tx.clone(),
            });
        } else if !committed.is_empty() {
            log::warn!(
                "cell {} dropping {} committed entries while snapshot-applying",
                self.cell_id,
                committed.len()
            );
        }

        // Step 7: apply read states.
        for read_state in ready.read_states() {
            if node.store().applied_index_term() == node.raft.term {
                self.service_one_read(&read_state.request_ctx);
            } else {
                self.read_queue.incr_ready();
            }
        }

        // Step 8: soft-state change.
        if let Some(ss) = ready.ss() {
            let is_leader = ss.raft_state == StateRole::Leader;
            self.is_leader.store(is_leader, Ordering::Release);
            if !is_leader {
                self.drain_stale_reads();
            }
        }

        // Step 9: advance.
        let mut light_rd = node.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            node.store().set_commit(commit);
        }
        for msg in light_rd.take_messages() {
            self.dispatch(msg);
        }
        let light_committed = light_rd.take_committed_entries();
        if !self.is_applying_snapshot.load(Ordering::Acquire) && !light_committed.is_empty() {
            let term = node.raft.term;
            self.apply_scheduler.schedule_apply(ApplyTask {
                delegate: self.apply_delegate.clone(),
                term,
                entries: light_committed,
                result_tx: self.apply_result_tx.clone(),
            });
        }
        node.advance_apply();
        drop(node);

        if let Some(result) = snap_result {
            let _ = self.notify_tx.send(PeerNotification::SnapshotApplied {
                cell_id: self.cell_id,
                prev_cell: result.prev_cell.clone(),
                cell: result.cell.clone(),
            });
            let _ = self.snapshot_applied(result);
        }
    }

    fn dispatch(&self, msg: Message) {
        match self.peer_locator.locate(msg.to) {
            Some(to) => {
                if let Err(e) = self.transport.send(to, msg) {
                    log::warn!("cell {}: failed to send raft message: {e}", self.cell_id);
                }
            }
            None => log::warn!("cell {}: no known address for peer {}", self.cell_id, msg.to),
        }
    }

    /// Swaps persisted state into `PeerStorage`, and if a snapshot was
    /// staged this tick, clears stale out-of-range data and kicks off the
    /// async data-install job.
    fn do_apply_snap(&self, node: &mut RawNode<PeerStorage>) -> Option<ApplySnapResult> {
        let snap_data = node.store().snap_data.lock().clone()?;
        let snap_cell = snap_data.cell;
        let prev_cell = if node.store().is_initialized() { Some(node.store().cell()) } else { None };

        if let Some(prev) = &prev_cell {
            // TODO: the boundary between "expected leftover" and "corruption"
            // here is unclear — best-effort only.
            if let Err(e) = self.data_engine.delete_range(&prev.start_key, &prev.end_key) {
                log::warn!("cell {}: failed to clear pre-snapshot range: {e}", self.cell_id);
            }
        }

        self.snapshot_scheduler.schedule_install(InstallSnapTask {
            cell_id: self.cell_id,
            data_engine: self.data_engine.clone(),
            start_key: snap_cell.start_key.clone(),
            end_key: snap_cell.end_key.clone(),
            entries: snap_data.entries,
            done_tx: self.install_done_tx.clone(),
        });

        // PeerStorage's cell must reflect the snapshot in the same tick the
        // snapshot is applied — only the data-engine install itself (the
        // key/value rows) happens asynchronously.
        node.store().set_cell(snap_cell.clone());

        Some(ApplySnapResult { prev_cell, cell: snap_cell })
    }

    fn snapshot_applied(&self, result: ApplySnapResult) -> Result<()> {
        self.apply_delegate.set_cell(result.cell.clone());
        Ok(())
    }

    // ---- Store-facing mutators -------------------------------

    /// Hands a committed conf change back to the raft library so it folds it
    /// into voter/progress tracking, regardless of whether the apply layer
    /// resolved it to a real peer-set change or a no-op.
    pub fn apply_conf_change(&self, cc: &ConfChangeV2) -> Result<ConfState> {
        self.raw_node
            .lock()
            .apply_conf_change(cc)
            .map_err(|e| Error::Corrupt(format!("cell {}: apply_conf_change failed: {e}", self.cell_id)))
    }

    /// Installs a new cell descriptor into both the raft storage layer and
    /// the apply delegate's bookkeeping copy, keeping them in lockstep after
    /// a conf change or the `left` half of a split.
    pub fn install_cell(&self, cell: CellDescriptor) {
        self.raw_node.lock().store().set_cell(cell.clone());
        self.apply_delegate.set_cell(cell);
    }

    /// Marks this peer tombstoned in the meta engine ahead of removal from
    /// `Store::replicates_map`.
    pub fn mark_tombstone(&self) -> Result<()> {
        self.raw_node.lock().store().set_peer_lifecycle(crate::peer_storage::PeerLifecycle::Tombstone)
    }

    fn drain_install_results(&self) {
        let mut rx = self.install_done_rx.lock();
        while rx.try_recv().is_ok() {
            let cell = self.apply_delegate.cell();
            self.raw_node.lock().store().finish_apply_snap(cell).ok();
            self.is_applying_snapshot.store(false, Ordering::Release);
        }
    }

    fn service_one_read(&self, request_ctx: &[u8]) {
        match self.read_queue.pop() {
            Some(cmd) => {
                if cmd.request_ctx != request_ctx {
                    fatal(format!(
                        "cell {}: read-state uuid mismatch",
                        self.cell_id
                    ));
                }
                let value = self.data_engine.get(&cmd.key).unwrap_or(None);
                let _ = cmd.replier.send(ReadCmdResult::Done(value));
            }
            None => {
                fatal(format!("cell {}: read state with no pending read", self.cell_id));
            }
        }
    }

    fn drain_stale_reads(&self) {
        while let Some(cmd) = self.read_queue.pop() {
            let _ = cmd.replier.send(ReadCmdResult::Stale);
        }
        self.read_queue.reset_ready();
    }

    // ---- post_apply ------

    fn drain_apply_results(&self) {
        let mut rx = self.apply_result_rx.lock();
        while let Ok(result) = rx.try_recv() {
            self.post_apply(result);
        }
    }

    fn post_apply(&self, result: AsyncApplyResult) {
        if self.is_applying_snapshot.load(Ordering::Acquire) {
            fatal(format!(
                "cell {}: post_apply invoked while snapshot-applying",
                self.cell_id
            ));
        }

        self.raw_node.lock().store().set_applied(result.applied_index, result.applied_index_term);

        if matches!(result.exec_result, Some(ExecResult::Split { .. })) {
            self.approx_size.store(result.metrics.size_diff_hint.max(0) as u64, Ordering::Release);
        } else {
            self.approx_size.fetch_add(result.metrics.written_bytes, Ordering::AcqRel);
        }

        let ready = self.read_queue.get_ready();
        if ready > 0 && self.raw_node.lock().store().applied_index_term() == self.raw_node.lock().raft.term {
            for _ in 0..ready {
                match self.read_queue.pop() {
                    Some(cmd) => {
                        let value = self.data_engine.get(&cmd.key).unwrap_or(None);
                        let _ = cmd.replier.send(ReadCmdResult::Done(value));
                    }
                    None => break,
                }
            }
            self.read_queue.reset_ready();
        }

        match result.exec_result {
            Some(ExecResult::CompactLog { first_index_kept }) => {
                if let Err(e) = self.raw_node.lock().store().apply_compact(first_index_kept) {
                    fatal(format!("cell {}: log compaction failed: {e}", self.cell_id));
                }
            }
            Some(exec_result) => {
                let _ = self.notify_tx.send(PeerNotification::ApplyResult { cell_id: self.cell_id, exec_result });
            }
            None => {}
        }
    }

    // ---- split check --------------------------

    /// Leader-only, scheduled externally (see `on_tick` docs). Scans the
    /// cell's current range; aborts past `CELL_MAX_SIZE` without reporting
    /// (a future covering compaction/split elsewhere is expected to catch
    /// up), and proposes nothing itself — it only notifies the `Store`,
    /// which drives `do_ask_split` and proposes the resulting admin command.
    pub fn check_split(&self) {
        if !self.is_leader() {
            return;
        }
        let cell = self.apply_delegate.cell();
        let total = match self.data_engine.approximate_size(&cell.start_key, &cell.end_key) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("cell {}: split-check scan failed: {e}", self.cell_id);
                return;
            }
        };
        if total < CELL_SPLIT_SIZE {
            return;
        }
        if total >= CELL_MAX_SIZE {
            log::warn!(
                "cell {} exceeds CELL_MAX_SIZE ({} >= {}) before a split could be proposed",
                self.cell_id,
                total,
                CELL_MAX_SIZE
            );
            return;
        }
        let split_key = match self.find_split_key(&cell) {
            Some(k) => k,
            None => return,
        };
        let _ = self.notify_tx.send(PeerNotification::AskSplit {
            cell_id: self.cell_id,
            split_key,
            epoch: cell.epoch,
        });
    }

    /// The first key past `CELL_SPLIT_SIZE` bytes into the range, scanned in
    /// key order.
    fn find_split_key(&self, cell: &CellDescriptor) -> Option<Vec<u8>> {
        let entries = self.data_engine.scan_range(&cell.start_key, &cell.end_key).ok()?;
        let mut acc = 0u64;
        for (key, value) in entries {
            acc += (key.len() + value.len()) as u64;
            if acc >= CELL_SPLIT_SIZE {
                return Some(key);
            }
        }
        None
    }
}
