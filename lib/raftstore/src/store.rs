//! [`Store`]: the process-wide owner of the per-cell map, shared caches, and
//! the PD client. Demultiplexes `PeerNotification`s produced
//! by every `PeerReplicate` on this store into mutations of the three
//! store-wide indexes (`replicates_map`, `peer_cache`, `key_ranges`), and
//! creates/destroys `PeerReplicate`s in response to split and self-removal.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use engine::{DataEngine, MetaEngine};
use parking_lot::{Mutex as PLMutex, RwLock};
use raft::eraftpb::Message;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::apply::{AdminRequest, ChangePeerRequest, Command, ConfChangeKind, ExecResult};
use crate::cell::{CellDescriptor, CellId, Epoch, PeerId, PeerMeta, StoreId};
use crate::errors::{fatal, Error, Result};
use crate::pd::PdClient;
use crate::peer::{PeerLocator, PeerNotification, PeerReplicate};
use crate::peer_storage::PeerStorage;
use crate::read_queue::ReadCmdResult;
use crate::transport::Transport;
use crate::worker::ApplyScheduler;

/// Everything a freshly spawned `PeerReplicate` needs that the `Store` owns
/// in common, bundled so `Store::new` doesn't take ten constructor args.
pub struct StoreConfig {
    pub store_id: StoreId,
    pub raft_base_config: raft::Config,
    pub logger: slog::Logger,
    pub meta_engine: Arc<dyn MetaEngine>,
    pub data_engine: Arc<dyn DataEngine>,
    pub apply_scheduler: Arc<dyn ApplyScheduler>,
    pub snapshot_scheduler: Arc<dyn crate::peer_storage::SnapshotScheduler>,
    pub transport: Arc<dyn Transport>,
    pub pd_client: Arc<dyn PdClient>,
}

pub struct Store {
    store_id: StoreId,
    raft_base_config: raft::Config,
    logger: slog::Logger,
    meta_engine: Arc<dyn MetaEngine>,
    data_engine: Arc<dyn DataEngine>,
    apply_scheduler: Arc<dyn ApplyScheduler>,
    snapshot_scheduler: Arc<dyn crate::peer_storage::SnapshotScheduler>,
    transport: Arc<dyn Transport>,
    pd_client: Arc<dyn PdClient>,

    replicates: RwLock<HashMap<CellId, Arc<PeerReplicate>>>,
    /// `peer_id -> (store_id)` cache consulted by every raft worker to route
    /// outbound messages; the address resolution itself is the transport's
    /// concern.
    peer_cache: RwLock<HashMap<PeerId, PeerMeta>>,
    /// Keyed by each initialized cell's `start_key`; a cell's end is
    /// implicit — either the next entry's start or unbounded. A sorted map
    /// gives O(log n) predecessor lookup, which is all an interval index
    /// needs for non-overlapping contiguous ranges.
    key_ranges: RwLock<BTreeMap<Vec<u8>, CellId>>,

    notify_tx: UnboundedSender<PeerNotification>,
    notify_rx: PLMutex<UnboundedReceiver<PeerNotification>>,
}

impl Store {
    pub fn new(cfg: StoreConfig) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store_id: cfg.store_id,
            raft_base_config: cfg.raft_base_config,
            logger: cfg.logger,
            meta_engine: cfg.meta_engine,
            data_engine: cfg.data_engine,
            apply_scheduler: cfg.apply_scheduler,
            snapshot_scheduler: cfg.snapshot_scheduler,
            transport: cfg.transport,
            pd_client: cfg.pd_client,
            replicates: RwLock::new(HashMap::new()),
            peer_cache: RwLock::new(HashMap::new()),
            key_ranges: RwLock::new(BTreeMap::new()),
            notify_tx,
            notify_rx: PLMutex::new(notify_rx),
        })
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn get(&self, cell_id: CellId) -> Option<Arc<PeerReplicate>> {
        self.replicates.read().get(&cell_id).cloned()
    }

    pub fn cell_count(&self) -> usize {
        self.replicates.read().len()
    }

    // ---- peer lifecycle ------------------------------------------------

    fn spawn_peer(self: &Arc<Self>, storage: PeerStorage, cell_id: CellId, peer_id: PeerId) -> Result<Arc<PeerReplicate>> {
        let mut cfg = self.raft_base_config.clone();
        cfg.id = peer_id;
        let locator: Arc<dyn PeerLocator> = self.clone();
        let pr = PeerReplicate::new(
            cfg,
            self.store_id,
            peer_id,
            storage,
            self.data_engine.clone(),
            self.apply_scheduler.clone(),
            self.snapshot_scheduler.clone(),
            self.transport.clone(),
            locator,
            self.notify_tx.clone(),
            &self.logger,
        )?;
        let pr = Arc::new(pr);
        self.replicates.write().insert(cell_id, pr.clone());
        Ok(pr)
    }

    /// Creates the first peer of an already-initialized cell — either this
    /// store's share of a brand-new deployment, or the right half of a
    /// split handled on this store. Seeds
    /// `RAFT_INIT_LOG_INDEX`/`TERM` so no snapshot transfer is needed.
    pub fn bootstrap_cell(self: &Arc<Self>, cell: CellDescriptor, peer_id: PeerId) -> Result<Arc<PeerReplicate>> {
        debug_assert!(cell.is_initialized());
        let cell_id = cell.id;
        let storage = PeerStorage::bootstrap(
            self.meta_engine.clone(),
            self.data_engine.clone(),
            self.snapshot_scheduler.clone(),
            cell_id,
            peer_id,
            cell.clone(),
        )?;
        let pr = self.spawn_peer(storage, cell_id, peer_id)?;
        self.insert_range(&cell);
        for peer in &cell.peers {
            self.peer_cache.write().insert(peer.id, *peer);
        }
        Ok(pr)
    }

    /// Creates a fresh, uninitialized peer on first contact for a cell id
    /// this store has never heard of.
    fn create_uninitialized_peer(self: &Arc<Self>, cell_id: CellId, peer_id: PeerId) -> Result<Arc<PeerReplicate>> {
        let empty_cell = CellDescriptor {
            id: cell_id,
            start_key: Vec::new(),
            end_key: Vec::new(),
            epoch: Epoch::default(),
            peers: Vec::new(),
        };
        let storage = PeerStorage::new(
            self.meta_engine.clone(),
            self.data_engine.clone(),
            self.snapshot_scheduler.clone(),
            cell_id,
            peer_id,
            empty_cell,
        )?;
        self.spawn_peer(storage, cell_id, peer_id)
    }

    /// Removes a self-removed peer: unregisters it from `replicates_map`,
    /// drops its key range (if it had one), and persists a tombstone. Any
    /// apply/snapshot jobs already dispatched for it are discarded untouched
    /// when their result channel's receiver — owned by the now-dropped
    /// `PeerReplicate` — goes away.
    ///
    /// `prior_cell` is the descriptor as it stood *before* the confchange
    /// that triggered this removal was installed — the post-removal
    /// descriptor always has an empty peer set, which would make
    /// `is_initialized()` false and hide a key range that genuinely needs
    /// cleaning up (invariant I3).
    fn destroy_peer(&self, cell_id: CellId, prior_cell: &CellDescriptor) {
        let Some(pr) = self.replicates.write().remove(&cell_id) else {
            return;
        };
        if prior_cell.is_initialized() {
            let mut ranges = self.key_ranges.write();
            match ranges.get(&prior_cell.start_key) {
                Some(&id) if id == cell_id => {
                    ranges.remove(&prior_cell.start_key);
                }
                _ => log::warn!("cell {cell_id}: no matching key range to remove on destroy"),
            }
        }
        if let Err(e) = pr.mark_tombstone() {
            log::error!("cell {cell_id}: failed to persist tombstone state: {e}");
        }
        log::info!("cell {cell_id} destroyed (self removed)");
    }

    // ---- routing ---------------------------------------------------------

    /// Steps an inbound raft message, lazily creating an uninitialized peer
    /// if this is the first message this store has seen for `cell_id`.
    pub fn step(self: &Arc<Self>, cell_id: CellId, msg: Message) -> Result<()> {
        let pr = match self.get(cell_id) {
            Some(pr) => pr,
            None => self.create_uninitialized_peer(cell_id, msg.to)?,
        };
        pr.step(msg)
    }

    pub fn propose(&self, cell_id: CellId, command: Command) -> Result<oneshot::Receiver<crate::apply::CmdResponse>> {
        self.get(cell_id).map(|pr| pr.propose(command)).ok_or(Error::CellNotFound(cell_id))
    }

    pub fn propose_conf_change(
        &self,
        cell_id: CellId,
        change: ChangePeerRequest,
        cc: raft::eraftpb::ConfChangeV2,
    ) -> Result<oneshot::Receiver<crate::apply::CmdResponse>> {
        self.get(cell_id)
            .map(|pr| pr.propose_conf_change(change, cc))
            .ok_or(Error::CellNotFound(cell_id))
    }

    pub fn propose_read(&self, cell_id: CellId, key: Vec<u8>) -> Result<oneshot::Receiver<ReadCmdResult>> {
        self.get(cell_id).map(|pr| pr.propose_read(key)).ok_or(Error::CellNotFound(cell_id))
    }

    // ---- per-tick driving --------------------------------------------------

    /// Drives one round: every cell processes its ready batch, then every
    /// notification queued as a side effect of that processing is drained
    /// and dispatched. Cadence is externally controlled, same as
    /// `PeerReplicate::on_tick`.
    pub fn on_tick(self: &Arc<Self>) {
        let peers: Vec<Arc<PeerReplicate>> = self.replicates.read().values().cloned().collect();
        for pr in peers {
            pr.on_tick();
        }
        self.drain_notifications();
    }

    /// Leader-only split-size scan, run at a coarser cadence than `on_tick`
    /// by the caller.
    pub fn run_split_checks(&self) {
        let peers: Vec<Arc<PeerReplicate>> = self.replicates.read().values().cloned().collect();
        for pr in peers {
            pr.check_split();
        }
    }

    fn drain_notifications(self: &Arc<Self>) {
        loop {
            let notification = self.notify_rx.lock().try_recv();
            match notification {
                Ok(n) => self.handle_notification(n),
                Err(_) => break,
            }
        }
    }

    fn handle_notification(self: &Arc<Self>, notification: PeerNotification) {
        match notification {
            PeerNotification::AskSplit { cell_id, split_key, epoch } => self.do_ask_split(cell_id, split_key, epoch),
            PeerNotification::ApplyResult { cell_id, exec_result } => self.post_apply_result(cell_id, exec_result),
            PeerNotification::SnapshotApplied { cell_id, prev_cell, cell } => {
                self.update_key_range(cell_id, prev_cell, cell)
            }
        }
    }

    // ---- split check → ask_split → propose --------------------------------

    fn do_ask_split(&self, cell_id: CellId, split_key: Vec<u8>, epoch: Epoch) {
        let Some(pr) = self.get(cell_id) else { return };
        let cell = pr.cell();
        if cell.epoch != epoch {
            log::debug!("cell {cell_id}: epoch advanced since split-check fired, dropping stale ask_split");
            return;
        }
        let response = match self.pd_client.ask_split(&cell) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("cell {cell_id}: ask_split failed: {e}");
                return;
            }
        };
        let command = Command::Admin(AdminRequest::Split {
            split_key,
            new_cell_id: response.new_cell_id,
            new_peer_ids: response.new_peer_ids,
        });
        let _ = pr.propose(command);
    }

    // ---- post_apply_result ---------------------------------

    fn post_apply_result(self: &Arc<Self>, cell_id: CellId, exec_result: ExecResult) {
        match exec_result {
            ExecResult::ConfChange(outcome) => self.apply_conf_change_result(cell_id, outcome),
            ExecResult::Split { left, right } => self.apply_split_result(cell_id, left, right),
            ExecResult::CompactLog { .. } => {
                fatal(format!("cell {cell_id}: CompactLog must be handled locally, never routed to Store"))
            }
        }
    }

    fn apply_conf_change_result(&self, cell_id: CellId, outcome: crate::apply::ConfChangeOutcome) {
        let Some(pr) = self.get(cell_id) else {
            fatal(format!("cell {cell_id}: conf change applied but no PeerReplicate registered"))
        };
        if let Err(e) = pr.apply_conf_change(&outcome.cc) {
            fatal(format!("{e}"));
        }
        if outcome.changed_peer.id == 0 {
            // The raft layer rejected the change at apply time; nothing to
            // install or cache.
            return;
        }
        let prior_cell = pr.cell();
        pr.install_cell(outcome.cell.clone());
        if pr.is_leader() {
            let leader = PeerMeta { id: pr.peer_id(), store_id: self.store_id };
            if let Err(e) = self.pd_client.heartbeat(&outcome.cell, leader) {
                log::warn!("cell {cell_id}: post-confchange heartbeat failed: {e}");
            }
        }
        match outcome.change_type {
            ConfChangeKind::AddNode => {
                self.peer_cache.write().insert(outcome.changed_peer.id, outcome.changed_peer);
            }
            ConfChangeKind::RemoveNode => {
                self.peer_cache.write().remove(&outcome.changed_peer.id);
                if outcome.changed_peer.store_id == self.store_id {
                    if outcome.changed_peer.id == pr.peer_id() {
                        self.destroy_peer(cell_id, &prior_cell);
                    } else {
                        fatal(format!(
                            "cell {cell_id}: remove-node names peer {} on this store, but the local peer is {}",
                            outcome.changed_peer.id,
                            pr.peer_id()
                        ));
                    }
                }
            }
        }
    }

    fn apply_split_result(self: &Arc<Self>, cell_id: CellId, left: CellDescriptor, right: CellDescriptor) {
        let Some(pr) = self.get(cell_id) else {
            fatal(format!("cell {cell_id}: split applied but no PeerReplicate registered"))
        };
        pr.install_cell(left.clone());

        for peer in &right.peers {
            self.peer_cache.write().insert(peer.id, *peer);
        }

        if let Some(existing) = self.get(right.id) {
            if existing.is_initialized() {
                fatal(format!("cell {}: duplicate initialized cell on split", right.id));
            }
        }

        match right.peer_on_store(self.store_id) {
            Some(local_peer) => {
                let local_peer_id = local_peer.id;
                let storage = PeerStorage::bootstrap(
                    self.meta_engine.clone(),
                    self.data_engine.clone(),
                    self.snapshot_scheduler.clone(),
                    right.id,
                    local_peer_id,
                    right.clone(),
                );
                match storage.and_then(|s| self.spawn_peer(s, right.id, local_peer_id)) {
                    Ok(_) => {}
                    Err(e) => fatal(format!("cell {}: failed to create right half of split: {e}", right.id)),
                }
            }
            None => {
                log::warn!("store {}: no peer on the right half of split cell {}", self.store_id, right.id);
            }
        }

        // `left`'s entry at its (unchanged) start_key already points at
        // `cell_id`; only the new `right` entry needs inserting.
        self.insert_range(&right);

        if pr.is_leader() {
            let local = PeerMeta { id: pr.peer_id(), store_id: self.store_id };
            if let Err(e) = self.pd_client.heartbeat(&left, local) {
                log::warn!("cell {cell_id}: post-split heartbeat (left) failed: {e}");
            }
            if let Some(right_local) = right.peer_on_store(self.store_id) {
                if let Err(e) = self.pd_client.heartbeat(&right, *right_local) {
                    log::warn!("cell {}: post-split heartbeat (right) failed: {e}", right.id);
                }
            }
            // A report-split job to PD would be enqueued here in a full
            // deployment; only the leader logs it, never unconditionally.
            log::info!("cell {cell_id} split into {cell_id} and {}; report-split job enqueued", right.id);
        }
    }

    // ---- key_ranges maintenance -----------

    fn update_key_range(&self, cell_id: CellId, prev: Option<CellDescriptor>, cell: CellDescriptor) {
        debug_assert_eq!(cell_id, cell.id);
        if let Some(prev) = prev {
            if prev.is_initialized() {
                let mut ranges = self.key_ranges.write();
                match ranges.get(&prev.start_key) {
                    Some(&id) if id == prev.id => {
                        ranges.remove(&prev.start_key);
                    }
                    _ => fatal(format!(
                        "cell {}: expected a registered key range at {:?} before snapshot apply",
                        prev.id, prev.start_key
                    )),
                }
            }
        }
        self.insert_range(&cell);
        for peer in &cell.peers {
            self.peer_cache.write().insert(peer.id, *peer);
        }
    }

    fn insert_range(&self, cell: &CellDescriptor) {
        let mut ranges = self.key_ranges.write();
        if let Some(existing) = ranges.insert(cell.start_key.clone(), cell.id) {
            if existing != cell.id {
                fatal(format!(
                    "overlapping key range insert at {:?}: existing cell {existing}, new cell {} (bug)",
                    cell.start_key, cell.id
                ));
            }
        }
    }

    /// Looks up which cell currently owns `key`, per the key_ranges index —
    /// used by the out-of-scope command-dispatch front-end to route a
    /// client request to the right `PeerReplicate`.
    pub fn cell_for_key(&self, key: &[u8]) -> Option<CellId> {
        self.key_ranges
            .read()
            .range(..=key.to_vec())
            .next_back()
            .map(|(_, &cell_id)| cell_id)
    }
}

impl PeerLocator for Store {
    fn locate(&self, peer_id: PeerId) -> Option<PeerMeta> {
        self.peer_cache.read().get(&peer_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pd::LocalPdClient;
    use crate::transport::ChannelTransport;
    use crate::worker::WorkerPool;
    use engine::{SledDataEngine, SledMetaEngine};

    fn test_store(store_id: StoreId) -> Arc<Store> {
        let pool = Arc::new(WorkerPool::new("test", 1).unwrap());
        let cfg = StoreConfig {
            store_id,
            raft_base_config: raft::Config { election_tick: 10, heartbeat_tick: 2, ..Default::default() },
            logger: slog::Logger::root(slog_stdlog::StdLog.fuse(), slog::o!()),
            meta_engine: Arc::new(SledMetaEngine::open_temporary().unwrap()),
            data_engine: Arc::new(SledDataEngine::open_temporary().unwrap()),
            apply_scheduler: pool.clone(),
            snapshot_scheduler: pool,
            transport: ChannelTransport::new(),
            pd_client: Arc::new(LocalPdClient::new(1000)),
        };
        Store::new(cfg)
    }

    fn single_peer_cell(cell_id: CellId, peer_id: PeerId, store_id: StoreId) -> CellDescriptor {
        CellDescriptor {
            id: cell_id,
            start_key: vec![],
            end_key: vec![],
            epoch: Epoch::default(),
            peers: vec![PeerMeta { id: peer_id, store_id }],
        }
    }

    #[test]
    fn bootstrap_registers_cell_in_every_index() {
        let store = test_store(1);
        let cell = single_peer_cell(1, 1, 1);
        store.bootstrap_cell(cell, 1).unwrap();

        assert_eq!(store.cell_count(), 1);
        assert_eq!(store.cell_for_key(b"anything"), Some(1));
        assert_eq!(store.locate(1), Some(PeerMeta { id: 1, store_id: 1 }));
    }

    #[test]
    fn propose_against_unknown_cell_is_cell_not_found() {
        let store = test_store(1);
        let err = store.propose(99, Command::Put { key: b"a".to_vec(), value: b"b".to_vec() }).unwrap_err();
        assert!(matches!(err, Error::CellNotFound(99)));
    }

    #[test]
    fn step_creates_uninitialized_peer_for_unknown_cell() {
        let store = test_store(1);
        let mut msg = Message::default();
        msg.to = 7;
        store.step(42, msg).unwrap();
        assert!(store.get(42).is_some());
        assert!(!store.get(42).unwrap().is_initialized());
    }

    /// Scenario 4: applying a confchange that removes this store's own peer
    /// tears the cell down — unregistered from `replicates_map`, its peer
    /// dropped from `peer_cache`, its range dropped from `key_ranges`.
    #[test]
    fn self_remove_confchange_destroys_the_cell() {
        use crate::apply::ConfChangeOutcome;
        use raft::eraftpb::{ConfChangeSingle, ConfChangeType, ConfChangeV2};

        let store = test_store(1);
        let cell = single_peer_cell(5, 1, 1);
        store.bootstrap_cell(cell.clone(), 1).unwrap();
        assert_eq!(store.cell_for_key(b"x"), Some(5));

        let mut cc = ConfChangeV2::default();
        let mut single = ConfChangeSingle::default();
        single.set_change_type(ConfChangeType::RemoveNode);
        single.node_id = 1;
        cc.mut_changes().push(single);

        let mut new_cell = cell.clone();
        new_cell.peers.clear();
        new_cell.epoch.conf_version += 1;
        let outcome = ConfChangeOutcome {
            cell: new_cell,
            change_type: ConfChangeKind::RemoveNode,
            changed_peer: PeerMeta { id: 1, store_id: 1 },
            cc,
        };

        store.post_apply_result(5, ExecResult::ConfChange(outcome));

        assert!(store.get(5).is_none());
        assert_eq!(store.cell_for_key(b"x"), None);
        assert_eq!(store.locate(1), None);
    }

    #[test]
    fn split_result_registers_right_half_without_disturbing_left() {
        let store = test_store(1);
        let cell = single_peer_cell(1, 1, 1);
        store.bootstrap_cell(cell.clone(), 1).unwrap();

        let mut left = cell.clone();
        left.end_key = b"m".to_vec();
        left.epoch.version += 1;
        let right = CellDescriptor {
            id: 2,
            start_key: b"m".to_vec(),
            end_key: vec![],
            epoch: Epoch { version: left.epoch.version, conf_version: 0 },
            peers: vec![PeerMeta { id: 2, store_id: 1 }],
        };

        store.post_apply_result(1, ExecResult::Split { left, right });

        assert_eq!(store.cell_for_key(b"a"), Some(1));
        assert_eq!(store.cell_for_key(b"z"), Some(2));
        assert!(store.get(2).unwrap().is_initialized());
    }
}
