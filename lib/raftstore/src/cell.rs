use raft::eraftpb::ConfState;
use serde::{Deserialize, Serialize};

pub type CellId = u64;
pub type PeerId = u64;
pub type StoreId = u64;

/// `(version, conf_version)` — monotonic counters identifying a cell's shape
/// and membership generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Epoch {
    pub version: u64,
    pub conf_version: u64,
}

/// One replica of a cell, identified by `(store_id, peer_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMeta {
    pub id: PeerId,
    pub store_id: StoreId,
}

/// A contiguous key range and the replica set that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellDescriptor {
    pub id: CellId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub epoch: Epoch,
    pub peers: Vec<PeerMeta>,
}

impl CellDescriptor {
    /// A cell is initialized iff its peer set is non-empty.
    pub fn is_initialized(&self) -> bool {
        !self.peers.is_empty()
    }

    pub fn conf_state(&self) -> ConfState {
        let mut cs = ConfState::default();
        cs.voters = self.peers.iter().map(|p| p.id).collect();
        cs
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    pub fn peer(&self, peer_id: PeerId) -> Option<&PeerMeta> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    pub fn peer_on_store(&self, store_id: StoreId) -> Option<&PeerMeta> {
        self.peers.iter().find(|p| p.store_id == store_id)
    }
}
