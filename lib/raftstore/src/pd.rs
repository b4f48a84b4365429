//! The placement driver (PD) client interface: an external coordinator that
//! allocates new cell/peer ids on split and receives heartbeats. This crate
//! only specifies the trait boundary and ships an in-memory test double, the
//! way a production deployment would stub out `ChannelService`'s local
//! stand-ins for what is otherwise a gRPC call.

use crate::cell::{CellDescriptor, CellId, PeerMeta};

#[derive(thiserror::Error, Debug)]
pub enum PdError {
    #[error("pd unreachable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, PdError>;

#[derive(Debug, Clone)]
pub struct AskSplitResponse {
    pub new_cell_id: CellId,
    pub new_peer_ids: Vec<u64>,
}

pub trait PdClient: Send + Sync {
    /// Allocates a new cell id and one peer id per existing store in the
    /// cell.
    fn ask_split(&self, cell: &CellDescriptor) -> Result<AskSplitResponse>;

    /// Reports a cell's current shape and leader to PD.
    fn heartbeat(&self, cell: &CellDescriptor, leader: PeerMeta) -> Result<()>;
}

/// An in-process PD stand-in for tests and the demo binary: allocates
/// monotonically increasing ids and records heartbeats for inspection
/// instead of sending them anywhere.
pub struct LocalPdClient {
    next_id: std::sync::atomic::AtomicU64,
    heartbeats: parking_lot::Mutex<Vec<(CellId, PeerMeta)>>,
}

impl LocalPdClient {
    pub fn new(first_free_id: u64) -> Self {
        Self {
            next_id: std::sync::atomic::AtomicU64::new(first_free_id),
            heartbeats: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub fn heartbeats(&self) -> Vec<(CellId, PeerMeta)> {
        self.heartbeats.lock().clone()
    }
}

impl PdClient for LocalPdClient {
    fn ask_split(&self, cell: &CellDescriptor) -> Result<AskSplitResponse> {
        let new_cell_id = self.alloc_id();
        let new_peer_ids = cell.peers.iter().map(|_| self.alloc_id()).collect();
        Ok(AskSplitResponse { new_cell_id, new_peer_ids })
    }

    fn heartbeat(&self, cell: &CellDescriptor, leader: PeerMeta) -> Result<()> {
        self.heartbeats.lock().push((cell.id, leader));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Epoch;

    #[test]
    fn ask_split_allocates_one_peer_id_per_existing_peer() {
        let pd = LocalPdClient::new(100);
        let cell = CellDescriptor {
            id: 1,
            start_key: vec![],
            end_key: vec![],
            epoch: Epoch::default(),
            peers: vec![
                PeerMeta { id: 1, store_id: 1 },
                PeerMeta { id: 2, store_id: 2 },
                PeerMeta { id: 3, store_id: 3 },
            ],
        };
        let resp = pd.ask_split(&cell).unwrap();
        assert_eq!(resp.new_peer_ids.len(), 3);
        assert_ne!(resp.new_cell_id, 0);
    }

    #[test]
    fn heartbeat_is_recorded() {
        let pd = LocalPdClient::new(1);
        let cell = CellDescriptor {
            id: 7,
            start_key: vec![],
            end_key: vec![],
            epoch: Epoch::default(),
            peers: vec![],
        };
        pd.heartbeat(&cell, PeerMeta { id: 1, store_id: 1 }).unwrap();
        assert_eq!(pd.heartbeats(), vec![(7, PeerMeta { id: 1, store_id: 1 })]);
    }
}
