//! The transport layer carrying raft messages between peers:
//! out of scope for this crate, specified only at its interface. Ships an
//! in-memory test double (`ChannelTransport`) so the ready-processing loop
//! can be exercised end to end without a real network.

use std::sync::Arc;

use parking_lot::Mutex;
use raft::eraftpb::Message;

use crate::cell::{PeerMeta, StoreId};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("no route to store {0}")]
    NoRoute(StoreId),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Delivered at-most-once with no ordering beyond raft's own requirements.
pub trait Transport: Send + Sync {
    fn send(&self, to: PeerMeta, msg: Message) -> Result<()>;
}

/// An in-process transport for tests: messages addressed to a store land in
/// that store's inbox instead of crossing the network. Each `PeerReplicate`
/// tick drains its own store's inbox and feeds messages to `RawNode::step`.
#[derive(Default)]
pub struct ChannelTransport {
    inboxes: Mutex<std::collections::HashMap<StoreId, Vec<(PeerMeta, Message)>>>,
}

impl ChannelTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn drain(&self, store_id: StoreId) -> Vec<(PeerMeta, Message)> {
        self.inboxes.lock().remove(&store_id).unwrap_or_default()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, to: PeerMeta, msg: Message) -> Result<()> {
        self.inboxes.lock().entry(to.store_id).or_default().push((to, msg));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_route_by_destination_store() {
        let transport = ChannelTransport::new();
        let peer = PeerMeta { id: 5, store_id: 2 };
        transport.send(peer, Message::default()).unwrap();
        assert_eq!(transport.drain(2).len(), 1);
        assert_eq!(transport.drain(2).len(), 0);
    }
}
