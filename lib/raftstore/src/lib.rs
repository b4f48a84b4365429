//! The per-peer raft integration core: every type needed to run one or many
//! independently replicated, splittable key ranges ("cells") over a shared
//! `raft::RawNode` loop, backed by a pluggable meta/data engine pair.

pub mod apply;
pub mod cell;
pub mod errors;
pub mod pd;
pub mod peer;
pub mod peer_storage;
pub mod read_queue;
pub mod store;
pub mod transport;
pub mod worker;

pub use apply::{
    AdminRequest, ApplyDelegate, ApplyMetrics, AsyncApplyResult, ChangePeerRequest, CmdResponse,
    Command, ConfChangeKind, ConfChangeOutcome, ExecResult, Proposal, ProposalContext,
};
pub use cell::{CellDescriptor, CellId, Epoch, PeerId, PeerMeta, StoreId};
pub use errors::{fatal, Error, Result};
pub use pd::{AskSplitResponse, LocalPdClient, PdClient, PdError};
pub use peer::{ApplySnapResult, PeerLocator, PeerNotification, PeerReplicate, CELL_MAX_SIZE, CELL_SPLIT_SIZE};
pub use peer_storage::{
    GenSnapOutcome, GenerateSnapTask, PeerLifecycle, PeerStorage, PersistedPeerState,
    SnapshotData, SnapshotScheduler, TruncatedState, MAX_SNAP_TRY, RAFT_INIT_LOG_INDEX, RAFT_INIT_LOG_TERM,
};
pub use read_queue::{ReadCmd, ReadCmdResult, ReadIndexQueue};
pub use store::{Store, StoreConfig};
pub use transport::{ChannelTransport, Transport, TransportError};
pub use worker::{ApplyScheduler, ApplyTask, InstallSnapTask, WorkerPool};
