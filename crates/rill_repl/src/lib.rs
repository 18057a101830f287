//! Replicated log groups.
//!
//! A node hosts any number of groups; each group replicates an ordered
//! command log across its members and drives an on-disk state machine with
//! the committed entries. Proposals are serialized through a deterministic
//! sequencer member, acknowledged by a quorum, and made durable in a
//! per-group log file before application. State machines persist their own
//! applied index, so recovery replays only the log suffix past it.
//!
//! The engine is transport-agnostic: production deployments plug a network
//! transport into the [`Transport`] trait, while tests and single-process
//! clusters use the in-memory [`transport::LocalTransport`].

pub mod group;
pub mod log;
pub mod node;
pub mod transport;
pub mod types;

pub use group::Group;
pub use node::NodeHost;
pub use transport::{LocalRouter, LocalTransport};
pub use types::{
    Entry, GroupConfig, GroupId, NodeId, SmResult, SnapshotPayload, StateMachine, StateSnapshot,
    Transport,
};
