//! # error
//!
//! why: one error type for everything the consensus layer reports upward
//! relations: returned by node.rs (submit), persist.rs (codec), raft-kv (persistence, shutdown)
//! what: RaftError

use crate::NodeId;

#[derive(thiserror::Error, Debug)]
pub enum RaftError {
    /// This replica cannot accept submissions; retry at `leader_hint` if known
    #[error("not leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("persisted state codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("persisted state is corrupt: {0}")]
    Corrupt(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("replica stopped")]
    Stopped,
}
