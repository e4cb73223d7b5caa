//! # message
//!
//! why: define the raft rpc message types for node communication
//! relations: produced and consumed by node.rs, serialized by the transports in raft-kv
//! what: RequestVote and AppendEntries argument/reply pairs, RaftMessage envelope

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::{LogIndex, NodeId, Term};

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to a vote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// The voter's term, so a stale candidate can catch up
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

impl AppendEntriesArgs {
    /// Index of the last entry this request would leave in a follower's log
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as LogIndex
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Response to AppendEntries
///
/// On a failed consistency check `conflict_index`/`conflict_term` let the
/// leader skip a whole term of entries instead of probing one index at a time.
/// Both are zero/`None` when the request was rejected for its term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    #[serde(default)]
    pub conflict_index: LogIndex,
    #[serde(default)]
    pub conflict_term: Option<Term>,
}

impl AppendEntriesReply {
    pub(crate) fn rejected(term: Term) -> Self {
        Self {
            term,
            success: false,
            conflict_index: 0,
            conflict_term: None,
        }
    }
}

/// All raft rpc messages exchanged between nodes, as sent over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote(RequestVoteArgs),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesReply(AppendEntriesReply),
}
