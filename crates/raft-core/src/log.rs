//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted via persist.rs
//! what: LogEntry struct

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::{LogIndex, Term};

/// A single entry in the replicated log, identified by `(term, index)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: LogIndex,
    /// The command to be applied to the state machine
    pub command: Command,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: LogIndex, command: Command) -> Self {
        Self { term, index, command }
    }
}
