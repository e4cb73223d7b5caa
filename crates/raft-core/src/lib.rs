//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-kv (timers, rpc, persistence), persisted through raft-storage
//! what: state machine, election logic, log management, message types, persisted state codec

pub mod command;
pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod persist;

/// Identifier of a replica: its position in the configured server list
pub type NodeId = u64;
/// Raft logical clock
pub type Term = u64;
/// 1-based position in the replicated log; 0 means "before the first entry"
pub type LogIndex = u64;

pub use command::{Command, OpResult, OpType};
pub use config::RaftConfig;
pub use error::RaftError;
pub use log::LogEntry;
pub use message::{AppendEntriesArgs, AppendEntriesReply, RaftMessage, RequestVoteArgs, RequestVoteReply};
pub use node::{NodeState, RaftNode};
pub use persist::PersistentState;
