//! # raft-kv
//!
//! why: turn the sans-io raft node into a running, replicated key-value store
//! relations: drives raft-core, persists through raft-storage, talks to peers via network/tcp
//! what: replica runtime, exactly-once kv state machine, transports, config, logging

pub mod config;
mod durable;
pub mod logging;
pub mod network;
pub mod replica;
pub mod state_machine;
pub mod tcp;

pub use config::{ConfigError, ReplicaConfig};
pub use network::{LocalNetwork, LocalTransport, RpcHandler, Transport, TransportError};
pub use replica::{Replica, ReplicaStatus, Submitted};
pub use state_machine::KvStateMachine;
pub use tcp::TcpTransport;
