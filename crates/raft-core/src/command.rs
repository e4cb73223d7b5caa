//! # command
//!
//! why: describe the client operations that travel through the replicated log
//! relations: carried by log.rs entries, applied by the kv state machine in raft-kv
//! what: Command, OpType, OpResult

use serde::{Deserialize, Serialize};

/// Kind of client operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    Get,
    Put,
}

/// A client operation together with its deduplication identity.
///
/// `op_seq` is assigned by the client gateway and grows monotonically per
/// `client_id`; the apply layer uses the pair to answer resubmissions from
/// its cache instead of applying them twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Get {
        client_id: String,
        op_seq: u64,
        key: String,
    },
    Put {
        client_id: String,
        op_seq: u64,
        key: String,
        value: String,
    },
}

impl Command {
    pub fn get(client_id: impl Into<String>, op_seq: u64, key: impl Into<String>) -> Self {
        Self::Get {
            client_id: client_id.into(),
            op_seq,
            key: key.into(),
        }
    }

    pub fn put(
        client_id: impl Into<String>,
        op_seq: u64,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Put {
            client_id: client_id.into(),
            op_seq,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn op_type(&self) -> OpType {
        match self {
            Self::Get { .. } => OpType::Get,
            Self::Put { .. } => OpType::Put,
        }
    }

    pub fn client_id(&self) -> &str {
        match self {
            Self::Get { client_id, .. } | Self::Put { client_id, .. } => client_id,
        }
    }

    pub fn op_seq(&self) -> u64 {
        match self {
            Self::Get { op_seq, .. } | Self::Put { op_seq, .. } => *op_seq,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Get { key, .. } | Self::Put { key, .. } => key,
        }
    }

    /// The value carried by a `Put`; `None` for `Get`
    pub fn value(&self) -> Option<&str> {
        match self {
            Self::Get { .. } => None,
            Self::Put { value, .. } => Some(value),
        }
    }
}

/// Outcome of one applied operation, as emitted on a replica's result channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
    pub client_id: String,
    pub op_seq: u64,
    pub op_type: OpType,
    pub key: String,
    /// value written by a `Put`, or value read by a `Get` (`None` if never set)
    pub value: Option<String>,
    pub ok: bool,
}
