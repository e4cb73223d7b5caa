//! # persist
//!
//! why: own the byte encoding of the state raft must never lose
//! relations: produced by node.rs, handed to a raft-storage Persister as an opaque blob
//! what: PersistentState with deterministic encode/decode

use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::log::LogEntry;
use crate::{NodeId, Term};

/// The durable part of a replica: term, vote and the full log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
}

impl PersistentState {
    pub fn encode(&self) -> Result<Vec<u8>, RaftError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a blob written by [`PersistentState::encode`].
    ///
    /// An empty blob is a replica that has never persisted anything and
    /// decodes to the initial state. A log whose indexes are not exactly
    /// `1..=n`, or whose terms decrease or exceed `current_term`, is rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, RaftError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let state: Self = serde_json::from_slice(bytes)?;
        state.validate()?;
        Ok(state)
    }

    fn validate(&self) -> Result<(), RaftError> {
        let mut prev_term = 0;
        for (pos, entry) in self.log.iter().enumerate() {
            let expected = pos as u64 + 1;
            if entry.index != expected {
                return Err(RaftError::Corrupt(format!(
                    "entry at position {pos} has index {} (expected {expected})",
                    entry.index
                )));
            }
            if entry.term < prev_term || entry.term > self.current_term {
                return Err(RaftError::Corrupt(format!(
                    "entry {} has term {} (previous {prev_term}, current {})",
                    entry.index, entry.term, self.current_term
                )));
            }
            prev_term = entry.term;
        }
        Ok(())
    }
}
