//! # state_machine
//!
//! why: apply committed commands to the key-value table exactly once per client operation
//! relations: fed by the replica's apply loop in log order
//! what: KvStateMachine with a per-client record of the latest applied Put

use std::collections::HashMap;

use raft_core::{Command, OpResult, OpType};

/// Latest Put applied for one client
#[derive(Debug, Clone)]
struct ClientSession {
    op_seq: u64,
    result: OpResult,
}

/// The replicated key-value table.
///
/// Every replica applies the same committed commands in the same order and
/// so ends up with the same table. A Put whose `op_seq` is not newer than
/// the last one applied for its client is a duplicate and changes nothing.
/// Gets never touch the table or the session record.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    table: HashMap<String, String>,
    sessions: HashMap<String, ClientSession>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed command and return its outcome
    pub fn apply(&mut self, command: &Command) -> OpResult {
        match command {
            Command::Get {
                client_id,
                op_seq,
                key,
            } => OpResult {
                client_id: client_id.clone(),
                op_seq: *op_seq,
                op_type: OpType::Get,
                key: key.clone(),
                value: self.table.get(key).cloned(),
                ok: true,
            },
            Command::Put {
                client_id,
                op_seq,
                key,
                value,
            } => {
                if let Some(session) = self.sessions.get(client_id) {
                    if *op_seq == session.op_seq {
                        return session.result.clone();
                    }
                    if *op_seq < session.op_seq {
                        tracing::debug!(client_id = %client_id, op_seq, latest = session.op_seq, "stale put skipped");
                        return put_result(client_id, *op_seq, key, value);
                    }
                }

                self.table.insert(key.clone(), value.clone());
                let result = put_result(client_id, *op_seq, key, value);
                self.sessions.insert(
                    client_id.clone(),
                    ClientSession {
                        op_seq: *op_seq,
                        result: result.clone(),
                    },
                );
                result
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.table.get(key).map(String::as_str)
    }

    /// Highest Put sequence number applied for `client_id`
    pub fn last_op_seq(&self, client_id: &str) -> Option<u64> {
        self.sessions.get(client_id).map(|s| s.op_seq)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

fn put_result(client_id: &str, op_seq: u64, key: &str, value: &str) -> OpResult {
    OpResult {
        client_id: client_id.to_string(),
        op_seq,
        op_type: OpType::Put,
        key: key.to_string(),
        value: Some(value.to_string()),
        ok: true,
    }
}
