//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entries, persist.rs for durable state
//! what: NodeState enum, RaftNode struct, election, replication and commit rules
//!
//! The node never touches a clock, a socket or a disk. Callers feed it rpcs
//! and timer expiries, send whatever it returns, and must persist
//! [`RaftNode::persistent_state`] whenever [`RaftNode::take_persist_needed`]
//! reports a change, before replying to the rpc that caused it.
//!
//! A caller that persists asynchronously reports progress through
//! [`RaftNode::set_durable_index`]; a leader then counts its own log toward
//! a majority only up to what is on disk.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::log::LogEntry;
use crate::message::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::persist::PersistentState;
use crate::{LogIndex, NodeId, Term};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every member of the (static) cluster, including this node
    pub cluster_nodes: Vec<NodeId>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,

    // persistent
    /// Current term number
    pub current_term: Term,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,

    // volatile
    pub commit_index: LogIndex,
    /// Highest entry the caller reported applied via [`RaftNode::mark_applied`]
    pub last_applied: LogIndex,
    /// Leader of the current term, once heard from
    pub leader_id: Option<NodeId>,
    pub votes_received: Vec<NodeId>,

    // leader only, rebuilt on every election win
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, LogIndex>,

    persist_needed: bool,
    /// Last index known durable in the current term; None until the caller
    /// starts reporting, in which case the whole log counts as durable
    durable_index: Option<LogIndex>,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: NodeId, cluster_nodes: Vec<NodeId>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: NodeId, cluster_nodes: Vec<NodeId>, config: RaftConfig) -> Self {
        Self::restore(id, cluster_nodes, config, PersistentState::default())
    }

    /// Rebuild a node from persisted state. Volatile state starts fresh and
    /// the node is always a follower, whatever it was before the restart.
    pub fn restore(
        id: NodeId,
        cluster_nodes: Vec<NodeId>,
        config: RaftConfig,
        persisted: PersistentState,
    ) -> Self {
        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            log: persisted.log,
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            persist_needed: false,
            durable_index: None,
        }
    }

    pub fn persistent_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        }
    }

    /// Returns true (once) if term, vote or log changed since the last call
    pub fn take_persist_needed(&mut self) -> bool {
        std::mem::take(&mut self.persist_needed)
    }

    /// Record that the state of `term` with the log up to `index` is on disk.
    ///
    /// Reports from an older term are ignored. Returns true if a leader's
    /// commit index advanced as a result.
    pub fn set_durable_index(&mut self, term: Term, index: LogIndex) -> bool {
        if term != self.current_term {
            return false;
        }
        let durable = self.durable_index.unwrap_or(0).max(index);
        self.durable_index = Some(durable);
        self.is_leader() && self.maybe_advance_commit()
    }

    /// How far our own log counts toward a majority
    fn self_durable_index(&self) -> LogIndex {
        let last = self.last_log_index();
        self.durable_index.map_or(last, |durable| durable.min(last))
    }

    /// A new term starts with nothing reported durable
    fn reset_durable_index(&mut self) {
        if self.durable_index.is_some() {
            self.durable_index = Some(0);
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    /// Every cluster member except this node
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cluster_nodes.iter().copied().filter(move |&n| n != self.id)
    }

    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> LogIndex {
        self.log.last().map_or(0, |e| e.index)
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last().map_or(0, |e| e.term)
    }

    pub fn get_entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get(index as usize - 1)
    }

    /// Term of the entry at `index`, or 0 if there is none
    pub fn get_term_at(&self, index: LogIndex) -> Term {
        self.get_entry(index).map_or(0, |e| e.term)
    }

    /// Election restriction: is a log ending at (`last_term`, `last_index`)
    /// at least as up-to-date as ours?
    pub fn is_log_up_to_date(&self, last_term: Term, last_index: LogIndex) -> bool {
        let our_term = self.last_log_term();
        last_term > our_term || (last_term == our_term && last_index >= self.last_log_index())
    }

    fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.log.iter().rev().find(|e| e.term == term).map(|e| e.index)
    }

    fn first_index_of_term(&self, term: Term, upto: LogIndex) -> LogIndex {
        let mut index = upto;
        while index > 1 && self.get_term_at(index - 1) == term {
            index -= 1;
        }
        index
    }

    fn truncate_from(&mut self, index: LogIndex) {
        debug_assert!(index > self.commit_index, "truncating committed entry {index}");
        self.log.truncate(index as usize - 1);
        self.persist_needed = true;
    }

    fn push_entry(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_log_index() + 1);
        self.log.push(entry);
        self.persist_needed = true;
    }

    // -- role transitions --

    /// Step down to follower, adopting `term` if it is newer
    pub fn become_follower(&mut self, term: Term) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.persist_needed = true;
            self.reset_durable_index();
        }
        if self.state != NodeState::Follower {
            tracing::info!(node_id = self.id, from = ?self.state, term = self.current_term, "became follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Election timer fired: become candidate for the next term and vote for self
    pub fn start_election(&mut self) -> RequestVoteArgs {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.persist_needed = true;
        self.reset_durable_index();
        self.state = NodeState::Candidate;
        self.leader_id = None;
        self.next_index.clear();
        self.match_index.clear();
        self.votes_received.clear();
        self.votes_received.push(self.id);

        tracing::info!(node_id = self.id, term = self.current_term, "became candidate, starting election");

        if self.has_quorum() {
            self.become_leader();
        }

        RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        let peers: Vec<NodeId> = self.peers().collect();
        self.next_index = peers.iter().map(|&p| (p, next)).collect();
        self.match_index = peers.iter().map(|&p| (p, 0)).collect();

        tracing::info!(node_id = self.id, term = self.current_term, last_index = next - 1, "became leader");
    }

    // -- elections --

    /// Handle an incoming RequestVote. The bool is true when the vote was
    /// granted, which resets the caller's election timer.
    pub fn handle_vote_request(&mut self, args: &RequestVoteArgs) -> (RequestVoteReply, bool) {
        if args.term < self.current_term {
            return (self.vote_reply(false), false);
        }
        if args.term > self.current_term {
            self.become_follower(args.term);
        }

        let free_to_vote = self.voted_for.is_none() || self.voted_for == Some(args.candidate_id);
        let granted =
            free_to_vote && self.is_log_up_to_date(args.last_log_term, args.last_log_index);

        if granted && self.voted_for != Some(args.candidate_id) {
            self.voted_for = Some(args.candidate_id);
            self.persist_needed = true;
        }
        tracing::debug!(
            node_id = self.id,
            term = self.current_term,
            candidate = args.candidate_id,
            granted,
            "handled vote request"
        );
        (self.vote_reply(granted), granted)
    }

    fn vote_reply(&self, vote_granted: bool) -> RequestVoteReply {
        RequestVoteReply {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Count a vote. Returns true if this vote made the node leader.
    pub fn handle_vote_response(&mut self, from: NodeId, reply: &RequestVoteReply) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        if self.state != NodeState::Candidate || reply.term != self.current_term {
            return false;
        }
        if reply.vote_granted && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    // -- replication, leader side --

    /// Append a client command to the leader's log.
    ///
    /// Returns immediately; the entry is committed later by replication.
    pub fn propose(&mut self, command: Command) -> Result<LogEntry, RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id,
            });
        }
        let entry = LogEntry::new(self.current_term, self.last_log_index() + 1, command);
        self.push_entry(entry.clone());
        // a single-node cluster commits on its own
        self.maybe_advance_commit();
        Ok(entry)
    }

    /// Build the AppendEntries for `peer` from its `next_index` onward.
    /// With nothing new to send this is a heartbeat. `None` unless leader.
    pub fn create_append_entries(&self, peer: NodeId) -> Option<AppendEntriesArgs> {
        if !self.is_leader() {
            return None;
        }
        let last = self.last_log_index();
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(last + 1)
            .clamp(1, last + 1);
        let prev_log_index = next - 1;
        let end = last.min(prev_log_index + self.config.max_entries_per_rpc.max(1) as LogIndex);
        let entries = self.log[prev_log_index as usize..end as usize].to_vec();

        Some(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries,
            leader_commit: self.commit_index,
        })
    }

    /// Apply a follower's answer to the request `sent`. Returns true if the
    /// commit index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        sent: &AppendEntriesArgs,
        reply: &AppendEntriesReply,
    ) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        if !self.is_leader() || sent.term != self.current_term {
            return false;
        }

        if reply.success {
            let matched = sent.last_index();
            let match_index = self.match_index.entry(from).or_insert(0);
            *match_index = (*match_index).max(matched);
            let match_index = *match_index;
            let next_index = self.next_index.entry(from).or_insert(0);
            *next_index = (*next_index).max(match_index + 1);
            return self.maybe_advance_commit();
        }

        // a stale rejection must not undo progress made since it was sent
        let current = self.next_index.get(&from).copied().unwrap_or(1);
        if sent.prev_log_index + 1 != current {
            return false;
        }
        let hinted = match (reply.conflict_index, reply.conflict_term) {
            (0, _) => 0,
            (index, Some(term)) => self.last_index_of_term(term).map_or(index, |i| i + 1),
            (index, None) => index,
        };
        let backed_off = if hinted == 0 || hinted >= current {
            current.saturating_sub(1)
        } else {
            hinted
        };
        let floor = self.match_index.get(&from).copied().unwrap_or(0) + 1;
        self.next_index.insert(from, backed_off.max(floor));
        tracing::trace!(node_id = self.id, peer = from, next_index = backed_off.max(floor), "backing off");
        false
    }

    /// Advance commit_index to the highest current-term entry stored on a majority
    fn maybe_advance_commit(&mut self) -> bool {
        let quorum = self.quorum_size();
        let own = self.self_durable_index();
        let mut index = self.last_log_index();
        while index > self.commit_index {
            // only entries of our own term commit by counting replicas
            if self.get_term_at(index) != self.current_term {
                break;
            }
            let replicas = usize::from(own >= index)
                + self.match_index.values().filter(|&&m| m >= index).count();
            if replicas >= quorum {
                tracing::debug!(node_id = self.id, term = self.current_term, commit_index = index, replicas, "advanced commit index");
                self.commit_index = index;
                return true;
            }
            index -= 1;
        }
        false
    }

    // -- replication, follower side --

    /// Handle an incoming AppendEntries. The bool is true when the sender is
    /// a current leader, which resets the caller's election timer.
    pub fn handle_append_entries(&mut self, args: &AppendEntriesArgs) -> (AppendEntriesReply, bool) {
        if args.term < self.current_term {
            return (AppendEntriesReply::rejected(self.current_term), false);
        }
        if args.term > self.current_term || self.state != NodeState::Follower {
            if self.state == NodeState::Leader && args.term == self.current_term {
                tracing::error!(node_id = self.id, term = args.term, other = args.leader_id, "two leaders in one term");
            }
            self.become_follower(args.term);
        }
        self.leader_id = Some(args.leader_id);

        let last = self.last_log_index();
        if args.prev_log_index > last {
            let reply = AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_index: last + 1,
                conflict_term: None,
            };
            return (reply, true);
        }
        let local_term = self.get_term_at(args.prev_log_index);
        if args.prev_log_index > 0 && local_term != args.prev_log_term {
            let reply = AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_index: self.first_index_of_term(local_term, args.prev_log_index),
                conflict_term: Some(local_term),
            };
            return (reply, true);
        }

        for entry in &args.entries {
            match self.get_term_at(entry.index) {
                0 => self.push_entry(entry.clone()),
                term if term != entry.term => {
                    self.truncate_from(entry.index);
                    self.push_entry(entry.clone());
                }
                _ => {}
            }
        }

        let last_new = args.last_index();
        if args.leader_commit > self.commit_index {
            let commit = args.leader_commit.min(last_new);
            if commit > self.commit_index {
                self.commit_index = commit;
            }
        }
        tracing::trace!(
            node_id = self.id,
            leader = args.leader_id,
            appended = args.entries.len(),
            commit_index = self.commit_index,
            "accepted append entries"
        );

        let reply = AppendEntriesReply {
            term: self.current_term,
            success: true,
            conflict_index: 0,
            conflict_term: None,
        };
        (reply, true)
    }

    // -- state machine --

    /// Committed entries not yet marked applied, in log order
    pub fn get_entries_to_apply(&self) -> Vec<LogEntry> {
        if self.last_applied >= self.commit_index {
            return Vec::new();
        }
        self.log[self.last_applied as usize..self.commit_index as usize].to_vec()
    }

    /// The state machine has applied everything up to `index`
    pub fn mark_applied(&mut self, index: LogIndex) {
        debug_assert!(index <= self.commit_index, "applying uncommitted entry {index}");
        self.last_applied = self.last_applied.max(index);
    }
}
