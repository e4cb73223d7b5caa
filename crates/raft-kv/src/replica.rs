//! # replica
//!
//! why: run a raft node against real time, a real transport and a real disk
//! relations: wraps raft-core's RaftNode, persists via durable.rs, applies through state_machine.rs
//! what: Replica handle, election timer, per-peer replication drivers, apply loop, inbound rpc handlers
//!
//! All protocol state lives in one mutex that is never held across an
//! await. Anything a step changes in term, vote or log is encoded under
//! that lock. No reply or acknowledgement leaves this replica until the
//! newest encoded state is on disk, whichever step produced it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, Command, LogEntry, LogIndex, NodeId, NodeState,
    OpResult, PersistentState, RaftConfig, RaftError, RaftNode, RequestVoteArgs,
    RequestVoteReply, Term,
};
use raft_storage::Persister;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ReplicaConfig;
use crate::durable::{DurableWriter, StagedState};
use crate::network::{RpcHandler, Transport, TransportError};
use crate::state_machine::KvStateMachine;

/// Back-to-back AppendEntries to one peer before waiting for the next tick
const MAX_ROUNDS_PER_TICK: usize = 16;

/// Where an accepted submission landed in the leader's log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitted {
    pub index: LogIndex,
    pub term: Term,
}

/// Point-in-time view of a replica, for tests and operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub id: NodeId,
    pub role: NodeState,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub log_len: usize,
}

/// A submission this replica accepted as leader and still owes a result for
struct PendingOp {
    client_id: String,
    op_seq: u64,
}

struct Shared {
    node: RaftNode,
    election_deadline: Instant,
    pending: HashMap<LogIndex, PendingOp>,
    persist_version: u64,
    /// newest encoded state; stays until the writer reports it durable
    staged: Option<StagedState>,
}

impl Shared {
    fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.node.config.random_election_timeout();
    }

    /// Encode the persistent state if the last step changed it, then return
    /// the newest encoded state unless `durable` already covers it.
    ///
    /// A write abandoned by an earlier step is handed out again here, so every
    /// caller waits for it before replying.
    fn unsaved(&mut self, durable: u64) -> Result<Option<StagedState>, RaftError> {
        if self.node.take_persist_needed() {
            let blob = self.node.persistent_state().encode()?;
            self.persist_version += 1;
            self.staged = Some(StagedState {
                version: self.persist_version,
                term: self.node.current_term,
                last_index: self.node.last_log_index(),
                blob: Arc::new(blob),
            });
        }
        if self.staged.as_ref().is_some_and(|s| s.version <= durable) {
            self.staged = None;
        }
        Ok(self.staged.clone())
    }

    fn forget_pending_unless_leader(&mut self) {
        if !self.node.is_leader() && !self.pending.is_empty() {
            tracing::debug!(node_id = self.node.id, dropped = self.pending.len(), "lost leadership, dropping pending submissions");
            self.pending.clear();
        }
    }

    /// True if the result of `entry` should be delivered by this replica
    fn owns(&mut self, entry: &LogEntry) -> bool {
        let Some(op) = self.pending.remove(&entry.index) else {
            return false;
        };
        self.node.is_leader()
            && entry.term == self.node.current_term
            && op.client_id == entry.command.client_id()
            && op.op_seq == entry.command.op_seq()
    }
}

struct Inner {
    id: NodeId,
    config: RaftConfig,
    shared: Mutex<Shared>,
    kv: Mutex<KvStateMachine>,
    durable: DurableWriter,
    transport: Arc<dyn Transport>,
    peer_wakeups: HashMap<NodeId, Arc<Notify>>,
    apply_wakeup: Notify,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn ensure_running(&self) -> Result<(), RaftError> {
        if self.shutdown.is_cancelled() {
            return Err(RaftError::Stopped);
        }
        Ok(())
    }

    fn wake_replicators(&self) {
        for wakeup in self.peer_wakeups.values() {
            wakeup.notify_one();
        }
    }

    /// Wait until `staged` is on disk, then let the node count it
    async fn save(&self, staged: StagedState) -> Result<(), RaftError> {
        let (term, last_index) = (staged.term, staged.last_index);
        self.durable.write(staged).await?;
        let committed = self.shared.lock().node.set_durable_index(term, last_index);
        if committed {
            self.apply_wakeup.notify_one();
            self.wake_replicators();
        }
        Ok(())
    }

    /// Persist a staged state if there is one; false once the replica stopped
    async fn persist(&self, staged: Result<Option<StagedState>, RaftError>) -> bool {
        let result = match staged {
            Ok(Some(staged)) => self.save(staged).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(RaftError::Stopped) => false,
            Err(e) => {
                tracing::error!(node_id = self.id, error = %e, "could not persist raft state");
                false
            }
        }
    }

    /// Run one outbound rpc under the rpc deadline. `None` if it failed or we stopped.
    async fn call<T>(
        &self,
        peer: NodeId,
        rpc: impl Future<Output = Result<T, TransportError>>,
    ) -> Option<T> {
        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => return None,
            outcome = tokio::time::timeout(self.config.rpc_deadline(), rpc) => outcome,
        };
        let error = match outcome {
            Ok(Ok(reply)) => return Some(reply),
            Ok(Err(e)) => e,
            Err(_) => TransportError::Timeout(peer),
        };
        tracing::trace!(node_id = self.id, peer, error = %error, "rpc failed");
        None
    }
}

/// Handle to a running replica. Cheap to clone; all clones drive the same replica.
#[derive(Clone)]
pub struct Replica {
    inner: Arc<Inner>,
}

impl Replica {
    /// Load persisted state, start the background tasks and hand back the
    /// result channel.
    ///
    /// The replica always comes up as a follower with nothing committed or
    /// applied; its table is rebuilt as the leader re-advertises the commit
    /// index. Results are delivered only for operations this replica
    /// accepted as leader.
    pub async fn start(
        config: &ReplicaConfig,
        persister: Box<dyn Persister>,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::Receiver<OpResult>), RaftError> {
        let shutdown = CancellationToken::new();
        let durable = DurableWriter::new(persister, shutdown.clone());
        let blob = durable
            .read()
            .map_err(|e| RaftError::Persistence(e.to_string()))?;
        let restored = PersistentState::decode(&blob)?;
        let mut node = RaftNode::restore(
            config.server_id,
            config.cluster_nodes(),
            config.raft.clone(),
            restored,
        );
        // what was just read back is on disk
        node.set_durable_index(node.current_term, node.last_log_index());

        tracing::info!(
            node_id = node.id,
            term = node.current_term,
            voted_for = ?node.voted_for,
            log_len = node.log.len(),
            cluster_size = node.cluster_nodes.len(),
            "replica starting"
        );

        let peer_wakeups: HashMap<NodeId, Arc<Notify>> =
            node.peers().map(|p| (p, Arc::new(Notify::new()))).collect();
        let mut shared = Shared {
            node,
            election_deadline: Instant::now(),
            pending: HashMap::new(),
            persist_version: 0,
            staged: None,
        };
        shared.reset_election_timer();

        let inner = Arc::new(Inner {
            id: config.server_id,
            config: config.raft.clone(),
            shared: Mutex::new(shared),
            kv: Mutex::new(KvStateMachine::new()),
            durable,
            transport,
            peer_wakeups,
            apply_wakeup: Notify::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        let (results_tx, results_rx) = mpsc::channel(config.ch_capacity.max(1));
        let mut tasks = vec![
            tokio::spawn(run_election_timer(Arc::clone(&inner))),
            tokio::spawn(run_apply_loop(Arc::clone(&inner), results_tx)),
        ];
        for (&peer, wakeup) in &inner.peer_wakeups {
            tasks.push(tokio::spawn(run_replication(
                Arc::clone(&inner),
                peer,
                Arc::clone(wakeup),
            )));
        }
        *inner.tasks.lock() = tasks;

        Ok((Self { inner }, results_rx))
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Append a command to the leader's log and return once it is durable here.
    ///
    /// Does not wait for commit; the outcome arrives on the result channel.
    pub async fn submit(&self, command: Command) -> Result<Submitted, RaftError> {
        self.inner.ensure_running()?;
        let (submitted, staged) = {
            let mut shared = self.inner.shared.lock();
            let entry = shared.node.propose(command)?;
            shared.pending.insert(
                entry.index,
                PendingOp {
                    client_id: entry.command.client_id().to_string(),
                    op_seq: entry.command.op_seq(),
                },
            );
            let submitted = Submitted {
                index: entry.index,
                term: entry.term,
            };
            (submitted, shared.unsaved(self.inner.durable.durable_version())?)
        };
        tracing::debug!(node_id = self.inner.id, index = submitted.index, term = submitted.term, "accepted submission");

        if let Some(staged) = staged {
            self.inner.save(staged).await?;
        }
        self.inner.wake_replicators();
        self.inner.apply_wakeup.notify_one();
        Ok(submitted)
    }

    /// Signal every background task to finish. Idempotent.
    pub fn stop(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!(node_id = self.inner.id, "replica stopping");
            self.inner.shutdown.cancel();
        }
    }

    /// Stop, then wait for the background tasks and any in-flight disk write
    pub async fn shutdown(&self) {
        self.stop();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(node_id = self.inner.id, error = %e, "replica task ended abnormally");
            }
        }
        self.inner.durable.drain().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// `last_applied` counts only entries the key-value table has applied
    pub fn status(&self) -> ReplicaStatus {
        let shared = self.inner.shared.lock();
        let node = &shared.node;
        ReplicaStatus {
            id: node.id,
            role: node.state,
            term: node.current_term,
            leader_id: node.leader_id,
            commit_index: node.commit_index,
            last_applied: node.last_applied,
            log_len: node.log.len(),
        }
    }

    /// Value of `key` in this replica's applied table, which may lag the leader
    pub fn read_local(&self, key: &str) -> Option<String> {
        self.inner.kv.lock().get(key).map(str::to_string)
    }

    /// Size of the persisted raft state; waits for a write in progress
    pub fn raft_state_size(&self) -> usize {
        self.inner.durable.size()
    }
}

#[async_trait]
impl RpcHandler for Replica {
    async fn handle_request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, RaftError> {
        self.inner.ensure_running()?;
        let (reply, staged) = {
            let mut shared = self.inner.shared.lock();
            let (reply, granted) = shared.node.handle_vote_request(&args);
            if granted {
                shared.reset_election_timer();
            }
            shared.forget_pending_unless_leader();
            (reply, shared.unsaved(self.inner.durable.durable_version())?)
        };
        if let Some(staged) = staged {
            self.inner.save(staged).await?;
        }
        Ok(reply)
    }

    async fn handle_append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        self.inner.ensure_running()?;
        let (reply, commit_advanced, staged) = {
            let mut shared = self.inner.shared.lock();
            let commit_before = shared.node.commit_index;
            let (reply, from_leader) = shared.node.handle_append_entries(&args);
            if from_leader {
                shared.reset_election_timer();
            }
            shared.forget_pending_unless_leader();
            let commit_advanced = shared.node.commit_index > commit_before;
            (reply, commit_advanced, shared.unsaved(self.inner.durable.durable_version())?)
        };
        tracing::trace!(
            node_id = self.inner.id,
            leader = args.leader_id,
            entries = args.entries.len(),
            success = reply.success,
            "handled append entries"
        );

        if let Some(staged) = staged {
            self.inner.save(staged).await?;
        }
        if commit_advanced {
            self.inner.apply_wakeup.notify_one();
        }
        Ok(reply)
    }

    async fn handle_submit(&self, command: Command) -> Result<Submitted, RaftError> {
        self.submit(command).await
    }
}

// -- background tasks --

async fn run_election_timer(inner: Arc<Inner>) {
    loop {
        let deadline = inner.shared.lock().election_deadline;
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let (args, staged) = {
            let mut shared = inner.shared.lock();
            // a heartbeat or a granted vote may have pushed the deadline back
            if Instant::now() < shared.election_deadline {
                continue;
            }
            shared.reset_election_timer();
            if shared.node.is_leader() {
                continue;
            }
            let args = shared.node.start_election();
            shared.forget_pending_unless_leader();
            (args, shared.unsaved(inner.durable.durable_version()))
        };

        // our own vote must be durable before asking for anyone else's
        if !inner.persist(staged).await {
            if inner.shutdown.is_cancelled() {
                break;
            }
            continue;
        }
        tracing::debug!(node_id = inner.id, term = args.term, "requesting votes");
        for &peer in inner.peer_wakeups.keys() {
            tokio::spawn(request_vote(Arc::clone(&inner), peer, args.clone()));
        }
    }
    tracing::debug!(node_id = inner.id, "election timer stopped");
}

async fn request_vote(inner: Arc<Inner>, peer: NodeId, args: RequestVoteArgs) {
    let Some(reply) = inner
        .call(peer, inner.transport.request_vote(peer, args.clone()))
        .await
    else {
        return;
    };

    let (won, staged) = {
        let mut shared = inner.shared.lock();
        // answers to an election we already gave up on only matter if they carry news
        if args.term != shared.node.current_term && reply.term <= shared.node.current_term {
            return;
        }
        let won = shared.node.handle_vote_response(peer, &reply);
        shared.forget_pending_unless_leader();
        (won, shared.unsaved(inner.durable.durable_version()))
    };

    if won {
        inner.wake_replicators();
    }
    inner.persist(staged).await;
}

async fn run_replication(inner: Arc<Inner>, peer: NodeId, wakeup: Arc<Notify>) {
    let heartbeat = inner.config.heartbeat();
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = wakeup.notified() => {}
            _ = tokio::time::sleep(heartbeat) => {}
        }
        for _ in 0..MAX_ROUNDS_PER_TICK {
            if !replicate_once(&inner, peer).await {
                break;
            }
        }
    }
    tracing::debug!(node_id = inner.id, peer, "replication driver stopped");
}

/// One AppendEntries round trip to `peer`. True if another should follow right away.
async fn replicate_once(inner: &Inner, peer: NodeId) -> bool {
    let args = {
        let shared = inner.shared.lock();
        shared.node.create_append_entries(peer)
    };
    let Some(args) = args else {
        return false;
    };

    let Some(reply) = inner
        .call(peer, inner.transport.append_entries(peer, args.clone()))
        .await
    else {
        return false;
    };

    let (committed, more, staged) = {
        let mut shared = inner.shared.lock();
        let committed = shared.node.handle_append_entries_response(peer, &args, &reply);
        shared.forget_pending_unless_leader();
        let behind = shared
            .node
            .next_index
            .get(&peer)
            .is_some_and(|&next| next <= shared.node.last_log_index());
        let more = shared.node.is_leader() && (!reply.success || behind);
        if committed {
            tracing::debug!(node_id = inner.id, commit_index = shared.node.commit_index, "commit index advanced");
        }
        (committed, more, shared.unsaved(inner.durable.durable_version()))
    };

    if committed {
        inner.apply_wakeup.notify_one();
        inner.wake_replicators();
    }
    inner.persist(staged).await && more
}

async fn run_apply_loop(inner: Arc<Inner>, results: mpsc::Sender<OpResult>) {
    let mut results = Some(results);
    'apply: loop {
        // entries stay unapplied in the node until the table has them
        let batch: Vec<(LogEntry, bool)> = {
            let mut shared = inner.shared.lock();
            let entries = shared.node.get_entries_to_apply();
            let mut batch = Vec::with_capacity(entries.len());
            for entry in entries {
                let owned = shared.owns(&entry);
                batch.push((entry, owned));
            }
            batch
        };

        if batch.is_empty() {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = inner.apply_wakeup.notified() => continue,
            }
        }

        for (entry, owned) in batch {
            let result = inner.kv.lock().apply(&entry.command);
            inner.shared.lock().node.mark_applied(entry.index);
            tracing::debug!(
                node_id = inner.id,
                index = entry.index,
                term = entry.term,
                client_id = %result.client_id,
                op_seq = result.op_seq,
                "applied"
            );
            if !owned {
                continue;
            }
            let Some(tx) = results.as_ref() else {
                continue;
            };
            let delivered = tokio::select! {
                _ = inner.shutdown.cancelled() => break 'apply,
                sent = tx.send(result) => sent.is_ok(),
            };
            if !delivered {
                tracing::debug!(node_id = inner.id, "result receiver dropped, discarding results");
                results = None;
            }
        }
    }
    tracing::debug!(node_id = inner.id, "apply loop stopped");
}
