//! # network
//!
//! why: separate "how to reach a peer" from the replica runtime
//! relations: replica.rs calls Transport and implements RpcHandler; tcp.rs is the socket-backed Transport
//! what: Transport / RpcHandler traits, TransportError, LocalNetwork in-process simulated network

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, Command, NodeId, RaftError, RequestVoteArgs,
    RequestVoteReply,
};

use crate::replica::Submitted;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("rpc to peer {0} timed out")]
    Timeout(NodeId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("remote error: {0}")]
    Remote(String),
}

/// Outbound side: how a replica reaches its peers
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(
        &self,
        peer: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError>;

    async fn append_entries(
        &self,
        peer: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError>;
}

/// Inbound side: what a transport delivers to a replica
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle_request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, RaftError>;

    async fn handle_append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError>;

    async fn handle_submit(&self, command: Command) -> Result<Submitted, RaftError>;
}

// -- in-process network --

/// Probability (out of 1000) that an unreliable link loses a request or a reply
const DROP_PER_MILLE: u32 = 100;
/// Upper bound on the extra latency of an unreliable link
const MAX_DELAY_MS: u64 = 27;

#[derive(Default)]
struct NetState {
    handlers: HashMap<NodeId, Arc<dyn RpcHandler>>,
    disconnected: HashSet<NodeId>,
    /// partition group per node; nodes in different groups cannot talk
    groups: HashMap<NodeId, usize>,
    unreliable: bool,
}

impl NetState {
    fn linked(&self, a: NodeId, b: NodeId) -> bool {
        if self.disconnected.contains(&a) || self.disconnected.contains(&b) {
            return false;
        }
        match (self.groups.get(&a), self.groups.get(&b)) {
            (Some(ga), Some(gb)) => ga == gb,
            (None, None) => true,
            _ => false,
        }
    }
}

/// Routes rpcs between replicas living in one process.
///
/// Links can be cut per node (`disconnect`), by group (`partition`), and
/// made lossy (`set_unreliable`). A cut link fails fast with
/// [`TransportError::Unreachable`]; an unreliable one may also lose the
/// reply after the handler ran.
#[derive(Default)]
pub struct LocalNetwork {
    state: RwLock<NetState>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: NodeId, handler: Arc<dyn RpcHandler>) {
        self.state.write().handlers.insert(id, handler);
    }

    /// Forget a replica entirely, as if its process died
    pub fn unregister(&self, id: NodeId) {
        self.state.write().handlers.remove(&id);
    }

    /// Outbound transport for replica `from`
    pub fn transport(self: &Arc<Self>, from: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from,
            net: Arc::clone(self),
        })
    }

    pub fn disconnect(&self, id: NodeId) {
        tracing::debug!(node_id = id, "network: disconnect");
        self.state.write().disconnected.insert(id);
    }

    pub fn reconnect(&self, id: NodeId) {
        tracing::debug!(node_id = id, "network: reconnect");
        self.state.write().disconnected.remove(&id);
    }

    /// Split the cluster; nodes listed in no group are cut off from everyone
    pub fn partition(&self, groups: &[&[NodeId]]) {
        tracing::debug!(?groups, "network: partition");
        let mut state = self.state.write();
        state.groups.clear();
        for (group, members) in groups.iter().enumerate() {
            for &id in members.iter() {
                state.groups.insert(id, group);
            }
        }
        let unlisted: Vec<NodeId> = state
            .handlers
            .keys()
            .filter(|id| !state.groups.contains_key(id))
            .copied()
            .collect();
        let mut next = groups.len();
        for id in unlisted {
            state.groups.insert(id, next);
            next += 1;
        }
    }

    /// Undo every partition and disconnect
    pub fn heal(&self) {
        tracing::debug!("network: heal");
        let mut state = self.state.write();
        state.groups.clear();
        state.disconnected.clear();
    }

    pub fn set_unreliable(&self, unreliable: bool) {
        self.state.write().unreliable = unreliable;
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<dyn RpcHandler>, TransportError> {
        let state = self.state.read();
        if !state.linked(from, to) {
            return Err(TransportError::Unreachable(to));
        }
        state
            .handlers
            .get(&to)
            .cloned()
            .ok_or(TransportError::Unreachable(to))
    }

    fn can_reply(&self, from: NodeId, to: NodeId) -> bool {
        self.state.read().linked(from, to)
    }

    /// Delay and maybe lose a message on an unreliable network; true means lost
    async fn jitter(&self) -> bool {
        if !self.state.read().unreliable {
            return false;
        }
        let (lost, delay) = {
            let mut rng = rand::rng();
            (
                rng.random_range(0..1000) < DROP_PER_MILLE,
                rng.random_range(0..=MAX_DELAY_MS),
            )
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        lost
    }
}

/// One replica's view of a [`LocalNetwork`]
pub struct LocalTransport {
    from: NodeId,
    net: Arc<LocalNetwork>,
}

impl LocalTransport {
    async fn reach(&self, peer: NodeId) -> Result<Arc<dyn RpcHandler>, TransportError> {
        let handler = self.net.route(self.from, peer)?;
        if self.net.jitter().await {
            return Err(TransportError::Unreachable(peer));
        }
        Ok(handler)
    }

    async fn reply<T>(&self, peer: NodeId, reply: Result<T, RaftError>) -> Result<T, TransportError> {
        let reply = reply.map_err(|e| TransportError::Remote(e.to_string()))?;
        // the link may have been cut while the handler ran
        if !self.net.can_reply(peer, self.from) || self.net.jitter().await {
            return Err(TransportError::Unreachable(peer));
        }
        Ok(reply)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        peer: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError> {
        let handler = self.reach(peer).await?;
        let reply = handler.handle_request_vote(args).await;
        self.reply(peer, reply).await
    }

    async fn append_entries(
        &self,
        peer: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        let handler = self.reach(peer).await?;
        let reply = handler.handle_append_entries(args).await;
        self.reply(peer, reply).await
    }
}
