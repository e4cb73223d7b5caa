//! # tcp
//!
//! why: carry peer rpcs and client submissions between processes
//! relations: implements network::Transport; serves any network::RpcHandler (a Replica)
//! what: wire envelopes, TcpTransport, serve loop, one-shot `call` for clients
//!
//! Framing is one json document per line, one request per connection.
//! A line longer than [`MAX_FRAME_BYTES`] ends the connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, Command, NodeId, RaftError, RaftMessage,
    RequestVoteArgs, RequestVoteReply,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::network::{RpcHandler, Transport, TransportError};
use crate::replica::Submitted;

/// Largest request or response line accepted, newline included
pub const MAX_FRAME_BYTES: u64 = 16 * 1024 * 1024;
/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum WireRequest {
    Raft(RaftMessage),
    Submit(Command),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum WireResponse {
    Raft(RaftMessage),
    Submitted(Submitted),
    NotLeader { leader_hint: Option<NodeId> },
    Error(String),
}

/// Send one request to `addr` and read its response
pub async fn call(addr: &str, request: &WireRequest) -> Result<WireResponse, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    write_half.write_all(&line).await?;
    write_half.flush().await?;

    let Some(response) = read_frame(BufReader::new(read_half), MAX_FRAME_BYTES).await? else {
        return Err(TransportError::Remote("connection closed before reply".into()));
    };
    Ok(serde_json::from_str(&response)?)
}

/// Read one line of at most `limit` bytes. `None` on a clean end of stream.
async fn read_frame<R>(reader: R, limit: u64) -> Result<Option<String>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader.take(limit).read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') && read as u64 >= limit {
        return Err(TransportError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame exceeds {limit} bytes"),
        )));
    }
    Ok(Some(line))
}

/// Peer transport over TCP, addressed by the cluster's server list
pub struct TcpTransport {
    peers: HashMap<NodeId, String>,
}

impl TcpTransport {
    pub fn new(peers: HashMap<NodeId, String>) -> Self {
        Self { peers }
    }

    async fn exchange(&self, peer: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError> {
        let addr = self.peers.get(&peer).ok_or(TransportError::Unreachable(peer))?;
        let response = call(addr, &WireRequest::Raft(message)).await.map_err(|e| match e {
            TransportError::Io(_) => TransportError::Unreachable(peer),
            other => other,
        })?;
        match response {
            WireResponse::Raft(reply) => Ok(reply),
            WireResponse::Error(message) => Err(TransportError::Remote(message)),
            other => Err(TransportError::Remote(format!("unexpected response: {other:?}"))),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(
        &self,
        peer: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError> {
        match self.exchange(peer, RaftMessage::RequestVote(args)).await? {
            RaftMessage::RequestVoteReply(reply) => Ok(reply),
            other => Err(TransportError::Remote(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn append_entries(
        &self,
        peer: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        match self.exchange(peer, RaftMessage::AppendEntries(args)).await? {
            RaftMessage::AppendEntriesReply(reply) => Ok(reply),
            other => Err(TransportError::Remote(format!("unexpected reply: {other:?}"))),
        }
    }
}

// -- server side --

/// Source of inbound connections
#[async_trait]
trait Acceptor: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Accept connections until `shutdown` fires, answering each from `handler`.
///
/// A failed accept is logged and retried; only shutdown ends the loop.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "listening");
    accept_loop(&listener, handler, shutdown).await;
    tracing::info!(addr = %local, "listener closed");
    Ok(())
}

async fn accept_loop(acceptor: &dyn Acceptor, handler: Arc<dyn RpcHandler>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                }
            }
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, handler).await {
                tracing::debug!(remote = %remote, error = %e, "connection failed");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError> {
    let (read_half, mut write_half) = stream.into_split();
    let Some(line) = read_frame(BufReader::new(read_half), MAX_FRAME_BYTES).await? else {
        return Ok(());
    };

    let response = match serde_json::from_str::<WireRequest>(&line) {
        Ok(request) => dispatch(handler.as_ref(), request).await,
        Err(e) => WireResponse::Error(format!("bad request: {e}")),
    };

    let mut out = serde_json::to_vec(&response)?;
    out.push(b'\n');
    write_half.write_all(&out).await?;
    write_half.flush().await?;
    Ok(())
}

async fn dispatch(handler: &dyn RpcHandler, request: WireRequest) -> WireResponse {
    match request {
        WireRequest::Raft(RaftMessage::RequestVote(args)) => respond(
            handler.handle_request_vote(args).await,
            |reply| WireResponse::Raft(RaftMessage::RequestVoteReply(reply)),
        ),
        WireRequest::Raft(RaftMessage::AppendEntries(args)) => respond(
            handler.handle_append_entries(args).await,
            |reply| WireResponse::Raft(RaftMessage::AppendEntriesReply(reply)),
        ),
        WireRequest::Raft(other) => WireResponse::Error(format!("not a request: {other:?}")),
        WireRequest::Submit(command) => {
            respond(handler.handle_submit(command).await, WireResponse::Submitted)
        }
    }
}

fn respond<T>(result: Result<T, RaftError>, wrap: impl FnOnce(T) -> WireResponse) -> WireResponse {
    match result {
        Ok(value) => wrap(value),
        Err(RaftError::NotLeader { leader_hint }) => WireResponse::NotLeader { leader_hint },
        Err(e) => WireResponse::Error(e.to_string()),
    }
}
