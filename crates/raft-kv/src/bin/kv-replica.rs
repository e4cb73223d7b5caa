//! # kv-replica
//!
//! why: run one replica of the replicated kv store as its own process
//! relations: wires ReplicaConfig, FileStorage, TcpTransport and Replica together
//! what: cli entry point; logs every applied result until ctrl-c

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use raft_kv::logging::init_tracing;
use raft_kv::{tcp, Replica, ReplicaConfig, TcpTransport};
use raft_storage::FileStorage;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "kv-replica", about = "Run one replica of the replicated key-value store")]
struct Args {
    /// Path to the replica's json config
    #[arg(short, long)]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = ReplicaConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    let listen_addr = config
        .listen_addr()
        .context("server_id has no entry in server_list")?
        .to_string();

    tracing::info!(
        server_id = config.server_id,
        listen = %listen_addr,
        cluster_size = config.server_list.len(),
        data_dir = %config.data_dir.display(),
        tracing_server = ?config.tracing_server_addr,
        tracing_identity = ?config.tracing_identity,
        "starting kv replica"
    );

    let storage = FileStorage::new(&config.data_dir)
        .with_context(|| format!("opening storage in {}", config.data_dir.display()))?;
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    let transport = Arc::new(TcpTransport::new(config.peer_addrs()));

    let (replica, mut results) = Replica::start(&config, Box::new(storage), transport)
        .await
        .context("starting replica")?;

    let server_shutdown = CancellationToken::new();
    let server = tokio::spawn(tcp::serve(
        listener,
        Arc::new(replica.clone()),
        server_shutdown.clone(),
    ));

    loop {
        tokio::select! {
            result = results.recv() => match result {
                Some(r) => tracing::info!(
                    client_id = %r.client_id,
                    op_seq = r.op_seq,
                    op = ?r.op_type,
                    key = %r.key,
                    value = ?r.value,
                    ok = r.ok,
                    "operation applied"
                ),
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for ctrl-c")?;
                tracing::info!("ctrl-c received");
                break;
            }
        }
    }

    server_shutdown.cancel();
    replica.shutdown().await;
    server
        .await
        .context("tcp server task panicked")?
        .context("tcp server failed")?;

    let status = replica.status();
    tracing::info!(term = status.term, commit_index = status.commit_index, "replica stopped");
    Ok(())
}
