use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sruth_archive::ArchiveOptions;
use sruth_core::{Filter, Predicate, ServerAddress};
use sruth_node::{Node, NodeOptions, ServerOptions};
use sruth_tracker::TrackerProxyOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Runs one overlay node: opens an archive at `archive-root`, registers
/// with the tracker at `tracker-addr` for every `--want` filter, and
/// serves/pulls pieces until interrupted. The CLI surface itself is not
/// part of what this crate specifies (XML subscription descriptors,
/// action processors, and the rest of the `Subscriber`/`Publisher`
/// entry points are out of scope); this binary exists to exercise the
/// option structs end to end.
#[derive(Parser)]
#[command(version, about)]
struct Opts {
    /// Root directory for archived files and the admin subtree.
    #[arg(long, default_value = "./archive")]
    archive_root: PathBuf,

    /// Address to accept peer connections on.
    #[arg(long, default_value = "0.0.0.0:0")]
    listen_addr: SocketAddr,

    /// Host to advertise to the tracker in place of `listen-addr`'s IP,
    /// for nodes behind NAT or a load balancer.
    #[arg(long)]
    public_host: Option<String>,

    /// Tracker to register with and query for topology.
    #[arg(long)]
    tracker_addr: SocketAddr,

    /// Path-prefix filters this node is interested in. EVERYTHING if
    /// omitted.
    #[arg(long = "want")]
    want_filters: Vec<String>,

    /// If set, this node periodically republishes the tracker's full
    /// topology to its admin subtree for other nodes to read without
    /// contacting the tracker directly (§4.6 "Topology distribution").
    #[arg(long)]
    publish_topology_interval_secs: Option<u64>,

    /// Path to a distributed topology file (typically another node's
    /// published `FilterServerMap`) to fall back to if the tracker cannot
    /// be reached (§4.7, §7 "Tracker unavailable").
    #[arg(long)]
    distributed_topology_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let archive = ArchiveOptions {
        root: opts.archive_root,
        ..ArchiveOptions::default()
    };
    let predicate = if opts.want_filters.is_empty() {
        Predicate::everything()
    } else {
        Predicate::of(opts.want_filters.iter().map(|s| Filter::parse(s)))
    };
    let local_server = ServerAddress::new(
        opts.public_host.unwrap_or_else(|| opts.listen_addr.ip().to_string()),
        opts.listen_addr.port(),
    );
    let mut tracker = TrackerProxyOptions::new(opts.tracker_addr, local_server);
    tracker.distributed_topology_path = opts.distributed_topology_path;

    let mut options = NodeOptions::new(archive, tracker, predicate);
    options.server = ServerOptions {
        listen_addr: opts.listen_addr,
    };
    options.publish_topology_interval = opts.publish_topology_interval_secs.map(Duration::from_secs);

    let (node, mut products_rx) = Node::start(options).await.context("starting node")?;
    info!(node_info = ?node.local_node_info(), "node started");

    let cancel = CancellationToken::new();

    let products_cancel = cancel.clone();
    let products_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = products_cancel.cancelled() => return,
                product = products_rx.recv() => {
                    match product {
                        Some(info) => info!(path = %info.id.path, "data product ready"),
                        None => return,
                    }
                }
            }
        }
    });

    let run_cancel = cancel.clone();
    let run_task = tokio::spawn(async move { node.run(run_cancel).await });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    cancel.cancel();

    run_task.await.context("node task panicked")??;
    let _ = products_task.await;
    Ok(())
}
