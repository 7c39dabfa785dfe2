use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use sruth_core::Topology;
use sruth_proto::{read_frame, write_frame};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::message::{TrackerResponse, TrackerTask};
use crate::options::TrackerOptions;

/// The overlay's membership registry: a single authoritative [`Topology`]
/// mutated by short-lived `Register`/`Unregister` requests and queried by
/// `TopologyGetter`/`NetworkGetter` requests (§4.7). Each request is its own
/// TCP connection, read once, answered once, closed.
pub struct Tracker {
    listener: TcpListener,
    options: TrackerOptions,
    topology: Arc<Mutex<Topology>>,
}

impl Tracker {
    pub async fn bind(options: TrackerOptions) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(options.listen_addr)
            .await
            .with_context(|| format!("binding tracker listener on {}", options.listen_addr))?;
        Ok(Self {
            listener,
            options,
            topology: Arc::new(Mutex::new(Topology::new())),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn topology(&self) -> Topology {
        self.topology.lock().clone()
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => {
                    let (socket, peer_addr) = accepted.context("tracker accept failed")?;
                    let topology = self.topology.clone();
                    let reporting_address = self.options.reporting_address.clone();
                    let timeout = self.options.request_timeout;
                    tokio::spawn(async move {
                        if let Err(err) = handle_one(socket, topology, reporting_address, timeout).await {
                            warn!(%peer_addr, %err, "tracker request failed");
                        }
                    });
                }
            }
        }
    }
}

#[instrument(skip(socket, topology, reporting_address))]
async fn handle_one(
    mut socket: TcpStream,
    topology: Arc<Mutex<Topology>>,
    reporting_address: sruth_core::ServerAddress,
    timeout: Duration,
) -> anyhow::Result<()> {
    let task: TrackerTask = tokio::time::timeout(timeout, read_frame(&mut socket))
        .await
        .context("timed out reading tracker task")??;
    debug!(?task, "handling tracker task");
    let response = match task {
        TrackerTask::TopologyGetter { filter, .. } => TrackerResponse::Topology {
            topology: topology.lock().subset(&filter),
            reporting_address,
        },
        TrackerTask::NetworkGetter { .. } => TrackerResponse::Topology {
            topology: topology.lock().clone(),
            reporting_address,
        },
        TrackerTask::Register { server, filter } => {
            topology.lock().register(server, filter);
            TrackerResponse::Ack
        }
        TrackerTask::Unregister { server } => {
            topology.lock().remove_server(&server);
            TrackerResponse::Ack
        }
    };
    tokio::time::timeout(timeout, write_frame(&mut socket, &response))
        .await
        .context("timed out writing tracker response")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sruth_core::{Filter, ServerAddress};
    use sruth_proto::{read_frame, write_frame};

    async fn request(addr: SocketAddr, task: TrackerTask) -> TrackerResponse {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut socket, &task).await.unwrap();
        read_frame(&mut socket).await.unwrap()
    }

    #[tokio::test]
    async fn register_then_topology_getter_sees_the_server() {
        let mut options = TrackerOptions::default();
        options.listen_addr = "127.0.0.1:0".parse().unwrap();
        let tracker = Tracker::bind(options).await.unwrap();
        let addr = tracker.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        tokio::spawn(async move { tracker.run(run_cancel).await });

        let server = ServerAddress::new("10.0.0.1", 9000);
        let reply = request(
            addr,
            TrackerTask::Register {
                server: server.clone(),
                filter: Filter::parse("a/b"),
            },
        )
        .await;
        assert_eq!(reply, TrackerResponse::Ack);

        let reply = request(
            addr,
            TrackerTask::TopologyGetter {
                filter: Filter::parse("a/b/c"),
                local_server: ServerAddress::new("127.0.0.1", 1),
            },
        )
        .await;
        match reply {
            TrackerResponse::Topology { topology, .. } => {
                assert!(topology.servers().any(|s| s == &server));
            }
            other => panic!("unexpected response: {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn unregister_removes_the_server() {
        let mut options = TrackerOptions::default();
        options.listen_addr = "127.0.0.1:0".parse().unwrap();
        let tracker = Tracker::bind(options).await.unwrap();
        let addr = tracker.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        tokio::spawn(async move { tracker.run(run_cancel).await });

        let server = ServerAddress::new("10.0.0.2", 9001);
        request(
            addr,
            TrackerTask::Register {
                server: server.clone(),
                filter: Filter::everything(),
            },
        )
        .await;
        request(addr, TrackerTask::Unregister { server: server.clone() }).await;
        let reply = request(
            addr,
            TrackerTask::NetworkGetter {
                filter: Filter::everything(),
                local_server: ServerAddress::new("127.0.0.1", 1),
            },
        )
        .await;
        match reply {
            TrackerResponse::Topology { topology, .. } => assert!(topology.is_empty()),
            other => panic!("unexpected response: {other:?}"),
        }
        cancel.cancel();
    }
}
