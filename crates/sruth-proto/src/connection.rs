use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::framing::{read_frame, write_frame, FramingError};
use crate::message::ConnectionId;

/// One of the three sockets making up a logical [`Connection`] (§4.4).
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Notice,
    Request,
    Data,
}

const ALL_ROLES: [StreamRole; 3] = [StreamRole::Notice, StreamRole::Request, StreamRole::Data];

/// The first frame written on every socket, letting the accepting side
/// coalesce three independently-accepted sockets into one [`Connection`]
/// without relying on accept order, which TCP does not guarantee to match
/// the dialing order.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
struct StreamHello {
    connection_id: ConnectionId,
    role: StreamRole,
}

/// The write half of one stream, behind a lock so concurrent senders (e.g.
/// the task forwarding local notices and the task echoing received ones)
/// can share it safely.
pub struct StreamWriter(AsyncMutex<OwnedWriteHalf>);

impl StreamWriter {
    pub async fn send<T: Serialize>(&self, value: &T) -> Result<(), FramingError> {
        let mut half = self.0.lock().await;
        write_frame(&mut *half, value).await
    }
}

/// One duplex, length-prefixed-frame stream within a [`Connection`]. The
/// read half is owned by whichever task drives that stream's receive loop;
/// the write half is shared via [`StreamWriter`] so sends can originate from
/// any task.
pub struct Stream {
    read: OwnedReadHalf,
    writer: Arc<StreamWriter>,
}

impl Stream {
    fn new(socket: TcpStream) -> Self {
        let (read, write) = socket.into_split();
        Self {
            read,
            writer: Arc::new(StreamWriter(AsyncMutex::new(write))),
        }
    }

    pub fn writer(&self) -> Arc<StreamWriter> {
        self.writer.clone()
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, FramingError> {
        read_frame(&mut self.read).await
    }
}

/// A logical connection to a peer: three independent streams (notice,
/// request, data), each its own TCP socket, so a large piece in flight on
/// the data stream never head-of-line blocks a notice or a request (§4.4).
pub struct Connection {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub notice: Stream,
    pub request: Stream,
    pub data: Stream,
}

async fn dial_one(
    remote: SocketAddr,
    id: &ConnectionId,
    role: StreamRole,
    timeout: Duration,
) -> anyhow::Result<Stream> {
    let mut socket = tokio::time::timeout(timeout, TcpStream::connect(remote))
        .await
        .context("timed out connecting")??;
    let hello = StreamHello {
        connection_id: id.clone(),
        role,
    };
    tokio::time::timeout(timeout, write_frame(&mut socket, &hello))
        .await
        .context("timed out sending stream hello")??;
    Ok(Stream::new(socket))
}

/// Opens all three sockets of a new connection to `remote`, in sequence.
/// Each carries the same [`ConnectionId`] and a distinct [`StreamRole`] so
/// the far side can reassemble them regardless of arrival order.
pub async fn connect(
    id: ConnectionId,
    remote: SocketAddr,
    handshake_timeout: Duration,
) -> anyhow::Result<Connection> {
    let notice = dial_one(remote, &id, StreamRole::Notice, handshake_timeout).await?;
    let request = dial_one(remote, &id, StreamRole::Request, handshake_timeout).await?;
    let data = dial_one(remote, &id, StreamRole::Data, handshake_timeout).await?;
    Ok(Connection {
        id,
        peer_addr: remote,
        notice,
        request,
        data,
    })
}

struct PendingConnection {
    peer_addr: SocketAddr,
    streams: HashMap<StreamRole, TcpStream>,
    deadline: tokio::time::Instant,
}

/// Accepts sockets on a listener and coalesces them, by [`ConnectionId`],
/// into complete three-stream [`Connection`]s. A connection whose third
/// socket has not arrived within `handshake_timeout` of its first is
/// discarded along with whatever sockets it did collect (§4.4).
pub struct ConnectionAcceptor {
    listener: TcpListener,
    handshake_timeout: Duration,
}

impl ConnectionAcceptor {
    pub async fn bind(addr: SocketAddr, handshake_timeout: Duration) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        Ok(Self {
            listener,
            handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept-and-coalesce loop until `cancel` fires, sending each
    /// completed [`Connection`] to `tx`. Intended to be spawned as its own
    /// task and driven for the server's lifetime.
    pub async fn run(self, tx: mpsc::Sender<Connection>, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut pending: HashMap<ConnectionId, PendingConnection> = HashMap::new();
        loop {
            let next_deadline = pending.values().map(|p| p.deadline).min();
            let sweep = async {
                match next_deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sweep => {
                    let now = tokio::time::Instant::now();
                    let before = pending.len();
                    pending.retain(|_, p| p.deadline > now);
                    let dropped = before - pending.len();
                    if dropped > 0 {
                        debug!(dropped, "discarded partial connection(s) on handshake timeout");
                    }
                }
                accepted = self.listener.accept() => {
                    let (mut socket, peer_addr) = accepted.context("accept failed")?;
                    let hello: StreamHello = match tokio::time::timeout(
                        self.handshake_timeout,
                        read_frame(&mut socket),
                    )
                    .await
                    {
                        Ok(Ok(hello)) => hello,
                        Ok(Err(err)) => {
                            trace!(%peer_addr, %err, "dropping socket with malformed stream hello");
                            continue;
                        }
                        Err(_) => {
                            trace!(%peer_addr, "dropping socket that never sent a stream hello");
                            continue;
                        }
                    };
                    let entry = pending.entry(hello.connection_id.clone()).or_insert_with(|| {
                        PendingConnection {
                            peer_addr,
                            streams: HashMap::new(),
                            deadline: tokio::time::Instant::now() + self.handshake_timeout,
                        }
                    });
                    entry.streams.insert(hello.role, socket);
                    if entry.streams.len() == ALL_ROLES.len() {
                        let PendingConnection { peer_addr, mut streams, .. } =
                            pending.remove(&hello.connection_id).unwrap();
                        let connection = Connection {
                            id: hello.connection_id,
                            peer_addr,
                            notice: Stream::new(streams.remove(&StreamRole::Notice).unwrap()),
                            request: Stream::new(streams.remove(&StreamRole::Request).unwrap()),
                            data: Stream::new(streams.remove(&StreamRole::Data).unwrap()),
                        };
                        if tx.send(connection).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sruth_core::ServerAddress;

    #[tokio::test]
    async fn client_and_server_assemble_the_same_connection() {
        let acceptor = ConnectionAcceptor::bind(
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let server_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = acceptor.run(tx, server_cancel).await;
        });

        let id = ConnectionId::new(ServerAddress::new("127.0.0.1", 9001));
        let client_conn = connect(id.clone(), addr, Duration::from_secs(5)).await.unwrap();
        let server_conn = rx.recv().await.unwrap();

        assert_eq!(client_conn.id, server_conn.id);
        cancel.cancel();
    }

    #[tokio::test]
    async fn incomplete_connection_is_dropped_after_timeout() {
        let acceptor = ConnectionAcceptor::bind(
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let server_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = acceptor.run(tx, server_cancel).await;
        });

        let id = ConnectionId::new(ServerAddress::new("127.0.0.1", 9001));
        // Only dial the notice stream; request/data never arrive.
        let _lone =
            dial_one(addr, &id, StreamRole::Notice, Duration::from_secs(1)).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(result.is_err(), "no connection should have been assembled");
        cancel.cancel();
    }
}
