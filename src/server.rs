//! WebSocket server for the broadcast hub.
//!
//! Accepts TCP connections, performs the WebSocket upgrade, and drives a
//! reader and a writer per client. All state lives in the hub task.
//!
//! The reader and writer race each other: whichever ends first decides why
//! the connection closed, and the other side is dropped with it.

use crate::config::Config;
use crate::error::{HubError, HubResult};
use crate::hub::{payload_text, CloseReason, Connection, ConnectionId, Hub, HubHandle};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, trace, warn};

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
type WsSource<S> = SplitStream<WebSocketStream<S>>;

/// Per-connection time limits.
#[derive(Debug, Clone, Copy)]
struct Timeouts {
    handshake: Option<Duration>,
    idle: Option<Duration>,
}

/// Server instance bound to its listening socket.
pub struct Server {
    config: Config,
    listener: TcpListener,
    hub: HubHandle,
    hub_task: JoinHandle<()>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Bind the listener and start the hub task.
    ///
    /// Fails with [`HubError::Bind`] if the address is unavailable.
    pub async fn bind(config: Config) -> HubResult<Self> {
        let listener = create_listener(config.listen, config.backlog).map_err(|source| {
            HubError::Bind {
                addr: config.listen,
                source,
            }
        })?;

        let (hub, hub_task) = Hub::new(config.include_sender).spawn();

        Ok(Server {
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
            listener,
            hub,
            hub_task,
        })
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> HubResult<SocketAddr> {
        self.listener.local_addr().map_err(|source| HubError::Bind {
            addr: self.config.listen,
            source,
        })
    }

    /// Handle for querying the hub from outside the server.
    pub fn hub(&self) -> HubHandle {
        self.hub.clone()
    }

    /// Serve until Ctrl-C.
    pub async fn run(self) -> HubResult<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
    }

    /// Serve until `shutdown` resolves, then close every connection.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> HubResult<()> {
        info!(address = %self.local_addr()?, "Server listening");
        tokio::pin!(shutdown);

        let mut next_id: u64 = 0;

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    let id = ConnectionId::new(next_id);
                    debug!(id = %id, peer = %peer, "New TCP connection");

                    let hub = self.hub.clone();
                    let timeouts = Timeouts {
                        handshake: self.config.handshake_timeout,
                        idle: self.config.idle_timeout,
                    };

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, id, hub, timeouts).await {
                            warn!(error = %e, "Connection setup failed");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %HubError::Accept(e), "Accept failed");
                }
            }
        }

        info!("Server stopping");
        // The hub may already be gone if it was stopped through a handle.
        let _ = self.hub.shutdown();
        let _ = self.hub_task.await;
        Ok(())
    }
}

/// Build a non-blocking listener with SO_REUSEADDR.
///
/// SO_REUSEPORT is left off so a second server on the same port fails.
fn create_listener(addr: SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

/// Upgrade one TCP connection and run it until it closes.
///
/// Only handshake failures are returned. Everything after registration is
/// reported to the hub as a close reason.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
    hub: HubHandle,
    timeouts: Timeouts,
) -> HubResult<()> {
    let upgrade = tokio_tungstenite::accept_async(stream);
    let upgraded = match timeouts.handshake {
        Some(limit) => tokio::time::timeout(limit, upgrade)
            .await
            .map_err(|_| HubError::HandshakeTimeout { peer, after: limit })?,
        None => upgrade.await,
    };
    let ws = upgraded.map_err(|source| HubError::Handshake { peer, source })?;

    serve_connection(ws, peer, id, hub, timeouts.idle).await;
    Ok(())
}

/// Register an upgraded connection and pump frames until either direction
/// fails or the hub lets go of it.
async fn serve_connection<S>(
    ws: WebSocketStream<S>,
    peer: SocketAddr,
    id: ConnectionId,
    hub: HubHandle,
    idle_timeout: Option<Duration>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, source) = ws.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    if hub.connect(Connection::new(id, peer, outbound_tx)).is_err() {
        debug!(id = %id, "Hub stopped before registration");
        return;
    }

    let reader = read_loop(source, id, &hub, idle_timeout);
    let writer = write_loop(sink, outbound_rx, id);
    tokio::pin!(reader, writer);

    tokio::select! {
        reason = &mut reader => {
            // Removal releases the outbound queue, which lets the writer
            // flush what is left and send a close frame.
            let _ = hub.disconnect(id, reason);
            if let Err(e) = writer.await {
                trace!(id = %id, error = %e, "Close handshake incomplete");
            }
        }
        written = &mut writer => {
            // An Ok exit means the hub already removed the client.
            if let Err(source) = written {
                let err = HubError::Send { id, source };
                debug!(error = %err, "Write failed");
                let _ = hub.disconnect(id, CloseReason::SendFailed(err.to_string()));
            }
        }
    }
}

/// Forward inbound data frames to the hub until the client goes away.
async fn read_loop<S>(
    mut source: WsSource<S>,
    id: ConnectionId,
    hub: &HubHandle,
    idle_timeout: Option<Duration>,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, source.next()).await {
                Ok(next) => next,
                Err(_) => return CloseReason::IdleTimeout,
            },
            None => source.next().await,
        };

        match next {
            Some(Ok(Message::Close(frame))) => {
                trace!(id = %id, ?frame, "Close frame received");
                return CloseReason::Closed;
            }
            Some(Ok(msg)) => {
                if let Some(payload) = payload_text(&msg) {
                    if hub.message(id, payload).is_err() {
                        return CloseReason::Shutdown;
                    }
                }
            }
            Some(Err(e)) => {
                let err = HubError::Connection { id, source: e };
                return CloseReason::Error(err.to_string());
            }
            None => return CloseReason::Closed,
        }
    }
}

/// Drain the outbound queue into the socket.
///
/// Returns `Ok` once the queue is released and the close frame is sent.
async fn write_loop<S>(
    mut sink: WsSink<S>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    id: ConnectionId,
) -> Result<(), tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        sink.send(frame).await?;
    }

    trace!(id = %id, "Outbound queue released");
    sink.close().await
}
