//! The broadcast hub.
//!
//! One task owns the [`ClientRegistry`] and processes every lifecycle and
//! message event from a single command channel, so registry mutations and
//! fan-out iterations are serialized without locks. Connection tasks talk
//! to it through a cloneable [`HubHandle`].
//!
//! ```text
//! reader ──┐                       ┌──> outbound queue ──> writer
//! reader ──┼──> HubCommand ──> Hub ┼──> outbound queue ──> writer
//! reader ──┘                       └──> outbound queue ──> writer
//! ```
//!
//! The hub never touches a socket. Fan-out pushes a frame onto each
//! client's unbounded outbound queue, so per-client ordering follows the
//! order in which the hub accepted messages.

mod record;
mod registry;

pub use record::{payload_text, BroadcastRecord};
pub use registry::{ClientRegistry, ConnState, Connection, ConnectionId};

use std::fmt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{HubError, HubResult};

/// Why a connection left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent a close frame or the stream ended.
    Closed,
    /// Transport error while reading.
    Error(String),
    /// Outbound delivery failed.
    SendFailed(String),
    /// No inbound traffic within the idle timeout.
    IdleTimeout,
    /// Server is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Closed => f.write_str("closed by peer"),
            CloseReason::Error(e) => write!(f, "connection error: {e}"),
            CloseReason::SendFailed(e) => write!(f, "send failed: {e}"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::Shutdown => f.write_str("server shutdown"),
        }
    }
}

/// Commands processed by the hub task.
#[derive(Debug)]
pub enum HubCommand {
    Connect(Connection),
    Message { id: ConnectionId, payload: String },
    Disconnect { id: ConnectionId, reason: CloseReason },
    ClientCount(oneshot::Sender<usize>),
    Shutdown,
}

/// Hub state. Owned by the hub task once [`Hub::run`] starts.
pub struct Hub {
    registry: ClientRegistry,
    include_sender: bool,
}

impl Hub {
    pub fn new(include_sender: bool) -> Self {
        Self {
            registry: ClientRegistry::new(),
            include_sender,
        }
    }

    /// Spawn the hub task and return a handle to it.
    pub fn spawn(self) -> (HubHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        (HubHandle { tx }, task)
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        debug!(include_sender = self.include_sender, "Broadcast hub started");

        while let Some(cmd) = rx.recv().await {
            match cmd {
                HubCommand::Connect(conn) => self.accept_connection(conn),
                HubCommand::Message { id, payload } => {
                    self.on_message(id, &payload);
                }
                HubCommand::Disconnect { id, reason } => {
                    self.on_close(id, reason);
                }
                HubCommand::ClientCount(reply) => {
                    let _ = reply.send(self.registry.len());
                }
                HubCommand::Shutdown => break,
            }
        }

        self.close_all();
        debug!("Broadcast hub stopped");
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Register a freshly upgraded connection.
    pub fn accept_connection(&mut self, conn: Connection) {
        let id = conn.id;
        let peer = conn.peer;
        match self.registry.insert(conn) {
            Ok(()) => {
                info!(id = %id, peer = %peer, clients = self.registry.len(), "Connection established");
            }
            Err(_) => {
                warn!(id = %id, peer = %peer, "Connection already registered, ignoring");
            }
        }
    }

    /// Label an inbound payload and fan it out.
    ///
    /// Returns the number of clients the record was delivered to.
    pub fn on_message(&mut self, id: ConnectionId, payload: &str) -> usize {
        let Some(conn) = self.registry.get(id) else {
            debug!(id = %id, "Message from unregistered connection dropped");
            return 0;
        };

        let record = BroadcastRecord::new(conn.label(), payload);
        info!(id = %id, "{record}");

        let origin = (!self.include_sender).then_some(id);
        self.broadcast(&record, origin)
    }

    /// Remove a connection. Unknown ids are ignored.
    pub fn on_close(&mut self, id: ConnectionId, reason: CloseReason) -> bool {
        match self.registry.remove(id) {
            Some(mut conn) => {
                let uptime_ms = conn.uptime().num_milliseconds();
                match &reason {
                    CloseReason::Closed | CloseReason::Shutdown => {
                        info!(id = %id, peer = %conn.peer, uptime_ms, %reason, clients = self.registry.len(), "Connection closed");
                    }
                    _ => {
                        warn!(id = %id, peer = %conn.peer, uptime_ms, %reason, clients = self.registry.len(), "Connection closed");
                    }
                }
                conn.close();
                true
            }
            None => {
                debug!(id = %id, %reason, "Close for unknown connection ignored");
                false
            }
        }
    }

    /// Send a record to every registered client except `skip`.
    ///
    /// Clients whose outbound queue is gone are removed. Returns the number
    /// of successful deliveries.
    pub fn broadcast(&mut self, record: &BroadcastRecord, skip: Option<ConnectionId>) -> usize {
        let frame = record.to_frame();
        let mut delivered = 0;
        let mut failed = Vec::new();

        for conn in self.registry.iter() {
            if Some(conn.id) == skip {
                continue;
            }
            match conn.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => failed.push(conn.id),
            }
        }

        for id in failed {
            let err = HubError::QueueClosed { id };
            warn!(error = %err, "Broadcast delivery failed");
            self.on_close(id, CloseReason::SendFailed(err.to_string()));
        }

        debug!(delivered, clients = self.registry.len(), "Broadcast complete");
        delivered
    }

    /// Drop every client. Their writers see the queue close and send a
    /// close frame.
    fn close_all(&mut self) {
        let closing = self.registry.drain();
        if !closing.is_empty() {
            info!(clients = closing.len(), reason = %CloseReason::Shutdown, "Closing all connections");
        }
        for mut conn in closing {
            conn.close();
        }
    }
}

/// Cloneable handle used by connection tasks to reach the hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn connect(&self, conn: Connection) -> HubResult<()> {
        self.send(HubCommand::Connect(conn))
    }

    pub fn message(&self, id: ConnectionId, payload: String) -> HubResult<()> {
        self.send(HubCommand::Message { id, payload })
    }

    pub fn disconnect(&self, id: ConnectionId, reason: CloseReason) -> HubResult<()> {
        self.send(HubCommand::Disconnect { id, reason })
    }

    /// Number of registered clients, as seen by the hub after every
    /// previously queued command has been processed.
    pub async fn client_count(&self) -> HubResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::ClientCount(reply))?;
        rx.await.map_err(|_| HubError::HubUnavailable)
    }

    pub fn shutdown(&self) -> HubResult<()> {
        self.send(HubCommand::Shutdown)
    }

    fn send(&self, cmd: HubCommand) -> HubResult<()> {
        self.tx.send(cmd).map_err(|_| HubError::HubUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio_test::{assert_err, assert_ok};
    use tokio_tungstenite::tungstenite::Message;

    struct Client {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl Client {
        fn recv_all(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg.to_text().unwrap().to_string());
            }
            out
        }
    }

    fn connect(hub: &mut Hub, id: u64, ip: [u8; 4]) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = SocketAddr::from((ip, 50000));
        let id = ConnectionId::new(id);
        hub.accept_connection(Connection::new(id, peer, tx));
        Client { id, rx }
    }

    #[test]
    fn test_message_reaches_every_client() {
        let mut hub = Hub::new(true);
        let mut clients: Vec<Client> = (0..5).map(|i| connect(&mut hub, i, [127, 0, 0, 1])).collect();

        let delivered = hub.on_message(clients[2].id, "hello");
        assert_eq!(delivered, 5);

        for client in &mut clients {
            assert_eq!(client.recv_all(), vec!["\"127.0.0.1: hello\""]);
        }
    }

    #[test]
    fn test_label_uses_sender_address() {
        let mut hub = Hub::new(true);
        let a = connect(&mut hub, 1, [10, 0, 0, 1]);
        let mut b = connect(&mut hub, 2, [10, 0, 0, 2]);

        hub.on_message(a.id, "from a");
        assert_eq!(b.recv_all(), vec!["\"10.0.0.1: from a\""]);
    }

    #[test]
    fn test_empty_payload_is_broadcast() {
        let mut hub = Hub::new(true);
        let mut a = connect(&mut hub, 1, [127, 0, 0, 1]);

        assert_eq!(hub.on_message(a.id, ""), 1);
        assert_eq!(a.recv_all(), vec!["\"127.0.0.1: \""]);
    }

    #[test]
    fn test_exclude_sender_policy() {
        let mut hub = Hub::new(false);
        let mut a = connect(&mut hub, 1, [127, 0, 0, 1]);
        let mut b = connect(&mut hub, 2, [127, 0, 0, 1]);

        assert_eq!(hub.on_message(a.id, "hi"), 1);
        assert!(a.recv_all().is_empty());
        assert_eq!(b.recv_all(), vec!["\"127.0.0.1: hi\""]);
    }

    #[test]
    fn test_closed_client_receives_nothing() {
        let mut hub = Hub::new(true);
        let mut a = connect(&mut hub, 1, [127, 0, 0, 1]);
        let mut b = connect(&mut hub, 2, [127, 0, 0, 1]);

        hub.on_message(a.id, "ping");
        assert_eq!(a.recv_all(), vec!["\"127.0.0.1: ping\""]);
        assert_eq!(b.recv_all(), vec!["\"127.0.0.1: ping\""]);

        assert!(hub.on_close(b.id, CloseReason::Closed));
        assert!(!hub.registry().contains(b.id));

        assert_eq!(hub.on_message(a.id, "ping2"), 1);
        assert_eq!(a.recv_all(), vec!["\"127.0.0.1: ping2\""]);
        // Dropping the record closes b's queue instead of delivering.
        assert!(b.recv_all().is_empty());
        assert_eq!(b.rx.try_recv().unwrap_err(), TryRecvError::Disconnected);
    }

    #[test]
    fn test_double_close_is_harmless() {
        let mut hub = Hub::new(true);
        let a = connect(&mut hub, 1, [127, 0, 0, 1]);
        let b = connect(&mut hub, 2, [127, 0, 0, 1]);

        assert!(hub.on_close(a.id, CloseReason::Closed));
        assert!(!hub.on_close(a.id, CloseReason::Closed));

        assert_eq!(hub.registry().len(), 1);
        assert!(hub.registry().contains(b.id));
    }

    #[test]
    fn test_message_from_unknown_connection_dropped() {
        let mut hub = Hub::new(true);
        let mut a = connect(&mut hub, 1, [127, 0, 0, 1]);

        assert_eq!(hub.on_message(ConnectionId::new(99), "ghost"), 0);
        assert!(a.recv_all().is_empty());
    }

    #[test]
    fn test_failed_send_removes_client() {
        let mut hub = Hub::new(true);
        let mut a = connect(&mut hub, 1, [127, 0, 0, 1]);
        let b = connect(&mut hub, 2, [127, 0, 0, 1]);
        let b_id = b.id;
        drop(b);

        assert_eq!(hub.on_message(a.id, "x"), 1);
        assert!(!hub.registry().contains(b_id));
        assert_eq!(hub.registry().len(), 1);
        assert_eq!(a.recv_all(), vec!["\"127.0.0.1: x\""]);
    }

    #[test]
    fn test_per_client_order_preserved() {
        let mut hub = Hub::new(true);
        let a = connect(&mut hub, 1, [127, 0, 0, 1]);
        let mut b = connect(&mut hub, 2, [127, 0, 0, 2]);

        for i in 0..10 {
            hub.on_message(a.id, &i.to_string());
        }

        let expected: Vec<String> = (0..10).map(|i| format!("\"127.0.0.1: {i}\"")).collect();
        assert_eq!(b.recv_all(), expected);
    }

    #[test]
    fn test_duplicate_connect_keeps_original() {
        let mut hub = Hub::new(true);
        let mut a = connect(&mut hub, 1, [127, 0, 0, 1]);
        let mut imposter = connect(&mut hub, 1, [10, 9, 9, 9]);

        assert_eq!(hub.registry().len(), 1);
        hub.on_message(a.id, "m");
        assert_eq!(a.recv_all(), vec!["\"127.0.0.1: m\""]);
        assert!(imposter.recv_all().is_empty());
    }

    #[tokio::test]
    async fn test_handle_drives_task() {
        let (handle, task) = Hub::new(true).spawn();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new(7);
        let peer = SocketAddr::from(([127, 0, 0, 1], 1234));

        assert_ok!(handle.connect(Connection::new(id, peer, tx)));
        assert_ok!(handle.message(id, "hello".to_string()));
        assert_eq!(handle.client_count().await.unwrap(), 1);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.to_text().unwrap(), "\"127.0.0.1: hello\"");

        assert_ok!(handle.disconnect(id, CloseReason::Closed));
        assert_eq!(handle.client_count().await.unwrap(), 0);
        assert!(rx.recv().await.is_none());

        assert_ok!(handle.shutdown());
        task.await.unwrap();
        assert_err!(handle.message(id, "late".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let (handle, task) = Hub::new(true).spawn();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new(1);

        assert_ok!(handle.connect(Connection::new(id, SocketAddr::from(([127, 0, 0, 1], 1)), tx)));
        assert_ok!(handle.shutdown());
        task.await.unwrap();

        assert!(rx.recv().await.is_none());
        assert!(matches!(handle.client_count().await, Err(HubError::HubUnavailable)));
    }
}
