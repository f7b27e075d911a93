//! Client registry and per-connection records.
//!
//! A [`Connection`] exists only once the WebSocket upgrade has succeeded,
//! so every record starts out `Connected`. The handshake phase
//! (`Connecting`) lives in the server's per-connection task.
//!
//! ```text
//! Connected --remove--> Closing --close--> Closed
//! ```
//!
//! A `Closing` record is out of the registry but still holds the outbound
//! queue. `close` releases the queue, which tells the writer to send
//! its close frame.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Identity of one accepted connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered and eligible for broadcasts.
    Connected,
    /// Removed from the registry, outbound queue not yet released.
    Closing,
    /// Outbound queue released. Terminal.
    Closed,
}

/// A single client connection as seen by the hub.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub state: ConnState,
    pub connected_at: DateTime<Utc>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

impl Connection {
    /// Create a record for a freshly upgraded connection.
    pub fn new(id: ConnectionId, peer: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            peer,
            state: ConnState::Connected,
            connected_at: Utc::now(),
            outbound: Some(outbound),
        }
    }

    /// Address used to label this client's broadcasts.
    ///
    /// IPv4-mapped IPv6 peers are shown in dotted IPv4 form.
    pub fn label(&self) -> IpAddr {
        self.peer.ip().to_canonical()
    }

    /// Queue a frame for the connection's writer.
    ///
    /// Fails when the writer has gone away or the queue was released.
    pub fn send(&self, frame: Message) -> Result<(), mpsc::error::SendError<Message>> {
        match &self.outbound {
            Some(outbound) => outbound.send(frame),
            None => Err(mpsc::error::SendError(frame)),
        }
    }

    /// Leave the connected state. Queued frames are kept.
    pub fn begin_close(&mut self) {
        if self.state == ConnState::Connected {
            self.state = ConnState::Closing;
        }
    }

    /// Release the outbound queue and mark the connection closed.
    pub fn close(&mut self) {
        self.outbound = None;
        self.state = ConnState::Closed;
    }

    /// Time elapsed since the upgrade completed.
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.connected_at
    }
}

/// Registry of connected clients keyed by identity.
///
/// Provides O(1) expected insert, lookup, and remove operations.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    connections: HashMap<ConnectionId, Connection>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connected client.
    ///
    /// Returns the connection back if its id is already registered.
    pub fn insert(&mut self, conn: Connection) -> Result<(), Connection> {
        if conn.state != ConnState::Connected || self.connections.contains_key(&conn.id) {
            return Err(conn);
        }
        self.connections.insert(conn.id, conn);
        Ok(())
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Remove a connection, moving it to `Closing`. Unknown ids yield `None`.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let mut conn = self.connections.remove(&id)?;
        conn.begin_close();
        Some(conn)
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Remove every connection, returning them in `Closing`.
    pub fn drain(&mut self) -> Vec<Connection> {
        self.connections
            .drain()
            .map(|(_, mut conn)| {
                conn.begin_close();
                conn
            })
            .collect()
    }
}
