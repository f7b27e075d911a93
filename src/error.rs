//! Error taxonomy for the broadcast hub.
//!
//! Only [`HubError::Bind`] is fatal to the process. Everything else is
//! scoped to a single connection and is logged where it happens.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::hub::ConnectionId;

#[derive(Debug, Error)]
pub enum HubError {
    /// The listening socket could not be set up.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The TCP accept call failed.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    /// The WebSocket upgrade failed after the TCP accept succeeded.
    #[error("websocket handshake with {peer} failed: {source}")]
    Handshake {
        peer: SocketAddr,
        #[source]
        source: tungstenite::Error,
    },

    /// The client did not complete the WebSocket upgrade in time.
    #[error("websocket handshake with {peer} timed out after {after:?}")]
    HandshakeTimeout { peer: SocketAddr, after: Duration },

    /// Writing a frame to the client's socket failed.
    #[error("send to connection {id} failed: {source}")]
    Send {
        id: ConnectionId,
        #[source]
        source: tungstenite::Error,
    },

    /// The client's outbound queue has no writer left.
    #[error("outbound queue for connection {id} is closed")]
    QueueClosed { id: ConnectionId },

    /// Transport fault on an established connection.
    #[error("connection {id} failed: {source}")]
    Connection {
        id: ConnectionId,
        #[source]
        source: tungstenite::Error,
    },

    /// The hub task is no longer running.
    #[error("broadcast hub is not running")]
    HubUnavailable,
}

pub type HubResult<T> = Result<T, HubError>;
