//! broadcast-hub: a WebSocket broadcast server
//!
//! Every message a client sends is labeled with the sender's address and
//! relayed, JSON-encoded, to all connected clients.
//!
//! Features:
//! - Identity-keyed client registry owned by a single hub task
//! - Configurable sender inclusion
//! - Optional idle-connection timeout
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod error;
pub mod hub;
pub mod server;

pub use config::Config;
pub use error::{HubError, HubResult};
pub use hub::{BroadcastRecord, Hub, HubHandle};
pub use server::Server;
