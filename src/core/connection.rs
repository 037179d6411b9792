//! Connection management
//! Registry-facing handle for one accepted client connection

use log::warn;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::core::envelope::Identity;

/// Represents the state of a single client connection.
///
/// The transport halves are owned by the session's reader and writer
/// tasks; this handle only carries the serialized-writer channel, so all
/// frames for one peer funnel through a single writer.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: u64,
    pub addr: SocketAddr,
    /// Pre-framed bytes destined for this peer
    pub sender: mpsc::UnboundedSender<Vec<u8>>,
    /// Absent until the session announces itself
    pub identity: Option<Identity>,
    pub connected_at: Instant,
}

impl Connection {
    /// Create a new connection handle for a freshly accepted socket
    pub fn new(id: u64, addr: SocketAddr, sender: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id,
            addr,
            sender,
            identity: None,
            connected_at: Instant::now(),
        }
    }

    /// Queue one encoded frame for this peer's writer
    pub fn send_frame(&self, frame: Vec<u8>) -> bool {
        match self.sender.send(frame) {
            Ok(_) => true,
            Err(_) => {
                warn!("Failed to queue frame for session CONN_{}", self.id);
                false
            }
        }
    }

    /// The announced display name, if any
    pub fn display_name(&self) -> Option<&str> {
        self.identity.as_ref().map(|identity| identity.username.as_str())
    }

    /// Calculate the connection duration
    pub fn connection_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
