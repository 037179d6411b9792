//! Structured connection event logging
//!
//! Lifecycle and error events flow through one global logger so every
//! record carries the session id it belongs to and per-kind counts stay
//! queryable for the shutdown report.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;

/// Connection lifecycle and error events
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ClientConnected {
        session_id: u64,
        addr: SocketAddr,
        total_connections: u64,
    },
    ClientDisconnected {
        session_id: u64,
        active_connections: usize,
    },
    IdentityAttached {
        session_id: u64,
        username: String,
    },
    MessageRouted {
        session_id: u64,
        kind: &'static str,
        delivered: usize,
    },
    ImageStored {
        session_id: u64,
        location: String,
        size: u64,
    },
    DeliveryFailed {
        target_id: u64,
    },
    PersistenceFailed {
        session_id: u64,
        reason: String,
    },
    FrameRejected {
        session_id: u64,
        declared_len: usize,
    },
    ServerShutdown {
        total_connections: u64,
        total_messages: u64,
        sessions_drained: usize,
    },
}

/// Event logger tracking per-kind counts
pub struct EventLogger {
    event_counts: Arc<RwLock<HashMap<&'static str, usize>>>,
}

impl EventLogger {
    pub fn new() -> Self {
        Self {
            event_counts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record and emit one event
    pub async fn log_event(&self, event: ConnectionEvent) {
        {
            let mut counts = self.event_counts.write().await;
            *counts.entry(Self::event_key(&event)).or_insert(0) += 1;
        }

        match event {
            ConnectionEvent::ClientConnected {
                session_id,
                addr,
                total_connections,
            } => {
                log::info!(
                    "CONN: client connected - session: CONN_{}, peer: {}, total: {}",
                    session_id,
                    addr,
                    total_connections
                );
            }
            ConnectionEvent::ClientDisconnected {
                session_id,
                active_connections,
            } => {
                log::info!(
                    "CONN: client disconnected - session: CONN_{}, active: {}",
                    session_id,
                    active_connections
                );
            }
            ConnectionEvent::IdentityAttached {
                session_id,
                username,
            } => {
                log::info!(
                    "CONN: identity attached - session: CONN_{}, username: {}",
                    session_id,
                    username
                );
            }
            ConnectionEvent::MessageRouted {
                session_id,
                kind,
                delivered,
            } => {
                log::debug!(
                    "CONN: message routed - session: CONN_{}, kind: {}, delivered: {}",
                    session_id,
                    kind,
                    delivered
                );
            }
            ConnectionEvent::ImageStored {
                session_id,
                location,
                size,
            } => {
                log::info!(
                    "CONN: image stored - session: CONN_{}, location: {}, bytes: {}",
                    session_id,
                    location,
                    size
                );
            }
            ConnectionEvent::DeliveryFailed { target_id } => {
                log::warn!(
                    "CONN: delivery failed - target: CONN_{}, dropping target from registry",
                    target_id
                );
            }
            ConnectionEvent::PersistenceFailed { session_id, reason } => {
                log::error!(
                    "CONN: persistence failed - session: CONN_{}, reason: {}",
                    session_id,
                    reason
                );
            }
            ConnectionEvent::FrameRejected {
                session_id,
                declared_len,
            } => {
                log::warn!(
                    "CONN: frame rejected - session: CONN_{}, declared length: {} bytes",
                    session_id,
                    declared_len
                );
            }
            ConnectionEvent::ServerShutdown {
                total_connections,
                total_messages,
                sessions_drained,
            } => {
                log::info!(
                    "CONN: server shutdown - connections: {}, messages: {}, drained: {}",
                    total_connections,
                    total_messages,
                    sessions_drained
                );
            }
        }
    }

    fn event_key(event: &ConnectionEvent) -> &'static str {
        match event {
            ConnectionEvent::ClientConnected { .. } => "client_connected",
            ConnectionEvent::ClientDisconnected { .. } => "client_disconnected",
            ConnectionEvent::IdentityAttached { .. } => "identity_attached",
            ConnectionEvent::MessageRouted { .. } => "message_routed",
            ConnectionEvent::ImageStored { .. } => "image_stored",
            ConnectionEvent::DeliveryFailed { .. } => "delivery_failed",
            ConnectionEvent::PersistenceFailed { .. } => "persistence_failed",
            ConnectionEvent::FrameRejected { .. } => "frame_rejected",
            ConnectionEvent::ServerShutdown { .. } => "server_shutdown",
        }
    }

    /// Get event statistics
    pub async fn event_stats(&self) -> HashMap<&'static str, usize> {
        self.event_counts.read().await.clone()
    }
}

impl Default for EventLogger {
    fn default() -> Self {
        Self::new()
    }
}

/// Global event logger instance - thread-safe singleton
static EVENT_LOGGER: OnceLock<Arc<EventLogger>> = OnceLock::new();

fn global() -> Arc<EventLogger> {
    EVENT_LOGGER
        .get_or_init(|| Arc::new(EventLogger::new()))
        .clone()
}

/// Log a connection event using the global logger
pub async fn log_connection_event(event: ConnectionEvent) {
    global().log_event(event).await;
}

/// Per-kind counts accumulated by the global logger
pub async fn connection_event_stats() -> HashMap<&'static str, usize> {
    global().event_stats().await
}
