//! Core functionality for the TCP message broker

pub mod connection;
pub mod envelope;
pub mod frame;
pub mod router;
pub mod server;
pub mod session;

// Re-export main components for convenience
pub use connection::Connection;
pub use envelope::{Envelope, Identity};
pub use router::{BroadcastRouter, Disposition};
pub use server::{BrokerSummary, ChatBroker};
pub use session::{create_registry, lock_registry, Registry, SessionRegistry};
