use std::error::Error;
use std::fmt;
use std::sync::PoisonError;

#[derive(Debug)]
pub enum RelayError {
    // Session errors
    SessionLock(String),
    SessionNotFound(u64),

    // Connection errors
    Connection(String),
    ConnectionClosed,

    // Framing errors
    FrameTooLarge(usize),
    PayloadTooLarge(usize),

    // Envelope errors
    Serialize(String),

    // Persistence errors
    Persistence(String),

    // Startup errors
    Bind(String),
    Config(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionLock(msg) => write!(f, "Session lock error: {}", msg),
            Self::SessionNotFound(id) => write!(f, "Session not found: CONN_{}", id),
            Self::Connection(msg) => write!(f, "Connection error: {}", msg),
            Self::ConnectionClosed => write!(f, "Connection closed by peer"),
            Self::FrameTooLarge(len) => write!(f, "Frame too large: {} bytes declared", len),
            Self::PayloadTooLarge(len) => {
                write!(f, "Payload too large to frame: {} bytes", len)
            }
            Self::Serialize(msg) => write!(f, "Serialization error: {}", msg),
            Self::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            Self::Bind(msg) => write!(f, "Bind failure: {}", msg),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for RelayError {}

// Converting from PoisonError to facilitate poisoned mutex handling
impl<T> From<PoisonError<T>> for RelayError {
    fn from(err: PoisonError<T>) -> Self {
        RelayError::SessionLock(format!("Mutex poisoned: {}", err))
    }
}

// Generic result type for the relay
pub type Result<T> = std::result::Result<T, RelayError>;
