//! Abstract persistence interface for received blobs
//!
//! The broker hands decoded image bytes to a `BlobSink` and carries on;
//! where the bytes end up is the backend's concern.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Metadata for a persisted blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBlob {
    pub id: Uuid,
    /// Backend-specific location (a file path, an object key, ...)
    pub location: String,
    pub size: u64,
}

/// Persistence backend for received image payloads
#[async_trait]
pub trait BlobSink: Send + Sync {
    /// Persist `bytes` under a name derived from `name`, returning where
    /// the blob ended up
    async fn store(&self, name: &str, bytes: &[u8]) -> Result<StoredBlob>;
}
