//! In-memory blob sink for development and testing

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::storage::traits::{BlobSink, StoredBlob};

pub struct MemoryBlobSink {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobSink {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, location: &str) -> Option<Vec<u8>> {
        self.blobs.read().await.get(location).cloned()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

impl Default for MemoryBlobSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobSink for MemoryBlobSink {
    async fn store(&self, name: &str, bytes: &[u8]) -> Result<StoredBlob> {
        let id = Uuid::new_v4();
        let location = format!("mem://{}/{}", id, name);
        self.blobs
            .write()
            .await
            .insert(location.clone(), bytes.to_vec());
        Ok(StoredBlob {
            id,
            location,
            size: bytes.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_read_back() {
        let sink = MemoryBlobSink::new();
        assert!(sink.is_empty().await);

        let stored = sink.store("img.png", &[1, 2, 3]).await.unwrap();
        assert_eq!(stored.size, 3);
        assert_eq!(sink.len().await, 1);
        assert_eq!(sink.get(&stored.location).await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_same_name_gets_distinct_locations() {
        let sink = MemoryBlobSink::new();
        let first = sink.store("img.png", b"a").await.unwrap();
        let second = sink.store("img.png", b"b").await.unwrap();
        assert_ne!(first.location, second.location);
        assert_eq!(sink.len().await, 2);
    }
}
