//! Disk-backed blob sink
//!
//! Stores each received image under the upload directory with a
//! timestamped, path-sanitized filename so a hostile peer cannot steer
//! writes outside the directory.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::storage::traits::{BlobSink, StoredBlob};

pub struct DiskBlobSink {
    upload_dir: PathBuf,
}

impl DiskBlobSink {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }
}

/// Keep only the final path component and strip characters that are
/// unsafe in filenames
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "unnamed".to_string(),
        _ => cleaned,
    }
}

#[async_trait]
impl BlobSink for DiskBlobSink {
    async fn store(&self, name: &str, bytes: &[u8]) -> Result<StoredBlob> {
        fs::create_dir_all(&self.upload_dir).await.map_err(|e| {
            RelayError::Persistence(format!(
                "failed to create upload directory {}: {}",
                self.upload_dir.display(),
                e
            ))
        })?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let filename = format!("{}_{}", stamp, sanitize_filename(name));
        let path = self.upload_dir.join(&filename);

        fs::write(&path, bytes).await.map_err(|e| {
            RelayError::Persistence(format!("failed to write {}: {}", path.display(), e))
        })?;

        Ok(StoredBlob {
            id: Uuid::new_v4(),
            location: path.display().to_string(),
            size: bytes.len() as u64,
        })
    }
}
