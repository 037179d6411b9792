//! Pluggable persistence backends for received image payloads

pub mod disk;
pub mod memory;
pub mod traits;

// Re-export the blob sink interface and backends
pub use disk::DiskBlobSink;
pub use memory::MemoryBlobSink;
pub use traits::{BlobSink, StoredBlob};
