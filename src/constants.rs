// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8887;

// Wire framing constants
pub const LENGTH_PREFIX_BYTES: usize = 4;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

// Session timing constants
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

// Image persistence
pub const DEFAULT_UPLOAD_DIR: &str = "uploaded_images";
