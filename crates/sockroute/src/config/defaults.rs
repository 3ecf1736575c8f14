//! Default configuration values

pub struct WebSocketDefaults;

impl WebSocketDefaults {
    pub const WRITE_TIMEOUT_SECS: u64 = 10;
    pub const PING_INTERVAL_SECS: u64 = 5;
    pub const CLOSE_TIMEOUT_SECS: u64 = 2;
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024; // 4MB
    pub const BROADCAST_QUEUE_SIZE: usize = 256;
    pub const BROADCAST_CONCURRENCY: usize = 64;
}
