/// Application name
pub const APP_NAME: &str = "Parley";

/// Delimiter joining the two sorted participant ids of a conversation
pub const CONVERSATION_DELIMITER: char = '_';

/// A user is online while their last heartbeat is younger than this (5 min)
pub const DEFAULT_ONLINE_THRESHOLD_SECS: u64 = 300;

/// Interval at which clients are expected to call the heartbeat endpoint
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Presence records idle longer than this are evicted (1 hour)
pub const DEFAULT_PRESENCE_RETENTION_SECS: u64 = 3600;

/// Upper bound on connect-time credential verification
pub const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 5;

/// Upper bound on a single push to a live connection
pub const DEFAULT_PUSH_TIMEOUT_SECS: u64 = 3;

/// Upper bound on one message append
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 5;

/// Minimum spacing between two key set refreshes triggered by unknown key ids
pub const DEFAULT_JWKS_MIN_REFRESH_SECS: u64 = 30;

/// Outbound frames buffered per live connection
pub const DEFAULT_SOCKET_BUFFER: usize = 64;

/// Maximum message text length in characters
pub const MAX_TEXT_CHARS: usize = 4000;

/// Maximum attachment URI length in bytes
pub const MAX_ATTACHMENT_URI_LEN: usize = 2048;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
