//! Default configuration values
//!
//! Single source of truth for defaults. Constants are exposed for code and
//! tests; the functions back `#[serde(default = "...")]` attributes.

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Default log level
pub const LOG_LEVEL: &str = "info";

/// Default outbound connect timeout in seconds
pub const DIAL_TIMEOUT_SECS: u64 = 10;

/// Default classification/handshake deadline in seconds
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Default copy buffer size in bytes
pub const BUFFER_SIZE: usize = 4096;

/// Lifetime of a client-side protocol cache entry in seconds
pub const PROTOCOL_CACHE_TTL_SECS: u64 = 300;

/// Default log level
pub fn log_level() -> String {
    LOG_LEVEL.to_string()
}

/// Default dial timeout
pub fn dial_timeout() -> u64 {
    DIAL_TIMEOUT_SECS
}

/// Default handshake timeout
pub fn handshake_timeout() -> u64 {
    HANDSHAKE_TIMEOUT_SECS
}

/// Default buffer size
pub fn buffer_size() -> usize {
    BUFFER_SIZE
}

/// Instances are enabled unless stated otherwise
pub fn enabled() -> bool {
    true
}

/// Session caching is on unless stated otherwise
pub fn session_cache() -> bool {
    true
}
