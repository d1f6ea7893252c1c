// Token lifetime defaults
pub const DEFAULT_ACCESS_TOKEN_TTL_SECS: u64 = 2 * 3600;
pub const DEFAULT_REFRESH_TOKEN_TTL_SECS: u64 = 7 * 24 * 3600;
pub const MAX_TOKEN_TTL_SECS: u64 = 100 * 365 * 24 * 3600;

// Auto-renew kicks in once this fraction of the session window has elapsed
pub const DEFAULT_RENEW_THRESHOLD: f64 = 0.5;

// Secondary authentication
pub const SECOND_AUTH_CODE_LENGTH: usize = 6;
pub const DEFAULT_SECOND_AUTH_CODE_TTL_SECS: u64 = 5 * 60;
pub const DEFAULT_SECOND_AUTH_TTL_SECS: u64 = 10 * 60;

// Remote store
pub const DEFAULT_KEY_PREFIX: &str = "rusty_sessions:";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

// Listener dispatch
pub const DEFAULT_MAX_QUEUED_EVENTS: usize = 1000;

// Opaque token entropy, in bytes
pub const OPAQUE_TOKEN_BYTES: usize = 32;

// Number of stripes in the per-user operation lock
pub const USER_LOCK_STRIPES: usize = 64;

// Characters of the SHA-256 fingerprint shown in logs
pub const TOKEN_FINGERPRINT_LEN: usize = 12;
