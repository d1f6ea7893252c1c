//! Abstract session storage interface for pluggable backends
//!
//! A backend maintains three indices (token → record, user → tokens,
//! (user, device) → token) plus a small TTL'd key space used by secondary
//! authentication. Every backend honours the same contract: a record whose
//! expiry has been reached is reported as absent, and removing a record
//! removes every index entry and secondary-auth entry tied to its token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::identity::{Device, Identity};
use crate::error::Result;

/// Session state stored against an access token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Start of the current window after an auto-renewal
    #[serde(default)]
    pub renewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remember_me: bool,
    pub identity: Identity,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl TokenRecord {
    pub fn user_id(&self) -> u64 {
        self.identity.user_id
    }

    pub fn device(&self) -> Device {
        self.identity.device
    }

    /// Expired once the clock reaches `expires_at`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.renewed_at.unwrap_or(self.issued_at)
    }

    /// Length of the current validity window
    pub fn window(&self) -> chrono::Duration {
        self.expires_at - self.window_start()
    }

    /// Fraction of the current window already used, clamped to [0, 1]
    pub fn elapsed_ratio(&self, now: DateTime<Utc>) -> f64 {
        let window = self.window().num_milliseconds();
        if window <= 0 {
            return 1.0;
        }
        let elapsed = (now - self.window_start()).num_milliseconds();
        (elapsed as f64 / window as f64).clamp(0.0, 1.0)
    }
}

/// Session storage interface
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or overwrite a record and index it by user and device
    async fn save(&self, record: TokenRecord) -> Result<()>;

    /// Get a live record; expired records read as `None`
    async fn get(&self, token: &str) -> Result<Option<TokenRecord>>;

    /// Read a record without filtering on expiry. A backend with native
    /// expiry may already have dropped it.
    async fn peek(&self, token: &str) -> Result<Option<TokenRecord>>;

    /// Remove a record and everything tied to its token.
    /// Removing an absent token is not an error.
    async fn remove(&self, token: &str) -> Result<Option<TokenRecord>>;

    /// Live tokens held by a user
    async fn tokens_of(&self, user_id: u64) -> Result<Vec<String>>;

    /// Remove every session of a user, returning what was removed
    async fn remove_all(&self, user_id: u64) -> Result<Vec<TokenRecord>>;

    /// Token currently bound to a (user, device) pair. The binding follows
    /// the last `save` for that pair, so re-saving an older session (renewal,
    /// refresh) re-points it.
    async fn device_token(&self, user_id: u64, device: Device) -> Result<Option<String>>;

    /// Remove the session bound to a (user, device) pair. Other sessions of
    /// the same pair, possible in multi mode, are left in place.
    async fn remove_device(&self, user_id: u64, device: Device) -> Result<Option<TokenRecord>>;

    /// Store a short-lived value
    async fn put_ephemeral(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get_ephemeral(&self, key: &str) -> Result<Option<String>>;

    async fn remove_ephemeral(&self, key: &str) -> Result<Option<String>>;

    /// Atomically delete `key` if it currently holds `expected`
    async fn take_ephemeral_if(&self, key: &str, expected: &str) -> Result<bool>;

    /// Name of the backend for logging/debugging
    fn backend_name(&self) -> &'static str;

    /// Health check for the storage backend
    async fn health_check(&self) -> Result<bool>;
}

/// Shared reference to a session store
pub type SharedSessionStore = Arc<dyn SessionStore>;

/// Logical keys for the ephemeral key space
pub mod keys {
    pub fn second_auth(subject: &str) -> String {
        format!("second_auth:{}", subject)
    }

    pub fn second_auth_code(subject: &str) -> String {
        format!("second_auth_code:{}", subject)
    }

    /// Ephemeral keys that die with a token
    pub fn token_scoped(token: &str) -> [String; 2] {
        [second_auth(token), second_auth_code(token)]
    }
}

pub(crate) fn ttl_to_chrono(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl).map_err(|e| {
        crate::error::AuthError::InvalidConfig(format!("ttl {:?} out of range: {}", ttl, e))
    })
}

/// `start + ttl`, failing instead of panicking past the calendar range
pub(crate) fn expires_after(start: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    start.checked_add_signed(ttl_to_chrono(ttl)?).ok_or_else(|| {
        crate::error::AuthError::InvalidConfig(format!("ttl {:?} reaches past the supported date range", ttl))
    })
}
