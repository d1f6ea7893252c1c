//! Library configuration module
//! Handles token lifetimes, login policy and storage backend selection

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;

use crate::auth::token::TokenStyle;
use crate::constants::{
    DEFAULT_ACCESS_TOKEN_TTL_SECS, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_KEY_PREFIX,
    DEFAULT_MAX_QUEUED_EVENTS, DEFAULT_REDIS_URL, DEFAULT_REFRESH_TOKEN_TTL_SECS,
    DEFAULT_RENEW_THRESHOLD, DEFAULT_SECOND_AUTH_CODE_TTL_SECS, DEFAULT_SECOND_AUTH_TTL_SECS,
    MAX_TOKEN_TTL_SECS,
};
use crate::error::{AuthError, Result};

/// How many concurrent sessions a user may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginMode {
    /// One session per user; a new login evicts every other device
    Single,
    /// Unlimited sessions per user
    Multi,
    /// One session per (user, device); other devices are left alone
    Exclusive,
}

impl FromStr for LoginMode {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "multi" | "multiple" => Ok(Self::Multi),
            "exclusive" => Ok(Self::Exclusive),
            other => Err(AuthError::InvalidConfig(format!("unknown login mode '{}'", other))),
        }
    }
}

impl fmt::Display for LoginMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Single => "single",
            Self::Multi => "multi",
            Self::Exclusive => "exclusive",
        };
        f.write_str(name)
    }
}

/// Where session state lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Redis,
}

impl FromStr for StorageBackend {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "in-process" => Ok(Self::Memory),
            "redis" | "remote" => Ok(Self::Redis),
            other => Err(AuthError::InvalidConfig(format!("unknown storage backend '{}'", other))),
        }
    }
}

/// Connection parameters for the Redis backend
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// Namespace prepended to every key
    pub key_prefix: String,
    /// Applied once, to the construction-time ping
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Authentication configuration parameters
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HMAC secret for token signing/validation
    pub secret: String,
    /// Signing algorithm, restricted to the HS family
    pub algorithm: Algorithm,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub token_style: TokenStyle,
    pub login_mode: LoginMode,
    pub backend: StorageBackend,
    pub redis: RedisConfig,
    /// Extend sessions that are used after `renew_threshold` of their window
    pub auto_renew: bool,
    pub renew_threshold: f64,
    pub second_auth_code_ttl: Duration,
    /// Default lifetime of the "verified" flag
    pub second_auth_ttl: Duration,
    /// Capacity of each listener's event queue
    pub max_queued_events: usize,
}

impl AuthConfig {
    /// Create a configuration with defaults for everything but the secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            algorithm: Algorithm::HS256,
            access_token_ttl: Duration::from_secs(DEFAULT_ACCESS_TOKEN_TTL_SECS),
            refresh_token_ttl: Duration::from_secs(DEFAULT_REFRESH_TOKEN_TTL_SECS),
            token_style: TokenStyle::JwtWithId,
            login_mode: LoginMode::Multi,
            backend: StorageBackend::Memory,
            redis: RedisConfig::default(),
            auto_renew: false,
            renew_threshold: DEFAULT_RENEW_THRESHOLD,
            second_auth_code_ttl: Duration::from_secs(DEFAULT_SECOND_AUTH_CODE_TTL_SECS),
            second_auth_ttl: Duration::from_secs(DEFAULT_SECOND_AUTH_TTL_SECS),
            max_queued_events: DEFAULT_MAX_QUEUED_EVENTS,
        }
    }

    pub fn with_login_mode(mut self, mode: LoginMode) -> Self {
        self.login_mode = mode;
        self
    }

    pub fn with_token_style(mut self, style: TokenStyle) -> Self {
        self.token_style = style;
        self
    }

    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_token_ttl = ttl;
        self
    }

    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_token_ttl = ttl;
        self
    }

    pub fn with_auto_renew(mut self, threshold: f64) -> Self {
        self.auto_renew = true;
        self.renew_threshold = threshold;
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_redis(mut self, redis: RedisConfig) -> Self {
        self.backend = StorageBackend::Redis;
        self.redis = redis;
        self
    }

    /// Check internal consistency; secret strength is only enforced by `from_env`
    pub fn validate(&self) -> Result<()> {
        if self.secret.is_empty() {
            return Err(AuthError::InvalidConfig("signing secret must not be empty".to_string()));
        }
        if !matches!(self.algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(AuthError::InvalidConfig(format!(
                "algorithm {:?} is not a symmetric HMAC algorithm",
                self.algorithm
            )));
        }
        if self.access_token_ttl.is_zero() || self.refresh_token_ttl.is_zero() {
            return Err(AuthError::InvalidConfig("token lifetimes must be positive".to_string()));
        }
        if self.refresh_token_ttl < self.access_token_ttl {
            return Err(AuthError::InvalidConfig(
                "refresh token lifetime must not be shorter than access token lifetime".to_string(),
            ));
        }
        if !(self.renew_threshold > 0.0 && self.renew_threshold < 1.0) {
            return Err(AuthError::InvalidConfig(format!(
                "renew threshold must lie in (0, 1), got {}",
                self.renew_threshold
            )));
        }
        if self.second_auth_code_ttl.is_zero() {
            return Err(AuthError::InvalidConfig("second-auth code lifetime must be positive".to_string()));
        }
        let max_ttl = Duration::from_secs(MAX_TOKEN_TTL_SECS);
        for (name, ttl) in [
            ("access token", self.access_token_ttl),
            ("refresh token", self.refresh_token_ttl),
            ("second-auth code", self.second_auth_code_ttl),
            ("second-auth", self.second_auth_ttl),
        ] {
            if ttl > max_ttl {
                return Err(AuthError::InvalidConfig(format!(
                    "{} lifetime {}s exceeds the maximum of {}s",
                    name,
                    ttl.as_secs(),
                    MAX_TOKEN_TTL_SECS
                )));
            }
        }
        if self.max_queued_events == 0 {
            return Err(AuthError::InvalidConfig("max queued events must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Validate that a secret meets security requirements
    fn validate_secret(secret: &str) -> Result<()> {
        if secret.len() < 32 {
            return Err(AuthError::InvalidConfig(
                "signing secret must be at least 32 characters long".to_string(),
            ));
        }

        let insecure_patterns = [
            "your-secret-key",
            "change-this",
            "test-secret",
            "default",
            "secret",
            "password",
            "12345",
        ];

        for pattern in &insecure_patterns {
            if secret.contains(pattern) {
                return Err(AuthError::InvalidConfig(format!(
                    "signing secret contains insecure pattern '{}'. Generate one with: openssl rand -base64 32",
                    pattern
                )));
            }
        }

        if secret.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(AuthError::InvalidConfig(
                "signing secret should contain mixed characters (letters, numbers, symbols)".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from environment variables (and `.env` if present)
    pub fn from_env() -> Result<Self> {
        if dotenvy::dotenv().is_ok() {
            log::debug!("Environment variables loaded from .env file");
        }

        let secret = env::var("RUSTY_SESSIONS_SECRET")
            .or_else(|_| env::var("JWT_SECRET"))
            .map_err(|_| {
                AuthError::InvalidConfig(
                    "RUSTY_SESSIONS_SECRET environment variable is required. \
                     Generate one with: openssl rand -base64 32"
                        .to_string(),
                )
            })?;
        Self::validate_secret(&secret)?;

        let mut config = Self::new(secret);

        if let Ok(alg) = env::var("RUSTY_SESSIONS_ALGORITHM") {
            config.algorithm = match alg.trim().to_uppercase().as_str() {
                "HS256" => Algorithm::HS256,
                "HS384" => Algorithm::HS384,
                "HS512" => Algorithm::HS512,
                other => {
                    return Err(AuthError::InvalidConfig(format!(
                        "unsupported signing algorithm '{}'",
                        other
                    )))
                }
            };
        }

        config.access_token_ttl = env_secs("RUSTY_SESSIONS_ACCESS_TTL", DEFAULT_ACCESS_TOKEN_TTL_SECS);
        config.refresh_token_ttl = env_secs("RUSTY_SESSIONS_REFRESH_TTL", DEFAULT_REFRESH_TOKEN_TTL_SECS);

        if let Ok(style) = env::var("RUSTY_SESSIONS_TOKEN_STYLE") {
            config.token_style = style.parse()?;
        }
        if let Ok(mode) = env::var("RUSTY_SESSIONS_LOGIN_MODE") {
            config.login_mode = mode.parse()?;
        }
        if let Ok(backend) = env::var("RUSTY_SESSIONS_BACKEND") {
            config.backend = backend.parse()?;
        }

        if let Ok(url) = env::var("RUSTY_SESSIONS_REDIS_URL") {
            config.redis.url = url;
        }
        if let Ok(prefix) = env::var("RUSTY_SESSIONS_KEY_PREFIX") {
            config.redis.key_prefix = prefix;
        }
        config.redis.connect_timeout =
            env_secs("RUSTY_SESSIONS_CONNECT_TIMEOUT", DEFAULT_CONNECT_TIMEOUT_SECS);

        config.auto_renew = env::var("RUSTY_SESSIONS_AUTO_RENEW")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);
        config.renew_threshold = env::var("RUSTY_SESSIONS_RENEW_THRESHOLD")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(DEFAULT_RENEW_THRESHOLD);

        config.second_auth_code_ttl =
            env_secs("RUSTY_SESSIONS_SECOND_AUTH_CODE_TTL", DEFAULT_SECOND_AUTH_CODE_TTL_SECS);
        config.second_auth_ttl = env_secs("RUSTY_SESSIONS_SECOND_AUTH_TTL", DEFAULT_SECOND_AUTH_TTL_SECS);

        config.max_queued_events = env::var("RUSTY_SESSIONS_MAX_QUEUED_EVENTS")
            .ok()
            .and_then(|c| c.parse().ok())
            .unwrap_or(DEFAULT_MAX_QUEUED_EVENTS);

        config.validate()?;
        Ok(config)
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    let secs = env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}
