//! Rusty Sessions - token, session and permission management for Rust services
//!
//! This library issues access/refresh token pairs, tracks the sessions they
//! belong to under a configurable multi-device login policy, supports
//! step-up authentication and answers role/permission questions through a
//! pluggable policy engine.

pub mod auth;
pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod permission;
pub mod security;
pub mod security_logger;
pub mod storage;

// Re-export main components
pub use auth::{AuthManager, Device, Identity, LoginRequest, TokenPair};
pub use config::{AuthConfig, LoginMode, RedisConfig, StorageBackend};
pub use error::{AuthError, ErrorKind, Result};
pub use permission::{PermissionManager, Subject};
