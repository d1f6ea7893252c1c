//! Authentication events and the listener interface

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::auth::identity::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEventKind {
    Login,
    Logout,
    /// Session ended by the system rather than by its owner
    Kickout,
    Refresh,
    Expired,
    SecondAuthEnabled,
    SecondAuthDisabled,
}

impl AuthEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Kickout => "kickout",
            Self::Refresh => "refresh",
            Self::Expired => "expired",
            Self::SecondAuthEnabled => "second_auth_enabled",
            Self::SecondAuthDisabled => "second_auth_disabled",
        }
    }
}

impl fmt::Display for AuthEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub identity: Identity,
    pub token: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl AuthEvent {
    pub fn new(kind: AuthEventKind, identity: Identity, token: impl Into<String>) -> Self {
        Self {
            kind,
            identity,
            token: token.into(),
            timestamp: Utc::now(),
            payload: Map::new(),
        }
    }

    pub fn with_payload(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }
}

/// Receives events after the triggering call has returned
#[async_trait]
pub trait AuthListener: Send + Sync {
    async fn on_event(&self, event: &AuthEvent);

    /// Name used in dispatch logs
    fn name(&self) -> &str {
        "listener"
    }
}

/// Adapts a plain closure into a listener
pub struct FnListener<F> {
    name: String,
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&AuthEvent) + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F> AuthListener for FnListener<F>
where
    F: Fn(&AuthEvent) + Send + Sync,
{
    async fn on_event(&self, event: &AuthEvent) {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
