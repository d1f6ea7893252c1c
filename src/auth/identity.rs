use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use crate::error::{AuthError, Result};

/// Client class a session was opened from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Web,
    App,
    Desktop,
    Api,
    Other,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Web => "web",
            Device::App => "app",
            Device::Desktop => "desktop",
            Device::Api => "api",
            Device::Other => "other",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Unknown client strings collapse to `Other` rather than failing a login
impl FromStr for Device {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "web" => Device::Web,
            "app" | "mobile" => Device::App,
            "desktop" => Device::Desktop,
            "api" => Device::Api,
            _ => Device::Other,
        })
    }
}

/// The authenticated principal a token is issued for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: u64,
    pub username: String,
    pub device: Device,
}

impl Identity {
    pub fn new(user_id: u64, username: impl Into<String>, device: Device) -> Self {
        Self {
            user_id,
            username: username.into(),
            device,
        }
    }

    /// Reject identities that cannot own a session
    pub fn ensure_valid(&self) -> Result<()> {
        if self.user_id == 0 {
            return Err(AuthError::InvalidIdentity("user id must be non-zero".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(AuthError::InvalidIdentity(format!(
                "empty username for uid={}",
                self.user_id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid={} ({}) device={}", self.user_id, self.username, self.device)
    }
}
