use std::error::Error;
use std::fmt;

/// Stable, inspectable classification of an [`AuthError`].
///
/// Callers above the library (HTTP layers, middleware) match on this rather
/// than on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidCredentials,
    InvalidConfig,
    InvalidIdentity,
    UnsupportedStyle,
    SigningFailure,
    TokenExpired,
    TokenInvalid,
    TokenNotFound,
    RefreshTokenExpired,
    RefreshTokenInvalid,
    PermissionDenied,
    SecondAuthRequired,
    SecondAuthFailed,
    StorageUnavailable,
    EngineUnavailable,
    NotImplemented,
}

#[derive(Debug)]
pub enum AuthError {
    // Credential and configuration errors
    InvalidCredentials(String),
    InvalidConfig(String),

    // Token issuance errors
    InvalidIdentity(String),
    UnsupportedStyle(String),
    SigningFailure(String),

    // Token lifecycle errors
    TokenExpired(String),
    TokenInvalid(String),
    TokenNotFound(String),
    RefreshTokenExpired(String),
    RefreshTokenInvalid(String),

    // Authorization errors
    PermissionDenied(String),
    SecondAuthRequired(String),
    SecondAuthFailed(String),

    // Backend errors
    StorageUnavailable(String),
    EngineUnavailable(String),

    NotImplemented(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCredentials(_) => ErrorKind::InvalidCredentials,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::InvalidIdentity(_) => ErrorKind::InvalidIdentity,
            Self::UnsupportedStyle(_) => ErrorKind::UnsupportedStyle,
            Self::SigningFailure(_) => ErrorKind::SigningFailure,
            Self::TokenExpired(_) => ErrorKind::TokenExpired,
            Self::TokenInvalid(_) => ErrorKind::TokenInvalid,
            Self::TokenNotFound(_) => ErrorKind::TokenNotFound,
            Self::RefreshTokenExpired(_) => ErrorKind::RefreshTokenExpired,
            Self::RefreshTokenInvalid(_) => ErrorKind::RefreshTokenInvalid,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::SecondAuthRequired(_) => ErrorKind::SecondAuthRequired,
            Self::SecondAuthFailed(_) => ErrorKind::SecondAuthFailed,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::EngineUnavailable(_) => ErrorKind::EngineUnavailable,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
        }
    }

    /// True for errors that simply mean "authenticate again".
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TokenExpired | ErrorKind::TokenNotFound | ErrorKind::RefreshTokenExpired
        )
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCredentials(msg) => write!(f, "Invalid credentials: {}", msg),
            Self::InvalidConfig(msg) => write!(f, "Configuration error: {}", msg),
            Self::InvalidIdentity(msg) => write!(f, "Invalid identity: {}", msg),
            Self::UnsupportedStyle(msg) => write!(f, "Unsupported token style: {}", msg),
            Self::SigningFailure(msg) => write!(f, "Token signing failed: {}", msg),
            Self::TokenExpired(msg) => write!(f, "Token expired: {}", msg),
            Self::TokenInvalid(msg) => write!(f, "Invalid token: {}", msg),
            Self::TokenNotFound(msg) => write!(f, "Token not found: {}", msg),
            Self::RefreshTokenExpired(msg) => write!(f, "Refresh token expired: {}", msg),
            Self::RefreshTokenInvalid(msg) => write!(f, "Invalid refresh token: {}", msg),
            Self::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            Self::SecondAuthRequired(msg) => write!(f, "Secondary authentication required: {}", msg),
            Self::SecondAuthFailed(msg) => write!(f, "Secondary authentication failed: {}", msg),
            Self::StorageUnavailable(msg) => write!(f, "Storage error: {}", msg),
            Self::EngineUnavailable(msg) => write!(f, "Policy engine error: {}", msg),
            Self::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
        }
    }
}

impl Error for AuthError {}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::StorageUnavailable(format!("Record serialization failed: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AuthError::TokenInvalid(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for AuthError {
    fn from(err: redis::RedisError) -> Self {
        AuthError::StorageUnavailable(format!("Redis: {}", err))
    }
}

// Generic result type for the crate
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        let err = AuthError::TokenExpired("uid=1 device=web".to_string());
        assert_eq!(err.kind(), ErrorKind::TokenExpired);
        assert!(err.requires_reauthentication());

        let err = AuthError::TokenInvalid("bad signature".to_string());
        assert_eq!(err.kind(), ErrorKind::TokenInvalid);
        assert!(!err.requires_reauthentication());
    }

    #[test]
    fn test_display_keeps_context() {
        let err = AuthError::StorageUnavailable("connection refused".to_string());
        assert_eq!(err.to_string(), "Storage error: connection refused");
    }
}
