//! Token issuance and parsing
//!
//! Access tokens come in three styles: opaque random strings that only mean
//! something to the session store, signed JWTs, and signed JWTs carrying a
//! unique `jti`. Refresh tokens are always signed and always carry a `jti`.
//!
//! Every issued token is unique. Plain JWTs carry a random `nonce` so two
//! logins in the same second never produce the same token.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::identity::{Device, Identity};
use crate::config::AuthConfig;
use crate::constants::OPAQUE_TOKEN_BYTES;
use crate::error::AuthError;

/// Encoding used for access tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStyle {
    /// Random bytes; claims live only in the session store
    Opaque,
    /// Self-contained signed claims
    Jwt,
    /// Signed claims plus a random token id
    JwtWithId,
}

impl TokenStyle {
    pub fn is_signed(&self) -> bool {
        !matches!(self, TokenStyle::Opaque)
    }
}

impl FromStr for TokenStyle {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "opaque" | "random" | "uuid" => Ok(Self::Opaque),
            "jwt" => Ok(Self::Jwt),
            "jwt-id" | "jwt_with_id" | "jwt-with-id" => Ok(Self::JwtWithId),
            other => Err(AuthError::UnsupportedStyle(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Access => f.write_str("access"),
            TokenKind::Refresh => f.write_str("refresh"),
        }
    }
}

/// JWT Claims structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub uid: u64,
    pub username: String,
    pub device: Device,
    #[serde(rename = "tokenKind")]
    pub kind: TokenKind,
    /// Issued at (as UTC timestamp)
    pub iat: i64,
    /// Expiration time (as UTC timestamp)
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Map<String, Value>>,
}

impl Claims {
    pub fn identity(&self) -> Identity {
        Identity::new(self.uid, self.username.clone(), self.device)
    }

    /// Expiry is closed: a token is already expired at its `exp` second
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.exp
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp())
    }
}

/// Errors produced by the codec itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Expired,
    Malformed(String),
    SignatureInvalid,
    InvalidIdentity(String),
    UnsupportedStyle(String),
    SigningFailure(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "token expired"),
            Self::Malformed(msg) => write!(f, "malformed token: {}", msg),
            Self::SignatureInvalid => write!(f, "signature or algorithm rejected"),
            Self::InvalidIdentity(msg) => write!(f, "invalid identity: {}", msg),
            Self::UnsupportedStyle(msg) => write!(f, "unsupported style: {}", msg),
            Self::SigningFailure(msg) => write!(f, "signing failed: {}", msg),
        }
    }
}

impl Error for CodecError {}

impl CodecError {
    /// Map to the error a caller presenting an access token should see
    pub fn into_access_error(self, context: &str) -> AuthError {
        match self {
            CodecError::Expired => AuthError::TokenExpired(context.to_string()),
            CodecError::Malformed(msg) => AuthError::TokenInvalid(format!("{}: {}", context, msg)),
            CodecError::SignatureInvalid => {
                AuthError::TokenInvalid(format!("{}: signature rejected", context))
            }
            CodecError::InvalidIdentity(msg) => AuthError::InvalidIdentity(msg),
            CodecError::UnsupportedStyle(msg) => AuthError::UnsupportedStyle(msg),
            CodecError::SigningFailure(msg) => AuthError::SigningFailure(format!("{}: {}", context, msg)),
        }
    }

    /// Map to the error a caller presenting a refresh token should see
    pub fn into_refresh_error(self, context: &str) -> AuthError {
        match self {
            CodecError::Expired => AuthError::RefreshTokenExpired(context.to_string()),
            CodecError::Malformed(_) | CodecError::SignatureInvalid => {
                AuthError::RefreshTokenInvalid(format!("{}: {}", context, self))
            }
            other => other.into_access_error(context),
        }
    }
}

/// A freshly minted token and its validity window
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub kind: TokenKind,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Issues and parses tokens with a symmetric secret
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    header: Header,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenCodec {
    pub fn new(secret: &str, algorithm: Algorithm, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        // Only the configured algorithm is accepted, whatever the header claims.
        // Expiry is checked by hand so the boundary second counts as expired.
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            header: Header::new(algorithm),
            validation,
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            &config.secret,
            config.algorithm,
            config.access_token_ttl,
            config.refresh_token_ttl,
        )
    }

    pub fn ttl(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        }
    }

    /// Issue a token for `identity`
    pub fn issue(
        &self,
        identity: &Identity,
        kind: TokenKind,
        style: TokenStyle,
        extra: Option<&Map<String, Value>>,
    ) -> Result<IssuedToken, CodecError> {
        identity
            .ensure_valid()
            .map_err(|e| CodecError::InvalidIdentity(e.to_string()))?;

        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl(kind))
            .map_err(|e| CodecError::SigningFailure(format!("lifetime out of range: {}", e)))?;
        let expires_at = issued_at
            .checked_add_signed(ttl)
            .ok_or_else(|| CodecError::SigningFailure(format!("{} lifetime out of range", kind)))?;

        let token = match (kind, style) {
            (TokenKind::Access, TokenStyle::Opaque) => opaque_token(),
            _ => {
                let with_id = kind == TokenKind::Refresh || style == TokenStyle::JwtWithId;
                let claims = Claims {
                    uid: identity.user_id,
                    username: identity.username.clone(),
                    device: identity.device,
                    kind,
                    iat: issued_at.timestamp(),
                    exp: expires_at.timestamp(),
                    jti: with_id.then(|| uuid::Uuid::new_v4().to_string()),
                    nonce: (!with_id).then(opaque_token),
                    extra: match kind {
                        TokenKind::Access => extra.filter(|m| !m.is_empty()).cloned(),
                        TokenKind::Refresh => None,
                    },
                };
                self.sign(&claims)?
            }
        };

        Ok(IssuedToken {
            token,
            kind,
            issued_at,
            expires_at,
        })
    }

    /// Sign arbitrary claims with the configured algorithm
    pub fn sign(&self, claims: &Claims) -> Result<String, CodecError> {
        encode(&self.header, claims, &self.encoding_key)
            .map_err(|e| CodecError::SigningFailure(e.to_string()))
    }

    /// Verify and decode a signed token, rejecting expired ones
    pub fn parse(&self, token: &str) -> Result<Claims, CodecError> {
        let claims = self.verify_signature(token)?;
        if claims.is_expired() {
            return Err(CodecError::Expired);
        }
        Ok(claims)
    }

    /// Verify signature and structure only; the caller owns expiry
    pub fn verify_signature(&self, token: &str) -> Result<Claims, CodecError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                JwtErrorKind::ExpiredSignature => CodecError::Expired,
                JwtErrorKind::InvalidSignature | JwtErrorKind::InvalidAlgorithm => {
                    CodecError::SignatureInvalid
                }
                _ => CodecError::Malformed(e.to_string()),
            })
    }
}

fn opaque_token() -> String {
    let mut bytes = [0u8; OPAQUE_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Extracts bearer token from Authorization header
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    let (scheme, token) = auth_header.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}
