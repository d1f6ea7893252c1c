//! Authentication: identities, tokens, sessions and step-up verification

pub mod identity;
pub mod manager;
pub mod second_auth;
pub mod token;

// Re-export main components
pub use identity::{Device, Identity};
pub use manager::{AuthManager, LoginRequest, TokenPair};
pub use second_auth::SecondAuthVerifier;
pub use token::{extract_bearer_token, Claims, CodecError, TokenCodec, TokenKind, TokenStyle};
