//! Log-safe token identifiers

use sha2::{Digest, Sha256};

use crate::constants::TOKEN_FINGERPRINT_LEN;

/// Short hex digest of a token, safe to write to logs
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut hex = String::with_capacity(TOKEN_FINGERPRINT_LEN);
    for byte in digest.iter() {
        if hex.len() >= TOKEN_FINGERPRINT_LEN {
            break;
        }
        hex.push_str(&format!("{:02x}", byte));
    }
    hex.truncate(TOKEN_FINGERPRINT_LEN);
    hex
}
