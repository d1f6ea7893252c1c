//! Timing attack protection utilities
//!
//! Secrets presented by callers (refresh tokens, one-time codes) are compared
//! through their SHA-256 digests so that neither length nor content leaks
//! through comparison time.

use sha2::{Digest, Sha256};

/// Constant-time comparison of two secrets
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());

    let mut result = 0u8;
    for (byte_a, byte_b) in da.iter().zip(db.iter()) {
        result |= byte_a ^ byte_b;
    }

    result == 0
}
