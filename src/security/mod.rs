//! Security utilities

pub mod fingerprint;
pub mod timing;

pub use fingerprint::token_fingerprint;
pub use timing::constant_time_eq;
