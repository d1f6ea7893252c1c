//! Role and permission checks backed by a policy engine

pub mod engine;
pub mod manager;

pub use engine::{MemoryPolicyEngine, PolicyEngine, SharedPolicyEngine};
pub use manager::{PermissionManager, Subject};
