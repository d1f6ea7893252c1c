//! Session storage backends

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod traits;

use std::sync::Arc;

use crate::config::{AuthConfig, StorageBackend};
use crate::error::Result;

pub use memory::MemorySessionStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisSessionStore;
pub use traits::{keys, SessionStore, SharedSessionStore, TokenRecord};

/// Create a new memory-based session store
pub fn create_memory_store() -> SharedSessionStore {
    Arc::new(MemorySessionStore::new())
}

/// Build the backend selected by the configuration
pub async fn open_store(config: &AuthConfig) -> Result<SharedSessionStore> {
    match config.backend {
        StorageBackend::Memory => Ok(create_memory_store()),
        #[cfg(feature = "redis")]
        StorageBackend::Redis => {
            let store = RedisSessionStore::connect(&config.redis).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StorageBackend::Redis => Err(crate::error::AuthError::NotImplemented(
            "Redis backend requires the `redis` feature".to_string(),
        )),
    }
}
