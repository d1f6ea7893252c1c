//! In-memory session storage
//!
//! All indices sit behind one `RwLock`: mutations take the write lock,
//! lookups the read lock. Expired entries are evicted lazily when a read
//! runs into them, or in bulk through [`MemorySessionStore::purge_expired`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::traits::{expires_after, keys, SessionStore, TokenRecord};
use crate::auth::identity::Device;
use crate::error::Result;
use crate::security::timing::constant_time_eq;

struct EphemeralEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Indices {
    records: HashMap<String, TokenRecord>,
    user_tokens: HashMap<u64, HashSet<String>>,
    device_tokens: HashMap<(u64, Device), String>,
    ephemeral: HashMap<String, EphemeralEntry>,
}

impl Indices {
    /// Remove a token from every index; the caller holds the write lock
    fn detach(&mut self, token: &str) -> Option<TokenRecord> {
        for key in keys::token_scoped(token) {
            self.ephemeral.remove(&key);
        }

        let record = self.records.remove(token)?;
        let user_id = record.user_id();

        if let Some(tokens) = self.user_tokens.get_mut(&user_id) {
            tokens.remove(token);
            if tokens.is_empty() {
                self.user_tokens.remove(&user_id);
            }
        }

        let device_key = (user_id, record.device());
        if self.device_tokens.get(&device_key).map(String::as_str) == Some(token) {
            self.device_tokens.remove(&device_key);
        }

        Some(record)
    }

    fn live_record(&self, token: &str, now: DateTime<Utc>) -> Option<&TokenRecord> {
        self.records.get(token).filter(|r| !r.is_expired_at(now))
    }
}

/// In-memory session store
pub struct MemorySessionStore {
    inner: Arc<RwLock<Indices>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Indices::default())),
        }
    }

    /// Drop every expired record and ephemeral entry, returning how many
    /// records were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut indices = self.inner.write().await;

        let expired: Vec<String> = indices
            .records
            .values()
            .filter(|r| r.is_expired_at(now))
            .map(|r| r.token.clone())
            .collect();
        for token in &expired {
            indices.detach(token);
        }
        indices.ephemeral.retain(|_, entry| entry.expires_at > now);

        if !expired.is_empty() {
            log::info!("Purged {} expired sessions", expired.len());
        }
        expired.len()
    }

    /// Number of stored records, expired ones included
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, record: TokenRecord) -> Result<()> {
        let mut indices = self.inner.write().await;
        let user_id = record.user_id();

        indices
            .user_tokens
            .entry(user_id)
            .or_default()
            .insert(record.token.clone());
        indices
            .device_tokens
            .insert((user_id, record.device()), record.token.clone());
        indices.records.insert(record.token.clone(), record);
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<TokenRecord>> {
        let now = Utc::now();
        {
            let indices = self.inner.read().await;
            match indices.records.get(token) {
                None => return Ok(None),
                Some(record) if !record.is_expired_at(now) => return Ok(Some(record.clone())),
                Some(_) => {}
            }
        }

        // Expired: evict under the write lock, re-checking in case it was renewed meanwhile
        let mut indices = self.inner.write().await;
        if let Some(record) = indices.live_record(token, Utc::now()) {
            return Ok(Some(record.clone()));
        }
        if indices.detach(token).is_some() {
            log::debug!("Evicted expired session on read");
        }
        Ok(None)
    }

    async fn peek(&self, token: &str) -> Result<Option<TokenRecord>> {
        Ok(self.inner.read().await.records.get(token).cloned())
    }

    async fn remove(&self, token: &str) -> Result<Option<TokenRecord>> {
        Ok(self.inner.write().await.detach(token))
    }

    async fn tokens_of(&self, user_id: u64) -> Result<Vec<String>> {
        let now = Utc::now();
        let indices = self.inner.read().await;
        let tokens = match indices.user_tokens.get(&user_id) {
            Some(tokens) => tokens
                .iter()
                .filter(|t| indices.live_record(t, now).is_some())
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(tokens)
    }

    async fn remove_all(&self, user_id: u64) -> Result<Vec<TokenRecord>> {
        let mut indices = self.inner.write().await;
        let tokens: Vec<String> = indices
            .user_tokens
            .get(&user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        Ok(tokens.iter().filter_map(|t| indices.detach(t)).collect())
    }

    async fn device_token(&self, user_id: u64, device: Device) -> Result<Option<String>> {
        let now = Utc::now();
        let indices = self.inner.read().await;
        Ok(indices
            .device_tokens
            .get(&(user_id, device))
            .filter(|t| indices.live_record(t, now).is_some())
            .cloned())
    }

    async fn remove_device(&self, user_id: u64, device: Device) -> Result<Option<TokenRecord>> {
        let mut indices = self.inner.write().await;
        match indices.device_tokens.get(&(user_id, device)).cloned() {
            Some(token) => Ok(indices.detach(&token)),
            None => Ok(None),
        }
    }

    async fn put_ephemeral(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = expires_after(Utc::now(), ttl)?;
        self.inner.write().await.ephemeral.insert(
            key.to_string(),
            EphemeralEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get_ephemeral(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let indices = self.inner.read().await;
        Ok(indices
            .ephemeral
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn remove_ephemeral(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let removed = self.inner.write().await.ephemeral.remove(key);
        Ok(removed.filter(|entry| entry.expires_at > now).map(|entry| entry.value))
    }

    async fn take_ephemeral_if(&self, key: &str, expected: &str) -> Result<bool> {
        let now = Utc::now();
        let mut indices = self.inner.write().await;
        let state = indices
            .ephemeral
            .get(key)
            .map(|entry| (entry.expires_at > now, constant_time_eq(&entry.value, expected)));

        match state {
            Some((true, true)) => {
                indices.ephemeral.remove(key);
                Ok(true)
            }
            Some((false, _)) => {
                indices.ephemeral.remove(key);
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::identity::Identity;
    use serde_json::Map;

    fn record(token: &str, user_id: u64, device: Device, ttl: chrono::Duration) -> TokenRecord {
        let now = Utc::now();
        TokenRecord {
            token: token.to_string(),
            refresh_token: format!("refresh-{}", token),
            issued_at: now,
            expires_at: now + ttl,
            renewed_at: None,
            remember_me: false,
            identity: Identity::new(user_id, format!("user{}", user_id), device),
            ip: None,
            user_agent: None,
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_save_and_indices() {
        let store = MemorySessionStore::new();
        store
            .save(record("t1", 1, Device::Web, chrono::Duration::hours(1)))
            .await
            .unwrap();
        store
            .save(record("t2", 1, Device::App, chrono::Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(store.get("t1").await.unwrap().unwrap().user_id(), 1);
        let mut tokens = store.tokens_of(1).await.unwrap();
        tokens.sort();
        assert_eq!(tokens, vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(store.device_token(1, Device::App).await.unwrap(), Some("t2".to_string()));
        assert_eq!(store.device_token(1, Device::Desktop).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_cascades() {
        let store = MemorySessionStore::new();
        store
            .save(record("t1", 1, Device::Web, chrono::Duration::hours(1)))
            .await
            .unwrap();
        store
            .put_ephemeral(&keys::second_auth("t1"), "1", Duration::from_secs(60))
            .await
            .unwrap();

        let removed = store.remove("t1").await.unwrap();
        assert_eq!(removed.unwrap().token, "t1");
        assert!(store.get("t1").await.unwrap().is_none());
        assert!(store.tokens_of(1).await.unwrap().is_empty());
        assert!(store.device_token(1, Device::Web).await.unwrap().is_none());
        assert!(store.get_ephemeral(&keys::second_auth("t1")).await.unwrap().is_none());

        // Idempotent
        assert!(store.remove("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_all_on_unknown_user_is_noop() {
        let store = MemorySessionStore::new();
        assert!(store.remove_all(99).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_reads_as_absent_and_is_evicted() {
        let store = MemorySessionStore::new();
        store
            .save(record("old", 5, Device::Web, chrono::Duration::milliseconds(-1)))
            .await
            .unwrap();
        assert_eq!(store.len().await, 1);

        assert!(store.tokens_of(5).await.unwrap().is_empty());
        assert!(store.device_token(5, Device::Web).await.unwrap().is_none());
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_peek_sees_expired_record() {
        let store = MemorySessionStore::new();
        store
            .save(record("stale", 6, Device::App, chrono::Duration::milliseconds(-1)))
            .await
            .unwrap();

        let peeked = store.peek("stale").await.unwrap().unwrap();
        assert!(peeked.is_expired());
        assert!(store.get("stale").await.unwrap().is_none());
        assert!(store.peek("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_device_index_points_to_latest() {
        let store = MemorySessionStore::new();
        store
            .save(record("w1", 1, Device::Web, chrono::Duration::hours(1)))
            .await
            .unwrap();
        store
            .save(record("w2", 1, Device::Web, chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(store.device_token(1, Device::Web).await.unwrap(), Some("w2".to_string()));

        // Removing the older token leaves the newer binding alone
        store.remove("w1").await.unwrap();
        assert_eq!(store.device_token(1, Device::Web).await.unwrap(), Some("w2".to_string()));

        let removed = store.remove_device(1, Device::Web).await.unwrap();
        assert_eq!(removed.unwrap().token, "w2");
        assert!(store.tokens_of(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemorySessionStore::new();
        store
            .save(record("live", 1, Device::Web, chrono::Duration::hours(1)))
            .await
            .unwrap();
        store
            .save(record("dead", 2, Device::Web, chrono::Duration::seconds(-5)))
            .await
            .unwrap();

        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_take_ephemeral_if_is_one_shot() {
        let store = MemorySessionStore::new();
        store
            .put_ephemeral("code:7", "123456", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(!store.take_ephemeral_if("code:7", "000000").await.unwrap());
        assert!(store.take_ephemeral_if("code:7", "123456").await.unwrap());
        assert!(!store.take_ephemeral_if("code:7", "123456").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_saves_for_different_users() {
        let store = Arc::new(MemorySessionStore::new());
        let mut handles = Vec::new();
        for uid in 1..=20u64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let token = format!("tok-{}", uid);
                store
                    .save(record(&token, uid, Device::Api, chrono::Duration::hours(1)))
                    .await
                    .unwrap();
                store.get(&token).await.unwrap().is_some()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(store.len().await, 20);
    }

    #[tokio::test]
    async fn test_device_binding_follows_last_save() {
        let store = MemorySessionStore::new();
        let older = record("older", 4, Device::Web, chrono::Duration::hours(1));
        store.save(older.clone()).await.unwrap();
        store
            .save(record("newer", 4, Device::Web, chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(store.device_token(4, Device::Web).await.unwrap(), Some("newer".to_string()));

        // Renewal re-saves the older session and takes the binding back
        store.save(older).await.unwrap();
        assert_eq!(store.device_token(4, Device::Web).await.unwrap(), Some("older".to_string()));

        let removed = store.remove_device(4, Device::Web).await.unwrap().unwrap();
        assert_eq!(removed.token, "older");
        assert_eq!(store.tokens_of(4).await.unwrap(), vec!["newer".to_string()]);
    }
}
