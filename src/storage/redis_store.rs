//! Redis-backed session storage (feature `redis`).
//!
//! ## Key layout (all under the configured prefix)
//!
//! - `token:<token>`: JSON `TokenRecord`, expiring with the session
//! - `user:<id>:tokens`: set of the user's tokens, expiring with the
//!   longest-lived member
//! - `user:<id>:device:<device>`: token bound to that device, same expiry
//! - `second_auth:<token>` / `second_auth_code:<token>`: secondary-auth state
//!
//! Single-key commands are atomic on the server. `save` writes three keys in
//! one pipeline without MULTI, so a crash mid-write can leave a token
//! reachable through one index and not another. That window is accepted:
//! reads re-check the token key, and stale set members are pruned by
//! `tokens_of` and by every `save`. There is no reconciliation pass.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;

use super::traits::{keys, ttl_to_chrono, SessionStore, TokenRecord};
use crate::auth::identity::Device;
use crate::config::RedisConfig;
use crate::error::{AuthError, Result};

// Push the expiry of KEYS[1] out to ARGV[1] ms, never pulling it in
const EXTEND_EXPIRY: &str = r#"
local ttl = redis.call('PTTL', KEYS[1])
if ttl == -1 or ttl < tonumber(ARGV[1]) then
    return redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return 0
"#;

// Delete KEYS[1] only when it still holds ARGV[1]
const DELETE_IF_EQUAL: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

pub struct RedisSessionStore {
    conn: ConnectionManager,
    prefix: String,
    delete_if_equal: Script,
    extend_expiry: Script,
}

impl RedisSessionStore {
    /// Connect and ping once; the timeout applies to this handshake only
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;

        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                AuthError::StorageUnavailable(format!(
                    "timed out after {:?} connecting to {}",
                    config.connect_timeout, config.url
                ))
            })??;

        let store = Self {
            conn,
            prefix: config.key_prefix.clone(),
            delete_if_equal: Script::new(DELETE_IF_EQUAL),
            extend_expiry: Script::new(EXTEND_EXPIRY),
        };

        let ping = tokio::time::timeout(config.connect_timeout, store.health_check())
            .await
            .map_err(|_| AuthError::StorageUnavailable(format!("ping to {} timed out", config.url)))??;
        if !ping {
            return Err(AuthError::StorageUnavailable(format!(
                "unexpected PING reply from {}",
                config.url
            )));
        }

        log::info!("Connected to Redis session store (prefix '{}')", store.prefix);
        Ok(store)
    }

    fn token_key(&self, token: &str) -> String {
        format!("{}token:{}", self.prefix, token)
    }

    fn user_key(&self, user_id: u64) -> String {
        format!("{}user:{}:tokens", self.prefix, user_id)
    }

    fn device_key(&self, user_id: u64, device: Device) -> String {
        format!("{}user:{}:device:{}", self.prefix, user_id, device)
    }

    fn ephemeral_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn read_raw(&self, token: &str) -> Result<Option<TokenRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.token_key(token)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn save(&self, record: TokenRecord) -> Result<()> {
        let ttl_ms = (record.expires_at - Utc::now()).num_milliseconds();
        if ttl_ms <= 0 {
            log::debug!("Skipping save of an already expired session for uid={}", record.user_id());
            return Ok(());
        }

        let json = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("SET")
            .arg(self.token_key(&record.token))
            .arg(json)
            .arg("PX")
            .arg(ttl_ms)
            .ignore()
            .cmd("SADD")
            .arg(self.user_key(record.user_id()))
            .arg(&record.token)
            .ignore()
            .cmd("SET")
            .arg(self.device_key(record.user_id(), record.device()))
            .arg(&record.token)
            .arg("PX")
            .arg(ttl_ms)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        let _: i64 = self
            .extend_expiry
            .key(self.user_key(record.user_id()))
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        // Members whose token key expired natively never pass through `remove`
        self.tokens_of(record.user_id()).await?;
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<TokenRecord>> {
        // Native TTL normally removes the key; the deadline check covers clock skew
        Ok(self.read_raw(token).await?.filter(|r| !r.is_expired()))
    }

    async fn peek(&self, token: &str) -> Result<Option<TokenRecord>> {
        self.read_raw(token).await
    }

    async fn remove(&self, token: &str) -> Result<Option<TokenRecord>> {
        let record = self.read_raw(token).await?;
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.del(self.token_key(token)).ignore();
        for key in keys::token_scoped(token) {
            pipe.del(self.ephemeral_key(&key)).ignore();
        }
        if let Some(ref record) = record {
            pipe.srem(self.user_key(record.user_id()), token).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        if let Some(ref record) = record {
            let _: i64 = self
                .delete_if_equal
                .key(self.device_key(record.user_id(), record.device()))
                .arg(token)
                .invoke_async(&mut conn)
                .await?;
        }

        Ok(record)
    }

    async fn tokens_of(&self, user_id: u64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let user_key = self.user_key(user_id);
        let members: Vec<String> = conn.smembers(&user_key).await?;
        if members.is_empty() {
            return Ok(members);
        }

        let mut pipe = redis::pipe();
        for token in &members {
            pipe.exists(self.token_key(token));
        }
        let alive: Vec<bool> = pipe.query_async(&mut conn).await?;

        let mut live = Vec::with_capacity(members.len());
        let mut stale = Vec::new();
        for (token, exists) in members.into_iter().zip(alive) {
            if exists {
                live.push(token);
            } else {
                stale.push(token);
            }
        }

        if !stale.is_empty() {
            let _: i64 = conn.srem(&user_key, &stale).await?;
            log::debug!("Pruned {} stale tokens from uid={} index", stale.len(), user_id);
        }
        Ok(live)
    }

    async fn remove_all(&self, user_id: u64) -> Result<Vec<TokenRecord>> {
        let mut conn = self.conn.clone();
        let user_key = self.user_key(user_id);
        let members: Vec<String> = conn.smembers(&user_key).await?;

        let mut removed = Vec::with_capacity(members.len());
        for token in &members {
            if let Some(record) = self.remove(token).await? {
                removed.push(record);
            }
        }
        let _: i64 = conn.del(&user_key).await?;
        Ok(removed)
    }

    async fn device_token(&self, user_id: u64, device: Device) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let token: Option<String> = conn.get(self.device_key(user_id, device)).await?;
        match token {
            Some(token) => {
                let exists: bool = conn.exists(self.token_key(&token)).await?;
                Ok(exists.then_some(token))
            }
            None => Ok(None),
        }
    }

    async fn remove_device(&self, user_id: u64, device: Device) -> Result<Option<TokenRecord>> {
        let mut conn = self.conn.clone();
        let token: Option<String> = conn.get(self.device_key(user_id, device)).await?;
        match token {
            Some(token) => self.remove(&token).await,
            None => Ok(None),
        }
    }

    async fn put_ephemeral(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let ttl_ms = ttl_to_chrono(ttl)?.num_milliseconds().max(1);
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.ephemeral_key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_ephemeral(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.ephemeral_key(key)).await?)
    }

    async fn remove_ephemeral(&self, key: &str) -> Result<Option<String>> {
        let key = self.ephemeral_key(key);
        let mut conn = self.conn.clone();
        let (value, _deleted): (Option<String>, i64) = redis::pipe()
            .atomic()
            .get(&key)
            .del(&key)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn take_ephemeral_if(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete_if_equal
            .key(self.ephemeral_key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn health_check(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong == "PONG")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::identity::Identity;
    use serde_json::Map;

    // These tests need a live server: REDIS_URL=redis://... cargo test -- --ignored
    async fn store() -> RedisSessionStore {
        let config = RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            key_prefix: format!("rusty_sessions_test:{}:", uuid::Uuid::new_v4()),
            connect_timeout: Duration::from_secs(2),
        };
        RedisSessionStore::connect(&config).await.unwrap()
    }

    fn record(token: &str, user_id: u64, device: Device) -> TokenRecord {
        let now = Utc::now();
        TokenRecord {
            token: token.to_string(),
            refresh_token: format!("refresh-{}", token),
            issued_at: now,
            expires_at: now + chrono::Duration::minutes(5),
            renewed_at: None,
            remember_me: false,
            identity: Identity::new(user_id, "redis-user", device),
            ip: Some("10.0.0.1".to_string()),
            user_agent: None,
            extra: Map::new(),
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_save_get_remove() {
        let store = store().await;
        store.save(record("a", 1, Device::Web)).await.unwrap();
        store.save(record("b", 1, Device::App)).await.unwrap();

        assert_eq!(store.get("a").await.unwrap().unwrap().ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(store.tokens_of(1).await.unwrap().len(), 2);
        assert_eq!(store.device_token(1, Device::App).await.unwrap(), Some("b".to_string()));

        store.put_ephemeral(&keys::second_auth("a"), "1", Duration::from_secs(30)).await.unwrap();
        assert!(store.remove("a").await.unwrap().is_some());
        assert!(store.remove("a").await.unwrap().is_none());
        assert!(store.get_ephemeral(&keys::second_auth("a")).await.unwrap().is_none());
        assert!(store.device_token(1, Device::Web).await.unwrap().is_none());

        assert_eq!(store.remove_all(1).await.unwrap().len(), 1);
        assert!(store.remove_all(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_user_index_drops_natively_expired_tokens() {
        let store = store().await;
        let mut short = record("short", 5, Device::Web);
        short.expires_at = Utc::now() + chrono::Duration::milliseconds(300);
        store.save(short).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        store.save(record("fresh", 5, Device::Web)).await.unwrap();

        let mut conn = store.conn.clone();
        let members: Vec<String> = conn.smembers(store.user_key(5)).await.unwrap();
        assert_eq!(members, vec!["fresh".to_string()]);

        let ttl_ms: i64 = conn.pttl(store.user_key(5)).await.unwrap();
        assert!(ttl_ms > 0 && ttl_ms <= 5 * 60 * 1000);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_take_ephemeral_if() {
        let store = store().await;
        store.put_ephemeral("code:9", "424242", Duration::from_secs(30)).await.unwrap();
        assert!(!store.take_ephemeral_if("code:9", "000000").await.unwrap());
        assert!(store.take_ephemeral_if("code:9", "424242").await.unwrap());
        assert!(!store.take_ephemeral_if("code:9", "424242").await.unwrap());
    }
}
