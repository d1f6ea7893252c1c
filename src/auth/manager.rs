//! Session lifecycle: login policy, validation, refresh, kickout and
//! step-up authentication
//!
//! The manager owns no session state of its own. Records live in the
//! [`SessionStore`](crate::storage::SessionStore); the manager decides which
//! records to create, renew and evict, and reports every transition to the
//! registered listeners.
//!
//! Mutations for one user (eviction plus insert at login, the refresh swap,
//! renewal, logout) run under a per-user lock taken from a fixed set of
//! stripes, so two logins for the same user cannot interleave.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::auth::identity::{Device, Identity};
use crate::auth::second_auth::SecondAuthVerifier;
use crate::auth::token::{TokenCodec, TokenKind};
use crate::config::{AuthConfig, LoginMode};
use crate::constants::USER_LOCK_STRIPES;
use crate::core::dispatcher::{EventDispatcher, SharedDispatcher};
use crate::core::events::{AuthEvent, AuthEventKind, AuthListener};
use crate::error::{AuthError, Result};
use crate::security::fingerprint::token_fingerprint;
use crate::security::timing::constant_time_eq;
use crate::storage::traits::expires_after;
use crate::storage::{open_store, SharedSessionStore, TokenRecord};

/// Everything needed to open a session
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub identity: Identity,
    /// Keep the session alive for the refresh lifetime instead of the
    /// access lifetime
    pub remember_me: bool,
    /// Copied into the access token claims and the session record
    pub extra: Map<String, Value>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl LoginRequest {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            remember_me: false,
            extra: Map::new(),
            ip: None,
            user_agent: None,
        }
    }

    pub fn remember_me(mut self, remember: bool) -> Self {
        self.remember_me = remember;
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Tokens handed back by `login` and `refresh`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// When the session ends unless renewed
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

pub struct AuthManager {
    config: AuthConfig,
    codec: TokenCodec,
    store: SharedSessionStore,
    verifier: SecondAuthVerifier,
    dispatcher: SharedDispatcher,
    user_locks: Vec<Mutex<()>>,
}

impl AuthManager {
    /// Build a manager over an existing store. The configuration is
    /// validated first.
    pub fn new(config: AuthConfig, store: SharedSessionStore) -> Result<Self> {
        config.validate()?;

        let codec = TokenCodec::from_config(&config);
        let verifier = SecondAuthVerifier::from_config(Arc::clone(&store), &config);
        let dispatcher = Arc::new(EventDispatcher::from_config(&config));
        let user_locks = (0..USER_LOCK_STRIPES).map(|_| Mutex::new(())).collect();

        info!(
            "Auth manager ready (mode: {}, style: {:?}, backend: {}, auto-renew: {})",
            config.login_mode,
            config.token_style,
            store.backend_name(),
            config.auto_renew
        );

        Ok(Self {
            config,
            codec,
            store,
            verifier,
            dispatcher,
            user_locks,
        })
    }

    /// Build a manager and the store backend the configuration selects
    pub async fn from_config(config: AuthConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config).await?;
        Self::new(config, store)
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedSessionStore {
        &self.store
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Register a listener for session events. Must be called from within
    /// a Tokio runtime.
    pub fn subscribe(&self, listener: Arc<dyn AuthListener>) {
        self.dispatcher.subscribe(listener);
    }

    pub fn events(&self) -> &SharedDispatcher {
        &self.dispatcher
    }

    fn user_lock(&self, user_id: u64) -> &Mutex<()> {
        let stripe = (user_id % self.user_locks.len() as u64) as usize;
        &self.user_locks[stripe]
    }

    fn event(&self, kind: AuthEventKind, record: &TokenRecord) -> AuthEvent {
        AuthEvent::new(kind, record.identity.clone(), record.token.clone())
    }

    /// Open a session according to the configured login mode
    pub async fn login(&self, request: LoginRequest) -> Result<TokenPair> {
        let LoginRequest {
            identity,
            remember_me,
            extra,
            ip,
            user_agent,
        } = request;
        identity.ensure_valid()?;

        let _guard = self.user_lock(identity.user_id).lock().await;

        let evicted = match self.config.login_mode {
            LoginMode::Single => self.store.remove_all(identity.user_id).await,
            LoginMode::Exclusive => self
                .store
                .remove_device(identity.user_id, identity.device)
                .await
                .map(|removed| removed.into_iter().collect()),
            LoginMode::Multi => Ok(Vec::new()),
        };
        let evicted = evicted.unwrap_or_else(|e| {
            warn!(
                "Failed to evict previous sessions of uid={} ({}), continuing login: {}",
                identity.user_id, self.config.login_mode, e
            );
            Vec::new()
        });

        for record in &evicted {
            info!(
                "Kicked out session {} of {} ({} login)",
                token_fingerprint(&record.token),
                record.identity,
                self.config.login_mode
            );
            self.dispatcher.emit(
                self.event(AuthEventKind::Kickout, record)
                    .with_payload("reason", "replaced")
                    .with_payload("login_mode", self.config.login_mode.to_string()),
            );
        }

        let (pair, record) = self.issue_session(&identity, remember_me, extra, ip, user_agent)?;
        self.store.save(record.clone()).await?;

        info!(
            "Login: {} session {} (remember_me: {})",
            identity,
            token_fingerprint(&record.token),
            remember_me
        );
        self.dispatcher.emit(
            self.event(AuthEventKind::Login, &record)
                .with_payload("remember_me", remember_me)
                .with_payload("evicted", evicted.len()),
        );

        Ok(pair)
    }

    fn issue_session(
        &self,
        identity: &Identity,
        remember_me: bool,
        extra: Map<String, Value>,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<(TokenPair, TokenRecord)> {
        let context = format!("uid={} device={}", identity.user_id, identity.device);
        let style = self.config.token_style;

        let access = self
            .codec
            .issue(identity, TokenKind::Access, style, Some(&extra))
            .map_err(|e| e.into_access_error(&format!("{} access", context)))?;
        let refresh = self
            .codec
            .issue(identity, TokenKind::Refresh, style, None)
            .map_err(|e| e.into_access_error(&format!("{} refresh", context)))?;

        let lifetime = if remember_me {
            self.config.refresh_token_ttl
        } else {
            self.config.access_token_ttl
        };
        let expires_at = expires_after(access.issued_at, lifetime)?;

        let record = TokenRecord {
            token: access.token.clone(),
            refresh_token: refresh.token.clone(),
            issued_at: access.issued_at,
            expires_at,
            renewed_at: None,
            remember_me,
            identity: identity.clone(),
            ip,
            user_agent,
            extra,
        };
        let pair = TokenPair {
            access_token: access.token,
            refresh_token: refresh.token,
            expires_at,
            refresh_expires_at: refresh.expires_at,
        };
        Ok((pair, record))
    }

    /// Check a presented access token and return its session
    pub async fn validate(&self, token: &str) -> Result<TokenRecord> {
        self.validate_at(token, Utc::now()).await
    }

    /// `validate` against an explicit clock reading
    pub async fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<TokenRecord> {
        let fingerprint = token_fingerprint(token);

        if self.config.token_style.is_signed() {
            let claims = self
                .codec
                .verify_signature(token)
                .map_err(|e| e.into_access_error(&format!("access token {}", fingerprint)))?;
            if claims.kind != TokenKind::Access {
                return Err(AuthError::TokenInvalid(format!(
                    "token {} is a {} token",
                    fingerprint, claims.kind
                )));
            }
        }

        let record = self
            .store
            .peek(token)
            .await?
            .ok_or_else(|| AuthError::TokenNotFound(format!("access token {}", fingerprint)))?;

        if record.is_expired_at(now) {
            if let Some(removed) = self.store.remove(token).await? {
                debug!("Session {} of {} expired", fingerprint, removed.identity);
                self.dispatcher.emit(self.event(AuthEventKind::Expired, &removed));
            }
            return Err(AuthError::TokenExpired(format!(
                "access token {} (uid={})",
                fingerprint,
                record.user_id()
            )));
        }

        if self.config.auto_renew && record.elapsed_ratio(now) > self.config.renew_threshold {
            return self.renew(&record.token, record.user_id(), now).await;
        }

        Ok(record)
    }

    async fn renew(&self, token: &str, user_id: u64, now: DateTime<Utc>) -> Result<TokenRecord> {
        let _guard = self.user_lock(user_id).lock().await;

        // Renewed or removed while waiting for the lock
        let mut record = self.store.get(token).await?.ok_or_else(|| {
            AuthError::TokenNotFound(format!("access token {}", token_fingerprint(token)))
        })?;
        if record.elapsed_ratio(now) <= self.config.renew_threshold {
            return Ok(record);
        }

        let window = record.window();
        record.renewed_at = Some(now);
        record.expires_at = now.checked_add_signed(window).ok_or_else(|| {
            AuthError::InvalidConfig(format!("renewed window {} out of range", window))
        })?;
        self.store.save(record.clone()).await?;

        debug!(
            "Renewed session {} of {} until {}",
            token_fingerprint(token),
            record.identity,
            record.expires_at
        );
        self.dispatcher.emit(
            self.event(AuthEventKind::Refresh, &record)
                .with_payload("renewed", true)
                .with_payload("expires_at", record.expires_at.to_rfc3339()),
        );
        Ok(record)
    }

    /// Swap a refresh token for a new token pair. The old session is
    /// replaced by the new one.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let context = format!("refresh token {}", token_fingerprint(refresh_token));

        let claims = self
            .codec
            .parse(refresh_token)
            .map_err(|e| e.into_refresh_error(&context))?;
        if claims.kind != TokenKind::Refresh {
            return Err(AuthError::RefreshTokenInvalid(format!(
                "{}: {} token presented",
                context, claims.kind
            )));
        }

        let _guard = self.user_lock(claims.uid).lock().await;

        let old = self
            .find_by_refresh_token(claims.uid, refresh_token)
            .await?
            .ok_or_else(|| self.unmatched_refresh(claims.iat, &context))?;
        if old.identity != claims.identity() {
            warn!(
                "SECURITY: Refresh token claims do not match session {} of {}",
                token_fingerprint(&old.token),
                old.identity
            );
            return Err(AuthError::RefreshTokenInvalid(format!(
                "{}: claims do not match session",
                context
            )));
        }

        let (pair, record) = self.issue_session(
            &old.identity,
            old.remember_me,
            old.extra.clone(),
            old.ip.clone(),
            old.user_agent.clone(),
        )?;
        self.store.remove(&old.token).await?;
        self.store.save(record.clone()).await?;

        info!(
            "Refreshed session {} of {} as {}",
            token_fingerprint(&old.token),
            record.identity,
            token_fingerprint(&record.token)
        );
        self.dispatcher.emit(
            self.event(AuthEventKind::Refresh, &record)
                .with_payload("previous", token_fingerprint(&old.token)),
        );

        Ok(pair)
    }

    /// No live session holds this refresh token. Once the session it was
    /// issued with would have run out, treat it as expiry; before that the
    /// session was rotated or kicked out and the token is stale.
    fn unmatched_refresh(&self, issued_at: i64, context: &str) -> AuthError {
        let lifetime = i64::try_from(self.config.access_token_ttl.as_secs()).unwrap_or(i64::MAX);
        if Utc::now().timestamp() >= issued_at.saturating_add(lifetime) {
            AuthError::RefreshTokenExpired(format!("{}: session has expired", context))
        } else {
            AuthError::RefreshTokenInvalid(format!("{}: no matching session", context))
        }
    }

    async fn find_by_refresh_token(&self, user_id: u64, refresh_token: &str) -> Result<Option<TokenRecord>> {
        for token in self.store.tokens_of(user_id).await? {
            if let Some(record) = self.store.get(&token).await? {
                if constant_time_eq(&record.refresh_token, refresh_token) {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// End a session at its owner's request
    pub async fn logout(&self, token: &str) -> Result<()> {
        let record = self.end_session(token).await?;
        info!("Logout: {} session {}", record.identity, token_fingerprint(token));
        self.dispatcher.emit(self.event(AuthEventKind::Logout, &record));
        Ok(())
    }

    /// End a session on behalf of the system
    pub async fn kickout_by_token(&self, token: &str) -> Result<()> {
        let record = self.end_session(token).await?;
        info!("Kickout: {} session {}", record.identity, token_fingerprint(token));
        self.dispatcher.emit(
            self.event(AuthEventKind::Kickout, &record)
                .with_payload("reason", "token"),
        );
        Ok(())
    }

    async fn end_session(&self, token: &str) -> Result<TokenRecord> {
        let not_found = || AuthError::TokenNotFound(format!("access token {}", token_fingerprint(token)));

        let user_id = self.store.get(token).await?.ok_or_else(not_found)?.user_id();
        let _guard = self.user_lock(user_id).lock().await;
        self.store.remove(token).await?.ok_or_else(not_found)
    }

    /// End every session of a user, returning how many were ended
    pub async fn kickout_by_user(&self, user_id: u64) -> Result<usize> {
        let removed = {
            let _guard = self.user_lock(user_id).lock().await;
            self.store.remove_all(user_id).await?
        };

        for record in &removed {
            self.dispatcher.emit(
                self.event(AuthEventKind::Kickout, record)
                    .with_payload("reason", "user"),
            );
        }
        if !removed.is_empty() {
            info!("Kicked out {} sessions of uid={}", removed.len(), user_id);
        }
        Ok(removed.len())
    }

    /// End the session bound to one device of a user.
    ///
    /// The device index holds one token per (user, device): the most recently
    /// saved one. In multi mode a user can have several sessions on the same
    /// device, and renewing or refreshing an older one moves the index to it.
    /// Only the indexed session is ended; use `kickout_by_user` to end them all.
    pub async fn kickout_by_device(&self, user_id: u64, device: Device) -> Result<bool> {
        let removed = {
            let _guard = self.user_lock(user_id).lock().await;
            self.store.remove_device(user_id, device).await?
        };

        match removed {
            Some(record) => {
                info!("Kicked out {} session {}", record.identity, token_fingerprint(&record.token));
                self.dispatcher.emit(
                    self.event(AuthEventKind::Kickout, &record)
                        .with_payload("reason", "device"),
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Live sessions of a user
    pub async fn sessions_of(&self, user_id: u64) -> Result<Vec<TokenRecord>> {
        let mut sessions = Vec::new();
        for token in self.store.tokens_of(user_id).await? {
            if let Some(record) = self.store.get(&token).await? {
                sessions.push(record);
            }
        }
        sessions.sort_by_key(|r| r.issued_at);
        Ok(sessions)
    }

    pub async fn is_online(&self, user_id: u64) -> Result<bool> {
        Ok(!self.store.tokens_of(user_id).await?.is_empty())
    }

    /// Mark the session as having passed step-up authentication. `None`
    /// uses the configured verified lifetime.
    pub async fn enable_second_auth(&self, token: &str, duration: Option<Duration>) -> Result<DateTime<Utc>> {
        let record = self.validate(token).await?;
        let duration = duration.unwrap_or(self.config.second_auth_ttl);

        let until = self.verifier.mark_verified(token, duration).await?;
        self.dispatcher.emit(
            self.event(AuthEventKind::SecondAuthEnabled, &record)
                .with_payload("until", until.to_rfc3339()),
        );
        Ok(until)
    }

    pub async fn check_second_auth(&self, token: &str) -> Result<bool> {
        self.validate(token).await?;
        self.verifier.is_verified(token).await
    }

    /// Fail with `SecondAuthRequired` unless step-up authentication is in force
    pub async fn require_second_auth(&self, token: &str) -> Result<()> {
        if self.check_second_auth(token).await? {
            Ok(())
        } else {
            Err(AuthError::SecondAuthRequired(format!(
                "access token {}",
                token_fingerprint(token)
            )))
        }
    }

    pub async fn disable_second_auth(&self, token: &str) -> Result<()> {
        let record = self.validate(token).await?;
        self.verifier.clear(token).await?;
        self.dispatcher.emit(self.event(AuthEventKind::SecondAuthDisabled, &record));
        Ok(())
    }

    /// Issue a one-time code for the session. Delivering it to the user is
    /// up to the caller.
    pub async fn request_second_auth_code(&self, token: &str) -> Result<String> {
        let record = self.validate(token).await?;
        let code = self.verifier.issue_code(token).await?;
        debug!("Second-auth code requested by {}", record.identity);
        Ok(code)
    }

    /// Check a one-time code and, when it matches, mark the session as
    /// verified
    pub async fn verify_second_auth_code(
        &self,
        token: &str,
        code: &str,
        duration: Option<Duration>,
    ) -> Result<DateTime<Utc>> {
        let record = self.validate(token).await?;
        if !self.verifier.verify_code(token, code).await? {
            return Err(AuthError::SecondAuthFailed(format!(
                "uid={} device={}",
                record.user_id(),
                record.device()
            )));
        }

        let duration = duration.unwrap_or(self.config.second_auth_ttl);
        let until = self.verifier.mark_verified(token, duration).await?;
        self.dispatcher.emit(
            self.event(AuthEventKind::SecondAuthEnabled, &record)
                .with_payload("until", until.to_rfc3339())
                .with_payload("method", "code"),
        );
        Ok(until)
    }
}
