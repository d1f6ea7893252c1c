//! Security-focused listener that records session events and raises alerts
//! when kickouts or expiries pile up

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::events::{AuthEvent, AuthEventKind, AuthListener};
use crate::security::fingerprint::token_fingerprint;

/// Recorded event with the token replaced by its fingerprint
#[derive(Debug, Clone)]
pub struct SecurityRecord {
    pub kind: AuthEventKind,
    pub user_id: u64,
    pub device: String,
    pub token_fingerprint: String,
    recorded_at: Instant,
}

/// Security logger for tracking and alerting on session events
pub struct SecurityLogger {
    events: Arc<RwLock<Vec<SecurityRecord>>>,
    event_counts: Arc<RwLock<HashMap<AuthEventKind, usize>>>,
    /// Events counted towards the next alert, reset when one fires
    pending_alerts: Arc<RwLock<HashMap<AuthEventKind, usize>>>,
    max_events: usize,
    alert_thresholds: HashMap<AuthEventKind, usize>,
}

impl SecurityLogger {
    pub fn new() -> Self {
        let mut alert_thresholds = HashMap::new();
        alert_thresholds.insert(AuthEventKind::Kickout, 20);
        alert_thresholds.insert(AuthEventKind::Expired, 100);
        alert_thresholds.insert(AuthEventKind::SecondAuthDisabled, 10);

        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            event_counts: Arc::new(RwLock::new(HashMap::new())),
            pending_alerts: Arc::new(RwLock::new(HashMap::new())),
            max_events: 10000,
            alert_thresholds,
        }
    }

    pub fn with_threshold(mut self, kind: AuthEventKind, threshold: usize) -> Self {
        self.alert_thresholds.insert(kind, threshold.max(1));
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events.max(1);
        self
    }

    /// Record one event; returns true when it triggered an alert
    pub async fn log_event(&self, event: &AuthEvent) -> bool {
        let fingerprint = token_fingerprint(&event.token);

        {
            let mut events = self.events.write().await;
            events.push(SecurityRecord {
                kind: event.kind,
                user_id: event.identity.user_id,
                device: event.identity.device.to_string(),
                token_fingerprint: fingerprint.clone(),
                recorded_at: Instant::now(),
            });

            // Limit memory usage
            if events.len() > self.max_events {
                let events_to_remove = events.len() - self.max_events;
                events.drain(0..events_to_remove);
            }
        }

        *self.event_counts.write().await.entry(event.kind).or_insert(0) += 1;

        let mut alerted = false;
        if let Some(&threshold) = self.alert_thresholds.get(&event.kind) {
            let mut pending = self.pending_alerts.write().await;
            let count = pending.entry(event.kind).or_insert(0);
            *count += 1;
            if *count >= threshold {
                self.trigger_alert(event.kind, *count, event, &fingerprint);
                *count = 0;
                alerted = true;
            }
        }

        match event.kind {
            AuthEventKind::Login => {
                log::info!("SECURITY: Login - User: {}, Token: {}", event.identity, fingerprint);
            }
            AuthEventKind::Logout => {
                log::info!("SECURITY: Logout - User: {}, Token: {}", event.identity, fingerprint);
            }
            AuthEventKind::Kickout => {
                log::warn!(
                    "SECURITY: Session kicked out - User: {}, Token: {}, Reason: {}",
                    event.identity,
                    fingerprint,
                    event.payload.get("reason").and_then(|v| v.as_str()).unwrap_or("unspecified")
                );
            }
            AuthEventKind::Refresh => {
                log::debug!("SECURITY: Session refreshed - User: {}, Token: {}", event.identity, fingerprint);
            }
            AuthEventKind::Expired => {
                log::info!("SECURITY: Session expired - User: {}, Token: {}", event.identity, fingerprint);
            }
            AuthEventKind::SecondAuthEnabled => {
                log::info!("SECURITY: Second auth passed - User: {}, Token: {}", event.identity, fingerprint);
            }
            AuthEventKind::SecondAuthDisabled => {
                log::warn!("SECURITY: Second auth revoked - User: {}, Token: {}", event.identity, fingerprint);
            }
        }

        alerted
    }

    fn trigger_alert(&self, kind: AuthEventKind, count: usize, sample: &AuthEvent, fingerprint: &str) {
        log::error!("SECURITY ALERT: {} events of type '{}' detected", count, kind);
        log::error!("Sample event: user {} token {} at {}", sample.identity, fingerprint, sample.timestamp);
    }

    /// Events recorded within the last `duration`
    pub async fn recent_events(&self, duration: Duration) -> Vec<SecurityRecord> {
        let events = self.events.read().await;
        events
            .iter()
            .filter(|record| record.recorded_at.elapsed() <= duration)
            .cloned()
            .collect()
    }

    /// Total events seen per kind
    pub async fn event_stats(&self) -> HashMap<AuthEventKind, usize> {
        self.event_counts.read().await.clone()
    }

    /// Drop recorded events older than `max_age`
    pub async fn cleanup_old_events(&self, max_age: Duration) {
        let mut events = self.events.write().await;
        events.retain(|record| record.recorded_at.elapsed() <= max_age);
    }
}

impl Default for SecurityLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthListener for SecurityLogger {
    async fn on_event(&self, event: &AuthEvent) {
        self.log_event(event).await;
    }

    fn name(&self) -> &str {
        "security-logger"
    }
}
