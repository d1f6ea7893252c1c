//! Step-up ("secondary") authentication
//!
//! Two independent pieces of state per subject, both kept in the session
//! store's ephemeral key space: a pending one-time code, and a "verified"
//! marker holding its own deadline. Subjects are normalized with
//! `to_string()`, so `7` and `"7"` address the same state.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::fmt::Display;
use std::time::Duration;

use crate::config::AuthConfig;
use crate::constants::SECOND_AUTH_CODE_LENGTH;
use crate::error::Result;
use crate::storage::{keys, SharedSessionStore};
use crate::storage::traits::expires_after;

pub struct SecondAuthVerifier {
    store: SharedSessionStore,
    code_ttl: Duration,
}

impl SecondAuthVerifier {
    pub fn new(store: SharedSessionStore, code_ttl: Duration) -> Self {
        Self { store, code_ttl }
    }

    pub fn from_config(store: SharedSessionStore, config: &AuthConfig) -> Self {
        Self::new(store, config.second_auth_code_ttl)
    }

    /// Issue a numeric code, replacing any code still pending for `subject`
    pub async fn issue_code(&self, subject: impl Display) -> Result<String> {
        let subject = subject.to_string();
        let code = generate_code();
        self.store
            .put_ephemeral(&keys::second_auth_code(&subject), &code, self.code_ttl)
            .await?;
        log::debug!("Issued second-auth code for subject {}", subject);
        Ok(code)
    }

    /// One-shot check: a matching code is consumed, a wrong one stays pending
    pub async fn verify_code(&self, subject: impl Display, code: &str) -> Result<bool> {
        let subject = subject.to_string();
        let matched = self
            .store
            .take_ephemeral_if(&keys::second_auth_code(&subject), code.trim())
            .await?;
        if !matched {
            log::warn!("SECURITY: second-auth code rejected for subject {}", subject);
        }
        Ok(matched)
    }

    pub async fn has_pending_code(&self, subject: impl Display) -> Result<bool> {
        let subject = subject.to_string();
        Ok(self
            .store
            .get_ephemeral(&keys::second_auth_code(&subject))
            .await?
            .is_some())
    }

    /// Flag `subject` as verified for `duration`
    pub async fn mark_verified(&self, subject: impl Display, duration: Duration) -> Result<DateTime<Utc>> {
        let subject = subject.to_string();
        let until = expires_after(Utc::now(), duration)?;
        self.store
            .put_ephemeral(&keys::second_auth(&subject), &until.to_rfc3339(), duration)
            .await?;
        Ok(until)
    }

    /// Deadline of the verified flag, if it is still in force
    pub async fn verified_until(&self, subject: impl Display) -> Result<Option<DateTime<Utc>>> {
        let subject = subject.to_string();
        let stored = self.store.get_ephemeral(&keys::second_auth(&subject)).await?;
        let until = stored
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .filter(|until| *until > Utc::now());
        Ok(until)
    }

    pub async fn is_verified(&self, subject: impl Display) -> Result<bool> {
        Ok(self.verified_until(subject).await?.is_some())
    }

    /// Drop both the verified flag and any pending code
    pub async fn clear(&self, subject: impl Display) -> Result<()> {
        let subject = subject.to_string();
        self.store.remove_ephemeral(&keys::second_auth(&subject)).await?;
        self.store.remove_ephemeral(&keys::second_auth_code(&subject)).await?;
        Ok(())
    }
}

fn generate_code() -> String {
    let upper = 10u32.pow(SECOND_AUTH_CODE_LENGTH as u32);
    let n = rand::thread_rng().gen_range(0..upper);
    format!("{:0width$}", n, width = SECOND_AUTH_CODE_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::create_memory_store;

    fn verifier() -> SecondAuthVerifier {
        SecondAuthVerifier::new(create_memory_store(), Duration::from_secs(300))
    }

    fn wrong_code(code: &str) -> String {
        let first = if code.starts_with('0') { '1' } else { '0' };
        format!("{}{}", first, &code[1..])
    }

    #[tokio::test]
    async fn test_code_is_six_digits() {
        let verifier = verifier();
        let code = verifier.issue_code(7).await.unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_code_is_one_shot() {
        let verifier = verifier();
        let code = verifier.issue_code(7).await.unwrap();

        assert!(!verifier.verify_code(7, &wrong_code(&code)).await.unwrap());
        assert!(verifier.has_pending_code(7).await.unwrap());

        assert!(verifier.verify_code(7, &code).await.unwrap());
        assert!(!verifier.verify_code(7, &code).await.unwrap());
        assert!(!verifier.has_pending_code(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_new_code_replaces_pending() {
        let verifier = verifier();
        let first = verifier.issue_code("7").await.unwrap();
        let second = verifier.issue_code(7).await.unwrap();
        if first != second {
            assert!(!verifier.verify_code(7, &first).await.unwrap());
        }
        assert!(verifier.verify_code(7, &second).await.unwrap());
    }

    #[tokio::test]
    async fn test_code_expires() {
        let verifier = SecondAuthVerifier::new(create_memory_store(), Duration::from_millis(30));
        let code = verifier.issue_code(3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!verifier.verify_code(3, &code).await.unwrap());
    }

    #[tokio::test]
    async fn test_verified_flag_has_own_expiry() {
        let verifier = verifier();
        assert!(!verifier.is_verified(7).await.unwrap());

        verifier.mark_verified(7, Duration::from_millis(40)).await.unwrap();
        assert!(verifier.is_verified(7).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!verifier.is_verified(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear() {
        let verifier = verifier();
        verifier.issue_code(9).await.unwrap();
        verifier.mark_verified(9, Duration::from_secs(60)).await.unwrap();

        verifier.clear(9).await.unwrap();
        assert!(!verifier.is_verified(9).await.unwrap());
        assert!(!verifier.has_pending_code(9).await.unwrap());
    }
}
