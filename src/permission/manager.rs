//! Façade over the policy engine
//!
//! Every subject goes through [`Subject::key`] before reaching the engine:
//! users become the decimal string of their id, roles become `role:<name>`.
//! Mixing raw strings and normalized keys would make lookups silently miss,
//! so the engine is never called with anything else.

use std::fmt;
use std::sync::Arc;

use crate::auth::identity::Identity;
use crate::error::{AuthError, Result};
use crate::permission::engine::{MemoryPolicyEngine, SharedPolicyEngine};

const ROLE_PREFIX: &str = "role:";

/// Who a grant or query is about
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    User(u64),
    Role(String),
}

impl Subject {
    pub fn key(&self) -> String {
        match self {
            Subject::User(id) => id.to_string(),
            Subject::Role(name) => format!("{}{}", ROLE_PREFIX, name),
        }
    }

    /// Inverse of `key`
    pub fn from_key(key: &str) -> Option<Self> {
        match key.strip_prefix(ROLE_PREFIX) {
            Some(name) => Some(Subject::Role(name.to_string())),
            None => key.parse().ok().map(Subject::User),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl From<u64> for Subject {
    fn from(id: u64) -> Self {
        Subject::User(id)
    }
}

impl From<&Identity> for Subject {
    fn from(identity: &Identity) -> Self {
        Subject::User(identity.user_id)
    }
}

/// Plain strings name roles
impl From<&str> for Subject {
    fn from(role: &str) -> Self {
        Subject::Role(role.to_string())
    }
}

fn role_key(role: &str) -> String {
    Subject::Role(role.to_string()).key()
}

pub struct PermissionManager {
    engine: SharedPolicyEngine,
}

impl PermissionManager {
    pub fn new(engine: SharedPolicyEngine) -> Self {
        Self { engine }
    }

    /// Manager over a fresh in-process engine
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPolicyEngine::new()))
    }

    pub fn engine(&self) -> &SharedPolicyEngine {
        &self.engine
    }

    pub async fn check_permission(
        &self,
        subject: impl Into<Subject>,
        object: &str,
        action: &str,
    ) -> Result<bool> {
        let subject = subject.into();
        let allowed = self.engine.enforce(&subject.key(), object, action).await?;
        log::debug!("Permission {} {} {} -> {}", subject, action, object, allowed);
        Ok(allowed)
    }

    /// Like `check_permission`, but a denial is an error
    pub async fn require_permission(
        &self,
        subject: impl Into<Subject>,
        object: &str,
        action: &str,
    ) -> Result<()> {
        let subject = subject.into();
        if self.check_permission(subject.clone(), object, action).await? {
            Ok(())
        } else {
            log::warn!("SECURITY: Permission denied - Subject: {}, Action: {}, Resource: {}", subject, action, object);
            Err(AuthError::PermissionDenied(format!(
                "{} may not {} {}",
                subject, action, object
            )))
        }
    }

    /// Role names held directly or through inheritance
    pub async fn roles_of(&self, subject: impl Into<Subject>) -> Result<Vec<String>> {
        let roles = self.engine.implicit_roles_for(&subject.into().key()).await?;
        Ok(roles
            .into_iter()
            .filter_map(|key| key.strip_prefix(ROLE_PREFIX).map(str::to_string))
            .collect())
    }

    pub async fn has_role(&self, user_id: u64, role: &str) -> Result<bool> {
        Ok(self.roles_of(user_id).await?.iter().any(|r| r == role))
    }

    /// `(object, action)` pairs granted directly or through roles
    pub async fn permissions_of(&self, subject: impl Into<Subject>) -> Result<Vec<(String, String)>> {
        self.engine.implicit_policies_for(&subject.into().key()).await
    }

    pub async fn assign_role(&self, user_id: u64, role: &str) -> Result<bool> {
        let added = self
            .engine
            .add_grouping(&Subject::User(user_id).key(), &role_key(role))
            .await?;
        if added {
            log::info!("Assigned role '{}' to uid={}", role, user_id);
        }
        Ok(added)
    }

    pub async fn revoke_role(&self, user_id: u64, role: &str) -> Result<bool> {
        let removed = self
            .engine
            .remove_grouping(&Subject::User(user_id).key(), &role_key(role))
            .await?;
        if removed {
            log::info!("Revoked role '{}' from uid={}", role, user_id);
        }
        Ok(removed)
    }

    /// Make `role` inherit everything granted to `parent`
    pub async fn inherit_role(&self, role: &str, parent: &str) -> Result<bool> {
        self.engine.add_grouping(&role_key(role), &role_key(parent)).await
    }

    pub async fn grant_permission(
        &self,
        subject: impl Into<Subject>,
        object: &str,
        action: &str,
    ) -> Result<bool> {
        self.engine.add_policy(&subject.into().key(), object, action).await
    }

    pub async fn revoke_permission(
        &self,
        subject: impl Into<Subject>,
        object: &str,
        action: &str,
    ) -> Result<bool> {
        self.engine.remove_policy(&subject.into().key(), object, action).await
    }

    /// Users holding `role` directly
    pub async fn users_for_role(&self, role: &str) -> Result<Vec<u64>> {
        let members = self.engine.members_of(&role_key(role)).await?;
        Ok(members
            .iter()
            .filter_map(|key| match Subject::from_key(key) {
                Some(Subject::User(id)) => Some(id),
                _ => None,
            })
            .collect())
    }

    /// Forget every grant and role assignment of a user
    pub async fn remove_user(&self, user_id: u64) -> Result<bool> {
        self.engine.remove_subject(&Subject::User(user_id).key()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_subject_normalization() {
        assert_eq!(Subject::from(42u64).key(), "42");
        assert_eq!(Subject::from("admin").key(), "role:admin");
        assert_eq!(Subject::from_key("42"), Some(Subject::User(42)));
        assert_eq!(Subject::from_key("role:admin"), Some(Subject::Role("admin".to_string())));
        assert_eq!(Subject::from_key("svc-account"), None);
    }

    #[tokio::test]
    async fn test_role_based_permission() {
        let perms = PermissionManager::in_memory();
        perms.grant_permission("admin", "/users", "delete").await.unwrap();
        perms.assign_role(1, "admin").await.unwrap();

        assert!(perms.check_permission(1u64, "/users", "delete").await.unwrap());
        assert!(!perms.check_permission(2u64, "/users", "delete").await.unwrap());
        assert_eq!(perms.roles_of(1u64).await.unwrap(), vec!["admin".to_string()]);
        assert!(perms.has_role(1, "admin").await.unwrap());
        assert_eq!(perms.users_for_role("admin").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_direct_and_inherited_permissions() {
        let perms = PermissionManager::in_memory();
        perms.grant_permission(5u64, "/reports", "read").await.unwrap();
        perms.grant_permission("auditor", "/logs", "read").await.unwrap();
        perms.grant_permission("viewer", "/dashboard", "read").await.unwrap();
        perms.inherit_role("auditor", "viewer").await.unwrap();
        perms.assign_role(5, "auditor").await.unwrap();

        let mut granted = perms.permissions_of(5u64).await.unwrap();
        granted.sort();
        assert_eq!(
            granted,
            vec![
                ("/dashboard".to_string(), "read".to_string()),
                ("/logs".to_string(), "read".to_string()),
                ("/reports".to_string(), "read".to_string()),
            ]
        );
        assert_eq!(
            perms.roles_of(5u64).await.unwrap(),
            vec!["auditor".to_string(), "viewer".to_string()]
        );
    }

    #[tokio::test]
    async fn test_revoke_and_require() {
        let perms = PermissionManager::in_memory();
        perms.grant_permission("editor", "/posts/*", "write").await.unwrap();
        perms.assign_role(9, "editor").await.unwrap();
        assert!(perms.require_permission(9u64, "/posts/17", "write").await.is_ok());

        assert!(perms.revoke_role(9, "editor").await.unwrap());
        assert!(!perms.revoke_role(9, "editor").await.unwrap());
        let err = perms.require_permission(9u64, "/posts/17", "write").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        assert!(perms.revoke_permission("editor", "/posts/*", "write").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_user() {
        let perms = PermissionManager::in_memory();
        perms.grant_permission(4u64, "/a", "read").await.unwrap();
        perms.assign_role(4, "ops").await.unwrap();

        assert!(perms.remove_user(4).await.unwrap());
        assert!(perms.roles_of(4u64).await.unwrap().is_empty());
        assert!(!perms.check_permission(4u64, "/a", "read").await.unwrap());
    }
}
