//! Policy engine capability and its in-process implementation
//!
//! The engine works on plain strings: `(subject, object, action)` policies
//! and `(member, role)` groupings. Callers are expected to normalize subject
//! names before they reach it.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Allow/deny decision, following role groupings transitively
    async fn enforce(&self, subject: &str, object: &str, action: &str) -> Result<bool>;

    /// Returns false when the policy already existed
    async fn add_policy(&self, subject: &str, object: &str, action: &str) -> Result<bool>;

    /// Returns false when there was nothing to remove
    async fn remove_policy(&self, subject: &str, object: &str, action: &str) -> Result<bool>;

    /// `(object, action)` pairs granted directly to `subject`
    async fn policies_for(&self, subject: &str) -> Result<Vec<(String, String)>>;

    async fn add_grouping(&self, member: &str, role: &str) -> Result<bool>;

    async fn remove_grouping(&self, member: &str, role: &str) -> Result<bool>;

    /// Roles `member` belongs to directly
    async fn groupings_for(&self, member: &str) -> Result<Vec<String>>;

    /// Direct members of `role`
    async fn members_of(&self, role: &str) -> Result<Vec<String>>;

    /// Drop every policy and grouping mentioning `subject`
    async fn remove_subject(&self, subject: &str) -> Result<bool>;

    /// Roles reachable from `member` through any number of groupings
    async fn implicit_roles_for(&self, member: &str) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        let mut queue = VecDeque::from([member.to_string()]);

        while let Some(current) = queue.pop_front() {
            for role in self.groupings_for(&current).await? {
                if role != member && seen.insert(role.clone()) {
                    ordered.push(role.clone());
                    queue.push_back(role);
                }
            }
        }
        Ok(ordered)
    }

    /// Policies granted to `subject` directly or through its roles
    async fn implicit_policies_for(&self, subject: &str) -> Result<Vec<(String, String)>> {
        let mut subjects = vec![subject.to_string()];
        subjects.extend(self.implicit_roles_for(subject).await?);

        let mut seen = BTreeSet::new();
        for s in &subjects {
            seen.extend(self.policies_for(s).await?);
        }
        Ok(seen.into_iter().collect())
    }
}

/// Shared reference to a policy engine
pub type SharedPolicyEngine = Arc<dyn PolicyEngine>;

#[derive(Default)]
struct PolicySet {
    policies: BTreeSet<(String, String, String)>,
    groupings: BTreeSet<(String, String)>,
}

impl PolicySet {
    fn closure(&self, subject: &str) -> HashSet<String> {
        let mut reached = HashSet::from([subject.to_string()]);
        let mut queue = VecDeque::from([subject.to_string()]);
        while let Some(current) = queue.pop_front() {
            for (member, role) in &self.groupings {
                if *member == current && reached.insert(role.clone()) {
                    queue.push_back(role.clone());
                }
            }
        }
        reached
    }
}

/// `*` matches anything; a trailing `*` matches by prefix
fn pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" || pattern == value {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => false,
    }
}

/// In-process RBAC engine
pub struct MemoryPolicyEngine {
    inner: RwLock<PolicySet>,
}

impl MemoryPolicyEngine {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PolicySet::default()),
        }
    }

    pub async fn policy_count(&self) -> usize {
        self.inner.read().await.policies.len()
    }
}

impl Default for MemoryPolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyEngine for MemoryPolicyEngine {
    async fn enforce(&self, subject: &str, object: &str, action: &str) -> Result<bool> {
        let set = self.inner.read().await;
        let subjects = set.closure(subject);
        Ok(set.policies.iter().any(|(s, o, a)| {
            subjects.contains(s) && pattern_matches(o, object) && pattern_matches(a, action)
        }))
    }

    async fn add_policy(&self, subject: &str, object: &str, action: &str) -> Result<bool> {
        let mut set = self.inner.write().await;
        Ok(set
            .policies
            .insert((subject.to_string(), object.to_string(), action.to_string())))
    }

    async fn remove_policy(&self, subject: &str, object: &str, action: &str) -> Result<bool> {
        let mut set = self.inner.write().await;
        Ok(set
            .policies
            .remove(&(subject.to_string(), object.to_string(), action.to_string())))
    }

    async fn policies_for(&self, subject: &str) -> Result<Vec<(String, String)>> {
        let set = self.inner.read().await;
        Ok(set
            .policies
            .iter()
            .filter(|(s, _, _)| s == subject)
            .map(|(_, o, a)| (o.clone(), a.clone()))
            .collect())
    }

    async fn add_grouping(&self, member: &str, role: &str) -> Result<bool> {
        let mut set = self.inner.write().await;
        Ok(set.groupings.insert((member.to_string(), role.to_string())))
    }

    async fn remove_grouping(&self, member: &str, role: &str) -> Result<bool> {
        let mut set = self.inner.write().await;
        Ok(set.groupings.remove(&(member.to_string(), role.to_string())))
    }

    async fn groupings_for(&self, member: &str) -> Result<Vec<String>> {
        let set = self.inner.read().await;
        Ok(set
            .groupings
            .iter()
            .filter(|(m, _)| m == member)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn members_of(&self, role: &str) -> Result<Vec<String>> {
        let set = self.inner.read().await;
        Ok(set
            .groupings
            .iter()
            .filter(|(_, r)| r == role)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn remove_subject(&self, subject: &str) -> Result<bool> {
        let mut set = self.inner.write().await;
        let before = set.policies.len() + set.groupings.len();
        set.policies.retain(|(s, _, _)| s != subject);
        set.groupings.retain(|(m, r)| m != subject && r != subject);
        Ok(set.policies.len() + set.groupings.len() != before)
    }
}
