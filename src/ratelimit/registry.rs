//! Registry of rate limit policies keyed by endpoint category.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::policy::{PolicyRule, RateLimitPolicy};
use super::store::LiveWindows;
use crate::error::Result;

type PolicyMap = HashMap<String, RateLimitPolicy>;

/// Read-mostly set of policies.
///
/// Readers take a cheap clone of the current snapshot; registration builds a
/// new map and swaps it in, so a reader never observes a partial update.
pub struct ConfigRegistry {
    snapshot: RwLock<Arc<PolicyMap>>,
}

impl ConfigRegistry {
    /// Create an empty registry. Every category is unlimited.
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Create a registry holding the built-in policy table.
    pub fn with_defaults() -> Self {
        Self::from_policies(RateLimitPolicy::defaults())
    }

    /// Create a registry from configured rules, validating each one.
    pub fn from_rules(rules: &[PolicyRule]) -> Result<Self> {
        let policies = rules
            .iter()
            .cloned()
            .map(RateLimitPolicy::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_policies(policies))
    }

    /// Create a registry from already-built policies.
    pub fn from_policies(policies: impl IntoIterator<Item = RateLimitPolicy>) -> Self {
        let map: PolicyMap = policies
            .into_iter()
            .map(|p| (p.endpoint_category.clone(), p))
            .collect();
        Self {
            snapshot: RwLock::new(Arc::new(map)),
        }
    }

    /// Look up the policy for a category. `None` means unrestricted.
    pub fn policy_for(&self, category: &str) -> Option<RateLimitPolicy> {
        self.current().get(category).cloned()
    }

    /// Insert or replace a policy.
    pub fn register(&self, policy: RateLimitPolicy) -> Result<()> {
        policy.validate()?;

        let mut guard = self.snapshot.write();
        let mut next = PolicyMap::clone(&guard);
        info!(
            category = %policy.endpoint_category,
            max_requests = policy.max_requests,
            window_secs = policy.window_size.num_seconds(),
            block_secs = policy.block_duration.num_seconds(),
            "Registering rate limit policy"
        );
        next.insert(policy.endpoint_category.clone(), policy);
        *guard = Arc::new(next);
        Ok(())
    }

    /// All policies, sorted by category.
    pub fn policies(&self) -> Vec<RateLimitPolicy> {
        let mut policies: Vec<_> = self.current().values().cloned().collect();
        policies.sort_by(|a, b| a.endpoint_category.cmp(&b.endpoint_category));
        policies
    }

    /// Current window size of every configured category.
    pub fn live_windows(&self) -> LiveWindows {
        self.current()
            .iter()
            .map(|(category, policy)| (category.clone(), policy.window_size))
            .collect()
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<PolicyMap> {
        Arc::clone(&self.snapshot.read())
    }
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}
