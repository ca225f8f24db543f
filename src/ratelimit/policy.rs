//! Rate limit policies and their configuration form.
//!
//! Policies are declared per endpoint category. The configuration form
//! ([`PolicyRule`]) expresses durations in seconds and is validated when
//! converted into a [`RateLimitPolicy`].

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

pub const GUEST_SESSION: &str = "guest_session";
pub const LESSON_COMPLETE: &str = "lesson_complete";
pub const HEARTS_FROM_AD: &str = "hearts_from_ad";
pub const API_GENERAL: &str = "api_general";
pub const API_STRICT: &str = "api_strict";

/// Longest window or block accepted from configuration (ten years).
const MAX_DURATION_SECS: i64 = 10 * 365 * 24 * 3600;

/// The limit applied to one endpoint category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Category this policy applies to
    pub endpoint_category: String,
    /// Requests admitted per window
    pub max_requests: u32,
    /// Length of a counting window
    pub window_size: TimeDelta,
    /// How long a key stays blocked once it exceeds the window limit
    pub block_duration: TimeDelta,
    pub description: String,
}

impl RateLimitPolicy {
    pub fn new(
        endpoint_category: impl Into<String>,
        max_requests: u32,
        window_size: TimeDelta,
        block_duration: TimeDelta,
        description: impl Into<String>,
    ) -> Self {
        Self {
            endpoint_category: endpoint_category.into(),
            max_requests,
            window_size,
            block_duration,
            description: description.into(),
        }
    }

    /// The built-in policy table.
    pub fn defaults() -> Vec<RateLimitPolicy> {
        vec![
            Self::new(
                GUEST_SESSION,
                5,
                TimeDelta::minutes(15),
                TimeDelta::minutes(30),
                "Guest session creation per device",
            ),
            Self::new(
                LESSON_COMPLETE,
                10,
                TimeDelta::hours(1),
                TimeDelta::hours(2),
                "Lesson completions per session",
            ),
            Self::new(
                HEARTS_FROM_AD,
                20,
                TimeDelta::hours(1),
                TimeDelta::hours(6),
                "Heart rewards from ads per session",
            ),
            Self::new(
                API_GENERAL,
                1000,
                TimeDelta::hours(1),
                TimeDelta::hours(1),
                "General API traffic per client",
            ),
            Self::new(
                API_STRICT,
                100,
                TimeDelta::minutes(10),
                TimeDelta::hours(24),
                "Sensitive and admin traffic per client",
            ),
        ]
    }

    /// Check the policy is usable by the evaluator.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint_category.trim().is_empty() {
            return Err(TollgateError::Config(
                "policy endpoint_category must not be empty".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}' must allow at least one request",
                self.endpoint_category
            )));
        }
        if self.window_size <= TimeDelta::zero() || self.block_duration <= TimeDelta::zero() {
            return Err(TollgateError::Config(format!(
                "policy '{}' must have positive window and block durations",
                self.endpoint_category
            )));
        }
        let max = TimeDelta::seconds(MAX_DURATION_SECS);
        if self.window_size > max || self.block_duration > max {
            return Err(TollgateError::Config(format!(
                "policy '{}': window and block must not exceed {} seconds",
                self.endpoint_category, MAX_DURATION_SECS
            )));
        }
        Ok(())
    }
}

/// A policy as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub endpoint_category: String,
    pub max_requests: u32,
    /// Window length in seconds
    pub window_secs: u64,
    /// Block length in seconds
    pub block_secs: u64,
    #[serde(default)]
    pub description: String,
}

impl PolicyRule {
    /// The configuration form of the built-in policy table.
    pub fn defaults() -> Vec<PolicyRule> {
        RateLimitPolicy::defaults().iter().map(PolicyRule::from).collect()
    }
}

impl From<&RateLimitPolicy> for PolicyRule {
    fn from(policy: &RateLimitPolicy) -> Self {
        Self {
            endpoint_category: policy.endpoint_category.clone(),
            max_requests: policy.max_requests,
            window_secs: policy.window_size.num_seconds().max(0) as u64,
            block_secs: policy.block_duration.num_seconds().max(0) as u64,
            description: policy.description.clone(),
        }
    }
}

impl TryFrom<PolicyRule> for RateLimitPolicy {
    type Error = TollgateError;

    fn try_from(rule: PolicyRule) -> Result<Self> {
        let window_size = seconds(&rule.endpoint_category, "window_secs", rule.window_secs)?;
        let block_duration = seconds(&rule.endpoint_category, "block_secs", rule.block_secs)?;

        let policy = RateLimitPolicy::new(
            rule.endpoint_category,
            rule.max_requests,
            window_size,
            block_duration,
            rule.description,
        );
        policy.validate()?;
        Ok(policy)
    }
}

fn seconds(category: &str, field: &str, secs: u64) -> Result<TimeDelta> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| {
            TollgateError::Config(format!("policy '{category}': {field} {secs} is out of range"))
        })
}
