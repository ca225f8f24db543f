//! Window records and the keys that identify them.

use chrono::{DateTime, TimeDelta, Utc};

/// A key that uniquely identifies a window record.
///
/// The identifier is opaque to the limiter: an IP address, a device id or a
/// session id, already namespaced by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// The rate limited actor
    pub identifier: String,
    /// The endpoint category whose policy applies
    pub category: String,
}

impl WindowKey {
    /// Create a new window key.
    pub fn new(identifier: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            category: category.into(),
        }
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.category, self.identifier)
    }
}

/// Persisted counting state for one `(identifier, category)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRecord {
    /// The rate limited actor
    pub identifier: String,
    /// Endpoint category this record counts against
    pub endpoint_category: String,
    /// Requests counted in the current window
    pub request_count: u32,
    /// Start of the current counting window
    pub window_start: DateTime<Utc>,
    /// End of the current counting window, captured when the window opened
    pub window_end: DateTime<Utc>,
    /// When set and in the future, every request for this key is denied
    pub blocked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WindowRecord {
    /// Create a record for a freshly opened window holding one request.
    pub fn open(key: &WindowKey, now: DateTime<Utc>, window_size: TimeDelta) -> Self {
        Self {
            identifier: key.identifier.clone(),
            endpoint_category: key.category.clone(),
            request_count: 1,
            window_start: now,
            window_end: now + window_size,
            blocked_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The key this record is stored under.
    pub fn key(&self) -> WindowKey {
        WindowKey::new(self.identifier.clone(), self.endpoint_category.clone())
    }

    /// Restart the window at `now` with a count of one, clearing any block.
    pub fn reopen(&mut self, now: DateTime<Utc>, window_size: TimeDelta) {
        self.request_count = 1;
        self.window_start = now;
        self.window_end = now + window_size;
        self.blocked_until = None;
        self.updated_at = now;
    }

    /// Whether an active block denies requests at `now`.
    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.blocked_until, Some(until) if now < until)
    }

    /// Whether the window has fully elapsed under the given window size.
    pub fn window_elapsed(&self, now: DateTime<Utc>, window_size: TimeDelta) -> bool {
        self.window_start + window_size < now
    }

    /// Whether no future evaluation can consult this record.
    ///
    /// The stored window and, when the category still has a policy, the
    /// window under its current size must both have elapsed, and no block may
    /// be active. A policy registered with a longer window keeps records
    /// alive until that window has passed.
    pub fn is_expired(&self, now: DateTime<Utc>, live_window: Option<TimeDelta>) -> bool {
        self.window_end < now
            && live_window.map_or(true, |window| self.window_elapsed(now, window))
            && !self.is_blocked(now)
    }
}
