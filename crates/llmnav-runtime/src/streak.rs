//! [`StreakGuard`] – consecutive-failure counter.
//!
//! Counts back-to-back occurrences of one kind of model misbehaviour
//! (unparsable answers, dangerous actions) and signals when a configured
//! limit is reached. Any good answer resets the streak.
//!
//! # Example
//!
//! ```rust
//! use llmnav_runtime::streak::StreakGuard;
//!
//! let mut guard = StreakGuard::new(Some(2));
//! assert!(!guard.record());
//! assert!(guard.record()); // second in a row → limit reached
//!
//! guard.reset();
//! assert!(!guard.record());
//! ```

/// Counts consecutive failures against an optional limit.
#[derive(Debug, Clone)]
pub struct StreakGuard {
    /// `None` never trips.
    limit: Option<usize>,
    count: usize,
}

impl StreakGuard {
    pub fn new(limit: Option<usize>) -> Self {
        Self { limit, count: 0 }
    }

    /// Record one more failure. Returns `true` once the streak has reached
    /// the limit.
    pub fn record(&mut self) -> bool {
        self.count += 1;
        self.limit.is_some_and(|limit| self.count >= limit)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}
