//! Sliding usage windows for quota accounting

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One recorded token usage event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TokenEvent {
    pub ts: DateTime<Utc>,
    pub n: u64,
}

/// A sliding window of timestamped amounts.
///
/// Timestamps use wall-clock time because the window is persisted and must
/// survive a restart with the same meaning.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    span: Duration,
    events: VecDeque<TokenEvent>,
}

impl SlidingWindow {
    pub fn new(span: std::time::Duration) -> Self {
        Self {
            span: Duration::from_std(span).unwrap_or(Duration::seconds(60)),
            events: VecDeque::new(),
        }
    }

    /// Record an amount at `now`
    pub fn record(&mut self, now: DateTime<Utc>, n: u64) {
        self.prune(now);
        self.events.push_back(TokenEvent { ts: now, n });
    }

    /// Drop events older than the window span
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.span;
        while self.events.front().is_some_and(|e| e.ts < cutoff) {
            self.events.pop_front();
        }
    }

    /// Sum of amounts inside the window
    pub fn total(&mut self, now: DateTime<Utc>) -> u64 {
        self.prune(now);
        self.events.iter().map(|e| e.n).sum()
    }

    /// Number of events inside the window
    pub fn count(&mut self, now: DateTime<Utc>) -> usize {
        self.prune(now);
        self.events.len()
    }

    /// Time until the oldest event leaves the window
    pub fn time_to_oldest_expiry(&mut self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.prune(now);
        let oldest = self.events.front()?;
        (oldest.ts + self.span - now).to_std().ok()
    }

    /// Fraction of `limit` currently used, 0.0-1.0+
    pub fn utilization(&mut self, now: DateTime<Utc>, limit: u64) -> f64 {
        if limit == 0 {
            return 0.0;
        }
        self.total(now) as f64 / limit as f64
    }

    pub fn events(&self) -> impl Iterator<Item = &TokenEvent> {
        self.events.iter()
    }

    /// Rebuild from persisted events, dropping anything already expired
    pub fn restore(&mut self, events: Vec<TokenEvent>, now: DateTime<Utc>) {
        self.events = events.into_iter().collect();
        self.prune(now);
    }
}
