//! Dispatch fairness accounting
//!
//! Tracks which project received each of the last N dispatches and computes
//! Jain's fairness index over the window.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

/// Default window size (dispatches)
pub const DEFAULT_WINDOW: usize = 1000;

/// Sliding ledger of recent dispatches
#[derive(Debug)]
pub struct FairnessLedger {
    window: VecDeque<String>,
    capacity: usize,
    total_dispatches: u64,
}

/// Snapshot for the IPC surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FairnessReport {
    pub index: f64,
    pub window: usize,
    pub total_dispatches: u64,
    pub shares: HashMap<String, usize>,
}

impl FairnessLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            total_dispatches: 0,
        }
    }

    /// Record one dispatch for a project
    pub fn record(&mut self, project_id: &str) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(project_id.to_string());
        self.total_dispatches += 1;
    }

    /// Dispatches per project inside the window
    pub fn shares(&self) -> HashMap<String, usize> {
        let mut shares: HashMap<String, usize> = HashMap::new();
        for id in &self.window {
            *shares.entry(id.clone()).or_default() += 1;
        }
        shares
    }

    /// Jain's fairness index: `(sum shares)^2 / (n * sum shares^2)`.
    ///
    /// 1.0 means perfectly even shares; 1/n means one project took all.
    /// An empty window reports 1.0.
    pub fn jain_index(&self) -> f64 {
        let shares = self.shares();
        if shares.is_empty() {
            return 1.0;
        }
        let sum: f64 = shares.values().map(|&s| s as f64).sum();
        let sum_sq: f64 = shares.values().map(|&s| (s as f64).powi(2)).sum();
        let n = shares.len() as f64;
        (sum * sum) / (n * sum_sq)
    }

    pub fn report(&self) -> FairnessReport {
        FairnessReport {
            index: self.jain_index(),
            window: self.window.len(),
            total_dispatches: self.total_dispatches,
            shares: self.shares(),
        }
    }
}

impl Default for FairnessLedger {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window_is_fair() {
        let ledger = FairnessLedger::default();
        assert!((ledger.jain_index() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_even_shares_score_one() {
        let mut ledger = FairnessLedger::default();
        for _ in 0..100 {
            ledger.record("a");
            ledger.record("b");
        }
        assert!((ledger.jain_index() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_project_scores_one_over_n() {
        let mut ledger = FairnessLedger::default();
        for _ in 0..100 {
            ledger.record("a");
        }
        ledger.record("b");
        // Shares 100:1 over two projects -> index near 0.5
        let index = ledger.jain_index();
        assert!(index > 0.5 && index < 0.52, "got {index}");
    }

    #[test]
    fn test_weighted_shares_match_closed_form() {
        // Shares proportional to weights 1 and 3:
        // (1+3)^2 / (2 * (1+9)) = 16/20 = 0.8
        let mut ledger = FairnessLedger::default();
        for _ in 0..250 {
            ledger.record("a");
        }
        for _ in 0..750 {
            ledger.record("b");
        }
        assert!((ledger.jain_index() - 0.8).abs() < 0.01);
    }

    #[test]
    fn test_window_slides() {
        let mut ledger = FairnessLedger::new(10);
        for _ in 0..10 {
            ledger.record("old");
        }
        for _ in 0..10 {
            ledger.record("new");
        }
        let shares = ledger.shares();
        assert_eq!(shares.get("old"), None);
        assert_eq!(shares["new"], 10);
        assert_eq!(ledger.report().total_dispatches, 20);
    }
}
