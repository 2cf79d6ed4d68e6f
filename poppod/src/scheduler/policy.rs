//! Scheduling policies
//!
//! A policy picks one project out of the eligible set. All four policies are
//! pure over their own state plus the candidate list, which keeps them
//! directly testable without a running daemon.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::SchedulingStrategy;

/// Upper bound on accumulated deficit credits
const CREDIT_CAP: f64 = 1_000.0;

/// One eligible project as seen by the policy
#[derive(Debug, Clone)]
pub struct Candidate {
    pub project_id: String,
    pub priority: u8,
    pub weight: f64,
    /// How long since this project last received a dispatch
    pub idle_for: Duration,
    /// Nearest deadline among the project's queued tasks
    pub nearest_deadline: Option<DateTime<Utc>>,
}

/// Policy state machine; one instance lives for the scheduler's lifetime
#[derive(Debug)]
pub enum Policy {
    RoundRobin {
        last_picked: Option<String>,
    },
    Priority,
    /// Deficit round robin: every pick call deposits a weight-proportional
    /// credit; a project runs only when its balance reaches one credit.
    WeightedRoundRobin {
        credits: HashMap<String, f64>,
    },
    DeadlineAware {
        credits: HashMap<String, f64>,
    },
}

impl Policy {
    pub fn for_strategy(strategy: SchedulingStrategy) -> Self {
        match strategy {
            SchedulingStrategy::RoundRobin => Self::RoundRobin { last_picked: None },
            SchedulingStrategy::Priority => Self::Priority,
            SchedulingStrategy::Weighted | SchedulingStrategy::WeightedRoundRobin => {
                Self::WeightedRoundRobin {
                    credits: HashMap::new(),
                }
            }
            SchedulingStrategy::DeadlineAware => Self::DeadlineAware {
                credits: HashMap::new(),
            },
        }
    }

    /// Pick the next project to dispatch
    pub fn pick(&mut self, candidates: &[Candidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            Self::RoundRobin { last_picked } => pick_round_robin(candidates, last_picked),
            Self::Priority => pick_priority(candidates),
            Self::WeightedRoundRobin { credits } => pick_deficit(candidates, credits),
            Self::DeadlineAware { credits } => {
                let nearest = candidates
                    .iter()
                    .filter(|c| c.nearest_deadline.is_some())
                    .min_by_key(|c| c.nearest_deadline);
                match nearest {
                    Some(candidate) => Some(candidate.project_id.clone()),
                    None => pick_deficit(candidates, credits),
                }
            }
        }
    }

    /// Drop a project's state when it is unregistered
    pub fn forget(&mut self, project_id: &str) {
        match self {
            Self::RoundRobin { last_picked } => {
                if last_picked.as_deref() == Some(project_id) {
                    *last_picked = None;
                }
            }
            Self::Priority => {}
            Self::WeightedRoundRobin { credits } | Self::DeadlineAware { credits } => {
                credits.remove(project_id);
            }
        }
    }
}

fn pick_round_robin(candidates: &[Candidate], last_picked: &mut Option<String>) -> Option<String> {
    let mut ids: Vec<&str> = candidates.iter().map(|c| c.project_id.as_str()).collect();
    ids.sort_unstable();

    let next = match last_picked.as_deref() {
        Some(last) => ids.iter().find(|id| **id > last).or_else(|| ids.first()),
        None => ids.first(),
    }?;

    let picked = (*next).to_string();
    *last_picked = Some(picked.clone());
    Some(picked)
}

fn pick_priority(candidates: &[Candidate]) -> Option<String> {
    candidates
        .iter()
        .max_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.idle_for.cmp(&b.idle_for))
        })
        .map(|c| c.project_id.clone())
}

fn pick_deficit(candidates: &[Candidate], credits: &mut HashMap<String, f64>) -> Option<String> {
    let total_weight: f64 = candidates.iter().map(|c| c.weight).sum();
    if total_weight <= 0.0 {
        return None;
    }

    // Sorted iteration keeps tie-breaks deterministic
    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_unstable_by(|a, b| a.project_id.cmp(&b.project_id));

    // Deposit credits until someone can afford a dispatch. Each round
    // deposits one full credit across the set, so the candidate with the
    // largest weight reaches one credit within candidate-count rounds.
    for _ in 0..candidates.len() + 2 {
        for candidate in &sorted {
            let entry = credits.entry(candidate.project_id.clone()).or_insert(0.0);
            *entry = (*entry + candidate.weight / total_weight).min(CREDIT_CAP);
        }

        let winner = sorted
            .iter()
            .filter(|c| credits.get(&c.project_id).copied().unwrap_or(0.0) >= 1.0)
            .max_by(|a, b| {
                let ca = credits.get(&a.project_id).copied().unwrap_or(0.0);
                let cb = credits.get(&b.project_id).copied().unwrap_or(0.0);
                ca.total_cmp(&cb)
            });

        if let Some(candidate) = winner {
            let picked = candidate.project_id.clone();
            if let Some(balance) = credits.get_mut(&picked) {
                *balance -= 1.0;
            }
            return Some(picked);
        }
    }
    None
}
