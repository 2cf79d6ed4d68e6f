//! Project health measurement and scoring
//!
//! Measurement is a pure function over the project directory plus its rolling
//! stats; history and trend live with the health tracker, which keeps the
//! last 100 scores per project.

use std::collections::VecDeque;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::ProjectStats;

/// Number of measurements retained per project for trend computation
pub const HISTORY_CAPACITY: usize = 100;

/// Staleness threshold (days) that triggers a maintenance alert
pub const STALENESS_ALERT_DAYS: u64 = 30;

/// Security score below which an alert fires
pub const SECURITY_ALERT_SCORE: f64 = 50.0;

/// Component scores, each 0-100
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthComponents {
    pub availability: f64,
    pub security: f64,
    pub performance: f64,
    pub maintenance: f64,
    pub dependencies: f64,
    pub repository: f64,
}

impl HealthComponents {
    /// Weighted overall score
    pub fn weighted_score(&self) -> f64 {
        self.availability * 0.25
            + self.security * 0.20
            + self.performance * 0.15
            + self.maintenance * 0.15
            + self.dependencies * 0.15
            + self.repository * 0.10
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Letter grade for a 0-100 score
pub fn grade_for(score: u8) -> char {
    match score {
        90..=100 => 'A',
        80..=89 => 'B',
        70..=79 => 'C',
        60..=69 => 'D',
        _ => 'F',
    }
}

/// One health measurement, cached on the project record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub score: u8,
    pub grade: char,
    pub last_checked: DateTime<Utc>,
    pub components: HealthComponents,
    /// Days since the most recent change in the project directory
    pub staleness_days: u64,
}

impl HealthRecord {
    pub fn from_components(components: HealthComponents, staleness_days: u64, now: DateTime<Utc>) -> Self {
        let score = components.weighted_score().round().clamp(0.0, 100.0) as u8;
        let status = match score {
            70..=100 => HealthStatus::Healthy,
            40..=69 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        };
        Self {
            status,
            score,
            grade: grade_for(score),
            last_checked: now,
            components,
            staleness_days,
        }
    }
}

/// Measure a project's health components from its directory and stats
pub fn measure(path: &Path, stats: &ProjectStats) -> (HealthComponents, u64) {
    let staleness_days = staleness_days(path);
    let components = HealthComponents {
        availability: availability_score(path),
        security: security_score(path),
        performance: performance_score(stats),
        maintenance: maintenance_score(staleness_days),
        dependencies: dependency_score(path),
        repository: repository_score(path),
    };
    (components, staleness_days)
}

fn availability_score(path: &Path) -> f64 {
    if !path.is_dir() {
        return 0.0;
    }
    // Readable directory scores half; writable scores full
    let probe = path.join(".poppo-health-probe");
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            100.0
        }
        Err(_) => 50.0,
    }
}

fn security_score(path: &Path) -> f64 {
    let mut score = 0.0;
    if path.join("SECURITY.md").exists() || path.join(".github/SECURITY.md").exists() {
        score += 40.0;
    }
    if path.join(".gitignore").exists() {
        score += 30.0;
    }
    if !path.join(".env").exists() {
        score += 30.0;
    }
    score
}

fn performance_score(stats: &ProjectStats) -> f64 {
    let total = stats.total_processed + stats.total_errors;
    if total == 0 {
        // No history yet; neutral score
        return 70.0;
    }
    let success_rate = stats.total_processed as f64 / total as f64;
    (success_rate * 100.0).clamp(0.0, 100.0)
}

fn maintenance_score(staleness_days: u64) -> f64 {
    match staleness_days {
        0..=7 => 100.0,
        8..=90 => {
            // Linear decay from 100 at a week to 0 at ninety days
            let span = (90 - 7) as f64;
            100.0 * (90.0 - staleness_days as f64) / span
        }
        _ => 0.0,
    }
}

fn dependency_score(path: &Path) -> f64 {
    let count = dependency_count(path);
    match count {
        None => 70.0,
        Some(0..=20) => 100.0,
        Some(21..=50) => 80.0,
        Some(51..=100) => 60.0,
        Some(_) => 40.0,
    }
}

fn dependency_count(path: &Path) -> Option<usize> {
    let package_json = path.join("package.json");
    if package_json.exists()
        && let Ok(content) = std::fs::read_to_string(&package_json)
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(&content)
    {
        let deps = value.get("dependencies").and_then(|d| d.as_object()).map_or(0, |m| m.len());
        let dev = value
            .get("devDependencies")
            .and_then(|d| d.as_object())
            .map_or(0, |m| m.len());
        return Some(deps + dev);
    }

    let cargo_toml = path.join("Cargo.toml");
    if cargo_toml.exists()
        && let Ok(content) = std::fs::read_to_string(&cargo_toml)
    {
        let mut in_deps = false;
        let mut count = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('[') {
                in_deps = line.contains("dependencies");
                continue;
            }
            if in_deps && line.contains('=') {
                count += 1;
            }
        }
        return Some(count);
    }

    None
}

fn repository_score(path: &Path) -> f64 {
    let mut score = 0.0;
    if path.join(".git").exists() {
        score += 60.0;
    }
    if path.join("README.md").exists() || path.join("README").exists() {
        score += 40.0;
    }
    score
}

/// Days since the newest modification among the directory's top-level entries
fn staleness_days(path: &Path) -> u64 {
    let mut newest: Option<SystemTime> = None;
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return u64::MAX,
    };
    for entry in entries.flatten() {
        if let Ok(meta) = entry.metadata()
            && let Ok(modified) = meta.modified()
        {
            newest = Some(match newest {
                Some(prev) if prev > modified => prev,
                _ => modified,
            });
        }
    }
    match newest.and_then(|t| t.elapsed().ok()) {
        Some(elapsed) => elapsed.as_secs() / 86_400,
        None => 0,
    }
}

/// Direction of recent health changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthTrend {
    Improving,
    Stable,
    Declining,
}

/// Rolling window of health scores for one project
#[derive(Debug, Clone, Default)]
pub struct HealthHistory {
    scores: VecDeque<f64>,
}

impl HealthHistory {
    pub fn push(&mut self, score: f64) {
        if self.scores.len() == HISTORY_CAPACITY {
            self.scores.pop_front();
        }
        self.scores.push_back(score);
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Compare the mean of the older half against the newer half
    pub fn trend(&self) -> HealthTrend {
        if self.scores.len() < 4 {
            return HealthTrend::Stable;
        }
        let mid = self.scores.len() / 2;
        let older: f64 = self.scores.iter().take(mid).sum::<f64>() / mid as f64;
        let newer: f64 =
            self.scores.iter().skip(mid).sum::<f64>() / (self.scores.len() - mid) as f64;

        let delta = newer - older;
        if delta > 2.0 {
            HealthTrend::Improving
        } else if delta < -2.0 {
            HealthTrend::Declining
        } else {
            HealthTrend::Stable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_weighted_score_uses_documented_weights() {
        let components = HealthComponents {
            availability: 100.0,
            security: 0.0,
            performance: 0.0,
            maintenance: 0.0,
            dependencies: 0.0,
            repository: 0.0,
        };
        assert!((components.weighted_score() - 25.0).abs() < f64::EPSILON);

        let all_full = HealthComponents {
            availability: 100.0,
            security: 100.0,
            performance: 100.0,
            maintenance: 100.0,
            dependencies: 100.0,
            repository: 100.0,
        };
        assert!((all_full.weighted_score() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_grades() {
        assert_eq!(grade_for(95), 'A');
        assert_eq!(grade_for(90), 'A');
        assert_eq!(grade_for(85), 'B');
        assert_eq!(grade_for(72), 'C');
        assert_eq!(grade_for(61), 'D');
        assert_eq!(grade_for(59), 'F');
        assert_eq!(grade_for(0), 'F');
    }

    #[test]
    fn test_measure_missing_directory() {
        let (components, _) = measure(Path::new("/nonexistent/xyz"), &ProjectStats::default());
        assert_eq!(components.availability, 0.0);
    }

    #[test]
    fn test_measure_fresh_project() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".gitignore"), "target/").unwrap();
        std::fs::write(temp.path().join("README.md"), "# demo").unwrap();

        let (components, staleness) = measure(temp.path(), &ProjectStats::default());
        assert_eq!(components.availability, 100.0);
        assert_eq!(staleness, 0);
        assert!(components.maintenance >= 99.0);
        // .gitignore (30) + no .env (30)
        assert!((components.security - 60.0).abs() < f64::EPSILON);
        // README without .git
        assert!((components.repository - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_performance_score_tracks_error_rate() {
        let mut stats = ProjectStats::default();
        assert!((performance_score(&stats) - 70.0).abs() < f64::EPSILON);

        stats.total_processed = 9;
        stats.total_errors = 1;
        assert!((performance_score(&stats) - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_health_record_status_bands() {
        let mk = |score: f64| {
            let components = HealthComponents {
                availability: score,
                security: score,
                performance: score,
                maintenance: score,
                dependencies: score,
                repository: score,
            };
            HealthRecord::from_components(components, 0, Utc::now())
        };

        assert_eq!(mk(95.0).status, HealthStatus::Healthy);
        assert_eq!(mk(50.0).status, HealthStatus::Degraded);
        assert_eq!(mk(10.0).status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_history_caps_at_capacity() {
        let mut history = HealthHistory::default();
        for i in 0..150 {
            history.push(i as f64);
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_trend_detection() {
        let mut improving = HealthHistory::default();
        for score in [50.0, 55.0, 60.0, 80.0, 85.0, 90.0] {
            improving.push(score);
        }
        assert_eq!(improving.trend(), HealthTrend::Improving);

        let mut declining = HealthHistory::default();
        for score in [90.0, 85.0, 80.0, 60.0, 55.0, 50.0] {
            declining.push(score);
        }
        assert_eq!(declining.trend(), HealthTrend::Declining);

        let mut stable = HealthHistory::default();
        for score in [70.0, 71.0, 70.0, 70.5, 69.5, 70.0] {
            stable.push(score);
        }
        assert_eq!(stable.trend(), HealthTrend::Stable);
    }
}
