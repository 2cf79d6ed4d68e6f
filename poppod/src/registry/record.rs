//! Project record model and the persisted registry document

use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::health::HealthRecord;
use crate::registry::validation::ValidationReport;

/// Generate a stable project id from its directory path.
///
/// Format: `{slug-of-dir-name}-{8-hex-of-path-hash}`, so two registrations
/// of the same path always produce the same id while different paths with
/// the same directory name stay distinct.
pub fn project_id_for_path(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    let slug = slugify(&name);
    let hash = fnv1a64(path.to_string_lossy().as_bytes());
    format!("{}-{:08x}", slug, (hash & 0xffff_ffff) as u32)
}

fn slugify(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() { "project".to_string() } else { slug }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Resource limits a project may claim from the shared pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectResources {
    /// Maximum concurrently running tasks for this project
    pub max_concurrent: usize,
    pub cpu_weight: f64,
    pub memory_limit_mb: u64,
}

impl Default for ProjectResources {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            cpu_weight: 1.0,
            memory_limit_mb: 512,
        }
    }
}

/// Daily window during which a project's tasks may be dispatched.
///
/// Times are `HH:MM` in the project's fixed UTC offset; start is inclusive,
/// end exclusive. A window with `start > end` wraps across midnight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveHours {
    pub start: String,
    pub end: String,
    /// Fixed UTC offset like `"+09:00"` or `"-05:30"`
    pub timezone: String,
}

impl ActiveHours {
    /// Whether `now` falls inside the window
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let (Some(start), Some(end), Some(offset)) = (
            parse_minutes(&self.start),
            parse_minutes(&self.end),
            parse_offset(&self.timezone),
        ) else {
            // Malformed windows never block dispatch; validation flags them
            return true;
        };

        let local = now.with_timezone(&offset);
        let minute = minutes_of_day(&local);
        if start <= end {
            minute >= start && minute < end
        } else {
            minute >= start || minute < end
        }
    }

    /// Whether all three fields parse
    pub fn is_well_formed(&self) -> bool {
        parse_minutes(&self.start).is_some()
            && parse_minutes(&self.end).is_some()
            && parse_offset(&self.timezone).is_some()
    }
}

fn minutes_of_day(local: &DateTime<FixedOffset>) -> u32 {
    use chrono::Timelike;
    local.hour() * 60 + local.minute()
}

fn parse_minutes(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = if let Some(rest) = s.strip_prefix('+') {
        (1i32, rest)
    } else if let Some(rest) = s.strip_prefix('-') {
        (-1i32, rest)
    } else {
        return None;
    };
    let (h, m) = rest.split_once(':')?;
    let h: i32 = h.parse().ok()?;
    let m: i32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (h * 3600 + m * 60))
}

/// Scheduling-related project settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectSchedule {
    pub active_hours: Option<ActiveHours>,
}

/// Rolling per-project statistics maintained by the worker pool
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectStats {
    pub total_processed: u64,
    pub total_errors: u64,
    pub avg_time_ms: f64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl ProjectStats {
    /// Fold one finished task into the rolling averages
    pub fn record(&mut self, ok: bool, duration_ms: u64, now: DateTime<Utc>) {
        let n = self.total_processed + self.total_errors;
        self.avg_time_ms = (self.avg_time_ms * n as f64 + duration_ms as f64) / (n + 1) as f64;
        if ok {
            self.total_processed += 1;
        } else {
            self.total_errors += 1;
        }
        self.last_activity_at = Some(now);
    }
}

/// One registered project
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub id: String,
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Milliseconds between polls of this project's work source
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
    #[serde(default)]
    pub resources: ProjectResources,
    #[serde(default)]
    pub schedule: ProjectSchedule,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: ProjectStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthRecord>,
    /// Set when a failed move transaction could not be rolled back
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub needs_recovery: bool,
    /// Fields this daemon version does not understand, preserved on write
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> u8 {
    50
}

fn default_weight() -> f64 {
    1.0
}

fn default_polling_interval() -> u64 {
    300_000
}

impl ProjectRecord {
    /// Create a record with defaults for a freshly registered path
    pub fn new(path: PathBuf, now: DateTime<Utc>) -> Self {
        Self {
            id: project_id_for_path(&path),
            path,
            enabled: true,
            priority: default_priority(),
            weight: default_weight(),
            polling_interval: default_polling_interval(),
            resources: ProjectResources::default(),
            schedule: ProjectSchedule::default(),
            created_at: now,
            updated_at: now,
            stats: ProjectStats::default(),
            validation: None,
            health: None,
            needs_recovery: false,
            extra: serde_json::Map::new(),
        }
    }

    /// Check field ranges; returns the first violation
    pub fn check_ranges(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("id must not be empty".into());
        }
        if !self.path.is_absolute() {
            return Err(format!("path must be absolute: {}", self.path.display()));
        }
        if self.priority > 100 {
            return Err(format!("priority {} out of range 0..=100", self.priority));
        }
        if !(0.1..=10.0).contains(&self.weight) {
            return Err(format!("weight {} out of range 0.1..=10.0", self.weight));
        }
        if self.polling_interval < 60_000 {
            return Err(format!(
                "pollingInterval {} below minimum 60000 ms",
                self.polling_interval
            ));
        }
        if self.resources.max_concurrent == 0 {
            return Err("resources.maxConcurrent must be at least 1".into());
        }
        if let Some(hours) = &self.schedule.active_hours
            && !hours.is_well_formed()
        {
            return Err(format!(
                "schedule.activeHours malformed: {} - {} {}",
                hours.start, hours.end, hours.timezone
            ));
        }
        Ok(())
    }

    /// Whether the scheduler may dispatch this project's tasks right now
    pub fn in_active_hours(&self, now: DateTime<Utc>) -> bool {
        match &self.schedule.active_hours {
            Some(hours) => hours.contains(now),
            None => true,
        }
    }
}

/// Document-level metadata for `projects.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMetadata {
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub total_projects: usize,
}

/// The persisted `projects.json` document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDocument {
    pub version: u32,
    /// Ordered by id so the document serializes deterministically
    pub projects: std::collections::BTreeMap<String, ProjectRecord>,
    pub metadata: RegistryMetadata,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: 1,
            projects: std::collections::BTreeMap::new(),
            metadata: RegistryMetadata::default(),
        }
    }
}

impl RegistryDocument {
    /// Validate the whole document before commit
    pub fn validate(&self) -> Result<(), String> {
        for (key, record) in &self.projects {
            if key != &record.id {
                return Err(format!("key {} does not match record id {}", key, record.id));
            }
            record.check_ranges().map_err(|e| format!("{}: {}", key, e))?;
        }
        let mut paths: Vec<&PathBuf> = self.projects.values().map(|r| &r.path).collect();
        paths.sort();
        paths.dedup();
        if paths.len() != self.projects.len() {
            return Err("duplicate project paths".into());
        }
        Ok(())
    }
}
