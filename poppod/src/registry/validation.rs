//! Project directory validation
//!
//! A pure function over the filesystem: no registry state is touched, so the
//! same directory always yields the same report.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::record::ProjectRecord;

/// Minimum runtime version a project's `.poppo/config.json` may require
pub const RUNTIME_VERSION: u32 = 1;

/// Descriptor files that mark a directory as a buildable project
const DESCRIPTORS: &[&str] = &["package.json", "Cargo.toml", "pyproject.toml", "go.mod", "Makefile"];

/// Result of validating a project directory
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub score: u8,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Validate a project directory against its record.
///
/// Issues make the report invalid; warnings and recommendations only lower
/// the score. Scoring starts at 100 and subtracts per finding.
pub fn validate_project_dir(path: &Path, record: &ProjectRecord) -> ValidationReport {
    let mut report = ValidationReport {
        valid: true,
        score: 100,
        ..Default::default()
    };

    if !path.is_dir() {
        report.issues.push(format!("{} is not a directory", path.display()));
        finish(&mut report);
        return report;
    }

    let has_descriptor = DESCRIPTORS.iter().any(|d| path.join(d).exists());
    if !has_descriptor {
        report
            .warnings
            .push("no project descriptor (package.json, Cargo.toml, ...) found".into());
    }

    let poppo_config = path.join(".poppo").join("config.json");
    if !poppo_config.exists() {
        report
            .recommendations
            .push(".poppo/config.json missing; defaults will apply".into());
    } else {
        match std::fs::read_to_string(&poppo_config) {
            Ok(content) => match serde_json::from_str::<serde_json::Value>(&content) {
                Ok(value) => check_runtime_version(&value, &mut report),
                Err(e) => report.issues.push(format!(".poppo/config.json is not valid JSON: {e}")),
            },
            Err(e) => report.issues.push(format!(".poppo/config.json unreadable: {e}")),
        }
    }

    if !is_writable(path) {
        report.issues.push(format!("{} is not writable", path.display()));
    }

    if let Err(range_issue) = record.check_ranges() {
        report.issues.push(range_issue);
    }

    finish(&mut report);
    report
}

fn check_runtime_version(config: &serde_json::Value, report: &mut ValidationReport) {
    if let Some(required) = config.get("minRuntimeVersion").and_then(|v| v.as_u64())
        && required > u64::from(RUNTIME_VERSION)
    {
        report.issues.push(format!(
            "project requires runtime version {required}, daemon provides {RUNTIME_VERSION}"
        ));
    }
}

fn is_writable(path: &Path) -> bool {
    let probe = path.join(".poppo-write-probe");
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

fn finish(report: &mut ValidationReport) {
    let penalty = report.issues.len() * 30 + report.warnings.len() * 10 + report.recommendations.len() * 5;
    report.score = 100u8.saturating_sub(penalty.min(100) as u8);
    report.valid = report.issues.is_empty();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record_for(path: &Path) -> ProjectRecord {
        ProjectRecord::new(path.to_path_buf(), Utc::now())
    }

    #[test]
    fn test_missing_directory_is_invalid() {
        let report = validate_project_dir(Path::new("/nonexistent/xyz"), &record_for(Path::new("/nonexistent/xyz")));
        assert!(!report.valid);
        assert!(report.score < 100);
    }

    #[test]
    fn test_complete_project_scores_high() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("package.json"), "{}").unwrap();
        std::fs::create_dir_all(temp.path().join(".poppo")).unwrap();
        std::fs::write(temp.path().join(".poppo/config.json"), "{}").unwrap();

        let report = validate_project_dir(temp.path(), &record_for(temp.path()));
        assert!(report.valid);
        assert_eq!(report.score, 100);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_missing_descriptor_warns() {
        let temp = TempDir::new().unwrap();
        let report = validate_project_dir(temp.path(), &record_for(temp.path()));
        assert!(report.valid, "warnings alone do not invalidate");
        assert!(!report.warnings.is_empty());
        assert!(report.score < 100);
    }

    #[test]
    fn test_malformed_project_config_is_an_issue() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".poppo")).unwrap();
        std::fs::write(temp.path().join(".poppo/config.json"), "{broken").unwrap();

        let report = validate_project_dir(temp.path(), &record_for(temp.path()));
        assert!(!report.valid);
    }

    #[test]
    fn test_future_runtime_version_is_an_issue() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".poppo")).unwrap();
        std::fs::write(
            temp.path().join(".poppo/config.json"),
            r#"{"minRuntimeVersion": 99}"#,
        )
        .unwrap();

        let report = validate_project_dir(temp.path(), &record_for(temp.path()));
        assert!(!report.valid);
        assert!(report.issues.iter().any(|i| i.contains("runtime version")));
    }

    #[test]
    fn test_bad_record_ranges_surface_as_issue() {
        let temp = TempDir::new().unwrap();
        let mut record = record_for(temp.path());
        record.weight = 99.0;

        let report = validate_project_dir(temp.path(), &record);
        assert!(!report.valid);
        assert!(report.issues.iter().any(|i| i.contains("weight")));
    }
}
