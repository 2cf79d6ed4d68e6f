//! Executor outcome classification
//!
//! Maps raw invocation results onto the retry taxonomy. The two load-bearing
//! patterns are the executor's lockout marker (`usage limit reached|<epoch>`)
//! and its re-authentication prompt (`Invalid API key`); everything else is
//! transient or permanent by stderr heuristics.

use std::sync::LazyLock;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;

use crate::error::ExecutionError;

use super::executor::ExecutionOutput;

static RATE_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"usage limit reached\|(\d+)").unwrap());

static SESSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Invalid API key|Please run /login").unwrap());

static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate.?limit|overloaded|timed? ?out|econnreset|etimedout|temporar").unwrap()
});

static TOKENS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(?:input|output)_tokens"\s*:\s*(\d+)"#).unwrap());

/// How one finished invocation should be handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeClass {
    /// Exit 0; tokens parsed from the output when present
    Success { tokens: Option<u64> },
    /// Executor hit its usage limit; everything pauses until `unlock_at`
    RateLimit { unlock_at: DateTime<Utc> },
    /// Executor needs re-authentication; operator action required
    SessionInvalid,
    /// The task ran past its deadline and was killed
    Timeout,
    /// Recognized transient failure; retry with back-off
    Transient,
    /// Unrecognized failure; one retry, then fail
    Permanent,
    /// The executor process could not run at all
    Crash,
}

/// Classify one invocation result
pub fn classify(result: &Result<ExecutionOutput, ExecutionError>) -> OutcomeClass {
    let output = match result {
        Ok(output) => output,
        Err(ExecutionError::Timeout { .. }) => return OutcomeClass::Timeout,
        Err(ExecutionError::Spawn(_)) | Err(ExecutionError::Killed) => return OutcomeClass::Crash,
    };

    let combined = combined_output(output);

    // Lockout and session markers win regardless of exit code
    if let Some(captures) = RATE_LIMIT_RE.captures(&combined) {
        let unlock_at = captures
            .get(1)
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(60));
        return OutcomeClass::RateLimit { unlock_at };
    }
    if SESSION_RE.is_match(&combined) {
        return OutcomeClass::SessionInvalid;
    }

    if output.exit_code == 0 {
        return OutcomeClass::Success {
            tokens: parse_tokens(&output.stdout),
        };
    }

    if TRANSIENT_RE.is_match(&combined) {
        OutcomeClass::Transient
    } else {
        OutcomeClass::Permanent
    }
}

fn combined_output(output: &ExecutionOutput) -> String {
    let mut combined = String::with_capacity(output.stdout.len() + output.stderr.len() + 1);
    combined.push_str(&output.stdout);
    combined.push('\n');
    combined.push_str(&output.stderr);
    combined
}

/// Sum the token counts the executor printed, if any
pub fn parse_tokens(stdout: &str) -> Option<u64> {
    let mut total: Option<u64> = None;
    for captures in TOKENS_RE.captures_iter(stdout) {
        if let Some(n) = captures.get(1).and_then(|m| m.as_str().parse::<u64>().ok()) {
            total = Some(total.unwrap_or(0) + n);
        }
    }
    total
}

/// Short human-readable reason for failure events
pub fn failure_reason(result: &Result<ExecutionOutput, ExecutionError>) -> String {
    match result {
        Ok(output) => {
            let stderr_head: String = output.stderr.lines().next().unwrap_or("").chars().take(200).collect();
            if stderr_head.is_empty() {
                format!("exit code {}", output.exit_code)
            } else {
                stderr_head
            }
        }
        Err(e) => e.to_string(),
    }
}
