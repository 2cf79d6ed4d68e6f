//! Rate-limit coordinator - guards the shared executor quota
//!
//! Two independent sliding windows (dispatches per minute, tokens per
//! minute) plus two global stop conditions: an emergency stop triggered by
//! an executor lockout, and a session-invalid flag that only an operator
//! clears. The ledger persists on every state change so a restart resumes
//! an active stop instead of re-entering the forbidden state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::events::{DaemonEvent, EventBus};
use crate::store::{StateKind, StateStore};

use super::window::{SlidingWindow, TokenEvent};

/// Default token estimate for a project with no execution history
const DEFAULT_TOKEN_ESTIMATE: f64 = 1_000.0;

/// Quota limits and recovery behavior
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: usize,
    pub tokens_per_minute: u64,
    pub window: Duration,
    /// Upper bound of the random delay added after `unlock_at`
    pub max_recovery_jitter: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
            window: Duration::from_secs(60),
            max_recovery_jitter: Duration::from_secs(5),
        }
    }
}

/// Why a reservation was refused outright
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmergencyStop,
    SessionInvalid,
    Quota,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmergencyStop => "emergency-stop",
            Self::SessionInvalid => "session-invalid",
            Self::Quota => "quota",
        }
    }
}

/// Verdict of `reserve`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    DelayFor(Duration),
    Reject(RejectReason),
}

/// What the worker pool reports after each executor invocation
#[derive(Debug, Clone, Default)]
pub struct OutcomeReport {
    pub ok: bool,
    pub rate_limited: bool,
    pub unlock_at: Option<DateTime<Utc>>,
    pub tokens: Option<u64>,
}

/// Persisted `rate-limit.json` document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ledger {
    window: LedgerWindow,
    emergency_stop: EmergencyStopState,
    session_invalid: SessionInvalidState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerWindow {
    requests: Vec<DateTime<Utc>>,
    tokens: Vec<TokenEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmergencyStopState {
    active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unlock_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionInvalidState {
    active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    since: Option<DateTime<Utc>>,
}

/// Utilization report for the IPC surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Utilization {
    pub token_pct: f64,
    pub request_pct: f64,
    pub predictions: Predictions,
    pub recommendation: Recommendation,
    pub emergency_stop: bool,
    pub session_invalid: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Predictions {
    /// Milliseconds until the token window saturates at the current slope
    pub time_to_token_limit_ms: Option<u64>,
    pub time_to_request_limit_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub action: &'static str,
    pub delay_ms: u64,
}

struct Inner {
    requests: SlidingWindow,
    tokens: SlidingWindow,
    emergency: Option<Emergency>,
    session_invalid: Option<DateTime<Utc>>,
    throttle: Duration,
    last_allow: Option<std::time::Instant>,
    /// Exponentially-weighted token estimate per project
    estimates: HashMap<String, f64>,
}

struct Emergency {
    reason: String,
    unlock_at: DateTime<Utc>,
    /// Jitter drawn once when the stop was set
    jitter: chrono::Duration,
}

/// The coordinator guarding the shared executor quota
pub struct RateLimitCoordinator {
    config: RateLimitConfig,
    store: Arc<StateStore>,
    bus: EventBus,
    inner: Mutex<Inner>,
}

impl RateLimitCoordinator {
    /// Restore the ledger from durable state and build the coordinator
    pub async fn load(config: RateLimitConfig, store: Arc<StateStore>, bus: EventBus) -> Self {
        let now = Utc::now();
        let mut requests = SlidingWindow::new(config.window);
        let mut tokens = SlidingWindow::new(config.window);
        let mut emergency = None;
        let mut session_invalid = None;

        match store.load::<Ledger>(StateKind::RateLimit).await {
            Ok(Some(ledger)) => {
                requests.restore(
                    ledger.window.requests.into_iter().map(|ts| TokenEvent { ts, n: 1 }).collect(),
                    now,
                );
                tokens.restore(ledger.window.tokens, now);
                if ledger.emergency_stop.active
                    && let Some(unlock_at) = ledger.emergency_stop.unlock_at
                {
                    info!(%unlock_at, "Resuming emergency stop from ledger");
                    emergency = Some(Emergency {
                        reason: ledger
                            .emergency_stop
                            .reason
                            .unwrap_or_else(|| "usage-limit".into()),
                        unlock_at,
                        jitter: chrono::Duration::zero(),
                    });
                }
                if ledger.session_invalid.active {
                    info!("Resuming session-invalid from ledger");
                    session_invalid = Some(ledger.session_invalid.since.unwrap_or(now));
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Rate-limit ledger unreadable, starting fresh"),
        }

        Self {
            config,
            store,
            bus,
            inner: Mutex::new(Inner {
                requests,
                tokens,
                emergency,
                session_invalid,
                throttle: Duration::ZERO,
                last_allow: None,
                estimates: HashMap::new(),
            }),
        }
    }

    /// Ask permission to dispatch one task for `project_id`.
    ///
    /// `estimated_tokens` defaults to the project's recent average. An
    /// `Allow` consumes one slot of the request window; actual token usage
    /// is charged on `record_outcome`.
    pub async fn reserve(&self, project_id: &str, estimated_tokens: Option<u64>) -> Decision {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        if inner.session_invalid.is_some() {
            return Decision::Reject(RejectReason::SessionInvalid);
        }

        let mut emergency_cleared = false;
        if let Some(stop) = &inner.emergency {
            if now < stop.unlock_at + stop.jitter {
                return Decision::Reject(RejectReason::EmergencyStop);
            }
            emergency_cleared = true;
        }

        let estimate = estimated_tokens.map(|n| n as f64).unwrap_or_else(|| {
            inner
                .estimates
                .get(project_id)
                .copied()
                .unwrap_or(DEFAULT_TOKEN_ESTIMATE)
        }) as u64;

        if estimate > self.config.tokens_per_minute {
            return Decision::Reject(RejectReason::Quota);
        }

        // Request-rate window
        if inner.requests.count(now) >= self.config.requests_per_minute {
            let delay = inner
                .requests
                .time_to_oldest_expiry(now)
                .unwrap_or(self.config.window);
            return Decision::DelayFor(delay);
        }

        // Token window: the estimate must fit in what remains
        let used = inner.tokens.total(now);
        if used + estimate > self.config.tokens_per_minute {
            let delay = inner
                .tokens
                .time_to_oldest_expiry(now)
                .unwrap_or(self.config.window);
            return Decision::DelayFor(delay);
        }

        // Operator throttle floor
        if !inner.throttle.is_zero()
            && let Some(last) = inner.last_allow
        {
            let since = last.elapsed();
            if since < inner.throttle {
                return Decision::DelayFor(inner.throttle - since);
            }
        }

        inner.requests.record(now, 1);
        inner.last_allow = Some(std::time::Instant::now());

        if emergency_cleared {
            inner.emergency = None;
            info!("Emergency stop cleared after recovery");
            self.persist_locked(&mut inner, now).await;
            self.bus.emit(DaemonEvent::EmergencyClear);
        }

        Decision::Allow
    }

    /// Fold an executor outcome into the ledger
    pub async fn record_outcome(&self, project_id: &str, report: &OutcomeReport) {
        let now = Utc::now();
        {
            let mut inner = self.inner.lock().await;
            if let Some(tokens) = report.tokens {
                inner.tokens.record(now, tokens);
                let estimate = inner
                    .estimates
                    .entry(project_id.to_string())
                    .or_insert(DEFAULT_TOKEN_ESTIMATE);
                *estimate = *estimate * 0.8 + tokens as f64 * 0.2;
            }
        }

        if report.rate_limited {
            let unlock_at = report
                .unlock_at
                .unwrap_or_else(|| now + chrono::Duration::seconds(60));
            self.notify_rate_limit(unlock_at).await;
        }
    }

    /// Engage the emergency stop until `unlock_at`
    pub async fn notify_rate_limit(&self, unlock_at: DateTime<Utc>) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        if let Some(existing) = &inner.emergency
            && existing.unlock_at >= unlock_at
        {
            // Already stopped at least as long; nothing to do
            return;
        }

        let jitter_ms = if self.config.max_recovery_jitter.is_zero() {
            0
        } else {
            rand::rng().random_range(0..=self.config.max_recovery_jitter.as_millis() as u64)
        };

        warn!(%unlock_at, jitter_ms, "Emergency stop engaged");
        inner.emergency = Some(Emergency {
            reason: "usage-limit".into(),
            unlock_at,
            jitter: chrono::Duration::milliseconds(jitter_ms as i64),
        });
        self.persist_locked(&mut inner, now).await;
        self.bus.emit(DaemonEvent::EmergencyStop {
            reason: "usage-limit".into(),
            unlock_at,
        });
    }

    /// Flag that the executor session needs re-authentication.
    ///
    /// Emitted exactly once per incident; repeated reports while the flag is
    /// set are ignored.
    pub async fn notify_session_invalid(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        if inner.session_invalid.is_some() {
            return;
        }

        warn!("Executor session invalid, pausing all dispatch");
        inner.session_invalid = Some(now);
        self.persist_locked(&mut inner, now).await;
        self.bus.emit(DaemonEvent::SessionInvalid);
    }

    /// Operator acknowledgment that the session was repaired
    pub async fn clear_session_invalid(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        if inner.session_invalid.take().is_none() {
            return;
        }

        info!("Session-invalid cleared");
        self.persist_locked(&mut inner, now).await;
        self.bus.emit(DaemonEvent::SessionCleared);
    }

    pub async fn session_invalid(&self) -> bool {
        self.inner.lock().await.session_invalid.is_some()
    }

    pub async fn emergency_active(&self) -> bool {
        self.inner.lock().await.emergency.is_some()
    }

    /// Floor delay applied between consecutive dispatches
    pub async fn set_throttle(&self, delay: Duration) {
        let mut inner = self.inner.lock().await;
        info!(delay_ms = delay.as_millis() as u64, "Dispatch throttle set");
        inner.throttle = delay;
    }

    /// Current window usage, saturation predictions, and a recommendation
    pub async fn utilization(&self) -> Utilization {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let token_pct = inner.tokens.utilization(now, self.config.tokens_per_minute) * 100.0;
        let request_pct =
            inner.requests.utilization(now, self.config.requests_per_minute as u64) * 100.0;

        let window_secs = self.config.window.as_secs_f64();
        let token_rate = inner.tokens.total(now) as f64 / window_secs;
        let request_rate = inner.requests.count(now) as f64 / window_secs;

        let time_to = |remaining: f64, rate: f64| {
            if rate <= 0.0 || remaining <= 0.0 {
                None
            } else {
                Some((remaining / rate * 1000.0) as u64)
            }
        };
        let predictions = Predictions {
            time_to_token_limit_ms: time_to(
                self.config.tokens_per_minute as f64 - inner.tokens.total(now) as f64,
                token_rate,
            ),
            time_to_request_limit_ms: time_to(
                self.config.requests_per_minute as f64 - inner.requests.count(now) as f64,
                request_rate,
            ),
        };

        let peak = token_pct.max(request_pct);
        let recommendation = if inner.emergency.is_some() || inner.session_invalid.is_some() {
            Recommendation {
                action: "halt",
                delay_ms: 0,
            }
        } else if peak >= 90.0 {
            Recommendation {
                action: "throttle",
                delay_ms: 5_000,
            }
        } else if peak >= 70.0 {
            Recommendation {
                action: "throttle",
                delay_ms: 1_000,
            }
        } else {
            Recommendation {
                action: "proceed",
                delay_ms: 0,
            }
        };

        Utilization {
            token_pct,
            request_pct,
            predictions,
            recommendation,
            emergency_stop: inner.emergency.is_some(),
            session_invalid: inner.session_invalid.is_some(),
        }
    }

    async fn persist_locked(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.requests.prune(now);
        inner.tokens.prune(now);
        let ledger = Ledger {
            window: LedgerWindow {
                requests: inner.requests.events().map(|e| e.ts).collect(),
                tokens: inner.tokens.events().copied().collect(),
            },
            emergency_stop: match &inner.emergency {
                Some(stop) => EmergencyStopState {
                    active: true,
                    reason: Some(stop.reason.clone()),
                    unlock_at: Some(stop.unlock_at),
                },
                None => EmergencyStopState::default(),
            },
            session_invalid: SessionInvalidState {
                active: inner.session_invalid.is_some(),
                since: inner.session_invalid,
            },
        };

        if let Err(e) = self.store.save(StateKind::RateLimit, &ledger).await {
            warn!(error = %e, "Failed to persist rate-limit ledger");
        } else {
            debug!("Rate-limit ledger persisted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_no_jitter() -> RateLimitConfig {
        RateLimitConfig {
            max_recovery_jitter: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn coordinator(root: &std::path::Path, config: RateLimitConfig) -> RateLimitCoordinator {
        let store = Arc::new(StateStore::open(root).unwrap());
        RateLimitCoordinator::load(config, store, EventBus::default()).await
    }

    #[tokio::test]
    async fn test_reserve_allows_under_quota() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(temp.path(), config_no_jitter()).await;

        assert_eq!(coord.reserve("p", Some(500)).await, Decision::Allow);
    }

    #[tokio::test]
    async fn test_request_window_delays() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(
            temp.path(),
            RateLimitConfig {
                requests_per_minute: 2,
                ..config_no_jitter()
            },
        )
        .await;

        assert_eq!(coord.reserve("p", Some(1)).await, Decision::Allow);
        assert_eq!(coord.reserve("p", Some(1)).await, Decision::Allow);
        assert!(matches!(coord.reserve("p", Some(1)).await, Decision::DelayFor(_)));
    }

    #[tokio::test]
    async fn test_oversized_estimate_rejected() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(
            temp.path(),
            RateLimitConfig {
                tokens_per_minute: 1_000,
                ..config_no_jitter()
            },
        )
        .await;

        assert_eq!(
            coord.reserve("p", Some(5_000)).await,
            Decision::Reject(RejectReason::Quota)
        );
    }

    #[tokio::test]
    async fn test_emergency_stop_rejects_until_unlock() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(temp.path(), config_no_jitter()).await;

        let unlock_at = Utc::now() + chrono::Duration::milliseconds(200);
        coord.notify_rate_limit(unlock_at).await;

        assert_eq!(
            coord.reserve("p", Some(1)).await,
            Decision::Reject(RejectReason::EmergencyStop)
        );
        assert!(coord.emergency_active().await);

        tokio::time::sleep(Duration::from_millis(250)).await;

        // First reserve after unlock clears the stop
        assert_eq!(coord.reserve("p", Some(1)).await, Decision::Allow);
        assert!(!coord.emergency_active().await);
    }

    #[tokio::test]
    async fn test_emergency_clear_event_emitted() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(temp.path()).unwrap());
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let coord = RateLimitCoordinator::load(config_no_jitter(), store, bus).await;

        coord.notify_rate_limit(Utc::now() + chrono::Duration::milliseconds(50)).await;
        assert_eq!(events.recv().await.unwrap().name(), "emergency-stop");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(coord.reserve("p", Some(1)).await, Decision::Allow);
        assert_eq!(events.recv().await.unwrap().name(), "emergency-clear");
    }

    #[tokio::test]
    async fn test_emergency_stop_survives_restart() {
        let temp = TempDir::new().unwrap();
        let unlock_at = Utc::now() + chrono::Duration::hours(1);

        {
            let coord = coordinator(temp.path(), config_no_jitter()).await;
            coord.notify_rate_limit(unlock_at).await;
        }

        let coord = coordinator(temp.path(), config_no_jitter()).await;
        assert!(coord.emergency_active().await);
        assert_eq!(
            coord.reserve("p", Some(1)).await,
            Decision::Reject(RejectReason::EmergencyStop)
        );
    }

    #[tokio::test]
    async fn test_session_invalid_emitted_once_and_cleared() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(temp.path()).unwrap());
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let coord = RateLimitCoordinator::load(config_no_jitter(), store, bus).await;

        coord.notify_session_invalid().await;
        coord.notify_session_invalid().await;

        assert_eq!(
            coord.reserve("p", Some(1)).await,
            Decision::Reject(RejectReason::SessionInvalid)
        );

        coord.clear_session_invalid().await;
        assert_eq!(coord.reserve("p", Some(1)).await, Decision::Allow);

        // Exactly one session-invalid then one session-cleared
        assert_eq!(events.recv().await.unwrap().name(), "session-invalid");
        assert_eq!(events.recv().await.unwrap().name(), "session-cleared");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_invalid_survives_restart() {
        let temp = TempDir::new().unwrap();
        {
            let coord = coordinator(temp.path(), config_no_jitter()).await;
            coord.notify_session_invalid().await;
        }

        let coord = coordinator(temp.path(), config_no_jitter()).await;
        assert!(coord.session_invalid().await);
    }

    #[tokio::test]
    async fn test_record_outcome_updates_estimate_and_tokens() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(temp.path(), config_no_jitter()).await;

        coord
            .record_outcome(
                "p",
                &OutcomeReport {
                    ok: true,
                    tokens: Some(50_000),
                    ..Default::default()
                },
            )
            .await;

        let utilization = coord.utilization().await;
        assert!(utilization.token_pct >= 49.0);
        assert_eq!(utilization.recommendation.action, "proceed");
    }

    #[tokio::test]
    async fn test_rate_limited_outcome_engages_stop() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(temp.path(), config_no_jitter()).await;

        coord
            .record_outcome(
                "p",
                &OutcomeReport {
                    ok: false,
                    rate_limited: true,
                    unlock_at: Some(Utc::now() + chrono::Duration::hours(1)),
                    tokens: None,
                },
            )
            .await;

        assert!(coord.emergency_active().await);
    }

    #[tokio::test]
    async fn test_throttle_floors_dispatch_rate() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(temp.path(), config_no_jitter()).await;
        coord.set_throttle(Duration::from_secs(10)).await;

        assert_eq!(coord.reserve("p", Some(1)).await, Decision::Allow);
        assert!(matches!(coord.reserve("p", Some(1)).await, Decision::DelayFor(_)));
    }

    #[tokio::test]
    async fn test_utilization_recommends_halt_during_stop() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(temp.path(), config_no_jitter()).await;
        coord.notify_rate_limit(Utc::now() + chrono::Duration::hours(1)).await;

        let utilization = coord.utilization().await;
        assert!(utilization.emergency_stop);
        assert_eq!(utilization.recommendation.action, "halt");
    }
}
