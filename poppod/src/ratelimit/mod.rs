//! Shared executor-quota accounting with emergency stop

mod coordinator;
mod window;

pub use coordinator::{
    Decision, OutcomeReport, Predictions, RateLimitConfig, RateLimitCoordinator, Recommendation,
    RejectReason, Utilization,
};
pub use window::{SlidingWindow, TokenEvent};
