//! Worker pool: executor invocations, auto-scaling, outcome classification

mod executor;
mod outcome;
mod pool;

pub use executor::{CommandExecutor, ExecutionOutput, ExecutionRequest, Executor, ExecutorConfig};
pub use outcome::{OutcomeClass, classify, failure_reason, parse_tokens};
pub use pool::{PoolConfig, PoolStatus, WorkerInfo, WorkerPool, WorkerState};
