//! Task queue: per-project priority queues with aging and durable snapshots

mod core;
mod task;

pub use core::{
    CancelOutcome, QueueConfig, QueueSnapshot, QueueStatus, TaskDisposition, TaskQueue,
};
pub use task::{AgingPolicy, NewTask, Task, TaskState};
