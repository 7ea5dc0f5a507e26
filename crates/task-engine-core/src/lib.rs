mod task;
mod error;

pub use task::{default_retry_delay, RetryDelayFn, Task, TaskBuilder, TaskId};
pub use error::{TaskError, Result};

/// Group that receives tasks without an explicit group and tasks routed to an unknown group
pub const DEFAULT_GROUP: u32 = 1;
