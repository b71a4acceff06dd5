//! Tasks and the manager that schedules them.

mod callbacks;
mod manager;
mod types;

pub use callbacks::{dispatch, NoopCallbacks, TaskCallbacks};
pub use manager::{TaskError, TaskManager, TaskManagerConfig, DEFAULT_MAX_CONCURRENT_TASKS};
pub use types::{new_task_id, MessageKind, Task, TaskMessage, TaskStatus};
