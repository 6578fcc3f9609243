pub mod queue;
pub mod task;

pub use queue::{PendingTask, Scheduler, TaskHandle};
pub use task::{Due, Task, TaskMeta};
