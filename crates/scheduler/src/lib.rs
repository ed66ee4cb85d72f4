//! Worker thread pool used to encode frames in parallel.
//!
//! Tasks are grouped into buckets by [`TaskTag`]. Every wake cycle a worker
//! visits each bucket once and runs at most one task from it, so several
//! independent owners sharing the pool make progress together. A bucket can
//! be waited on until it has no queued and no running tasks.

mod error;
mod identity;
mod pool;

pub use error::{SchedulerError, SchedulerResult};
pub use identity::TaskTag;
pub use pool::{PanicHandler, Scheduler, Task, TaskPanic, ThreadedScheduler};
