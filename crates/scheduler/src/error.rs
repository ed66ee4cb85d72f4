//! Scheduler error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The operating system refused to start a worker thread.
    #[error("Failed to spawn worker thread {index}: {source}")]
    SpawnFailed {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Scheduler needs at least one worker thread")]
    NoThreads,
}

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
