//! Error taxonomy for the evaluation-coordination engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by `extopt-core`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A setup-time argument was out of its valid range (non-positive
    /// scale/weight, inconsistent variable sizes, unknown failure mode).
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// A data or config file could not be resolved at `addData`/`addConfig`
    /// time.
    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    /// `run`/`poll` was called on an `ExternalRun` before `initialize`.
    #[error("process not initialized in working directory {work_dir}")]
    ProcessNotInitialized { work_dir: String },

    /// Expected output files were still missing after `max_tries` attempts.
    #[error("run in {work_dir} failed after {tries} attempt(s)")]
    RunFailed { work_dir: String, tries: u32 },

    /// A parser could not extract the requested value or gradient from a
    /// solver output file.
    #[error("failed to parse solver output {path}: {message}")]
    SolverOutputError { path: PathBuf, message: String },

    /// A dependency cycle was found in a graph that should be acyclic by
    /// construction. This indicates a bug in the scheduler, not bad input.
    #[error("scheduler invariant violated: {0}")]
    SchedulerInvariantViolation(String),

    /// Wraps a filesystem operation that failed while staging or tearing
    /// down a run's working directory.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias used throughout `extopt-core`.
pub type EngineResult<T> = Result<T, EngineError>;
