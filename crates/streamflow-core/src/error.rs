//! Distinguishable error kinds surfaced by the engine.
//!
//! Most fallible functions in this workspace return [`anyhow::Result`], in
//! keeping with the rest of the call chain. When a caller needs to tell one
//! failure mode from another (for example, deciding whether a timed-out job
//! is worth retrying), it downcasts the returned [`anyhow::Error`] to
//! [`StreamFlowError`].

use thiserror::Error;

/// The distinguishable failure kinds a [`crate::connector::Connector`] or the
/// task runner can produce.
#[derive(Debug, Error)]
pub enum StreamFlowError {
    /// A failure the workflow cannot recover from locally: a tar transfer
    /// error, an unsupported copy topology, a missing mandatory argument, or
    /// similar.
    #[error("{0}")]
    WorkflowExecution(String),

    /// A `run(capture_output, timeout)` invocation exceeded its deadline.
    ///
    /// Distinguished from [`StreamFlowError::Connector`] so that callers can
    /// choose to retry.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A connector could not be constructed or configured, e.g. a
    /// missing/empty in-cluster namespace file.
    #[error("connector configuration error: {0}")]
    Config(String),

    /// A remote invocation completed with a non-zero exit status.
    ///
    /// Interpretation (retry, fail the job, etc.) is the caller's
    /// responsibility; the raw captured stdout is preserved for diagnostics.
    #[error("command exited with status {exit_code}")]
    Connector {
        /// The captured standard output of the failed invocation, if any.
        stdout: Option<String>,
        /// The process exit code.
        exit_code: i32,
    },
}
