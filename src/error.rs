//! Error types for pipeline operations.
//!
//! Only *recoverable* conditions are represented here. Invariant violations
//! (out-of-order barrier signals, non-resident POC lookups, out-of-order
//! rate-control updates) indicate a bug in the orchestration logic itself and
//! panic instead of returning an error, so they can never be silently
//! swallowed by a caller.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid configuration value provided at construction time.
    #[error("Invalid configuration '{parameter}': {reason}")]
    InvalidConfig {
        /// The parameter name.
        parameter: String,
        /// Explanation of why it's invalid.
        reason: String,
    },

    /// A worker thread panicked; the pipeline was torn down.
    #[error("Worker thread '{thread}' panicked: {message}")]
    WorkerPanicked {
        /// Name of the worker thread.
        thread: String,
        /// Panic payload rendered as text.
        message: String,
    },

    /// The host pushed a frame after `flush()` was called.
    #[error("Frame pushed after end-of-stream was signaled")]
    PushAfterFlush,
}
