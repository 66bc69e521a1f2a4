//! Engine error taxonomy
//!
//! One error type threaded through every component. Variants map to the
//! recovery table in the error-handling design: registry errors are fatal
//! at startup, plan validation is fatal for the request, query-stage
//! errors are bounded-retryable, and `Cancelled` is an audit record
//! rather than a user-facing failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A capability with the same name was already registered.
    #[error("capability '{0}' is already registered")]
    DuplicateCapability(String),

    /// A lookup referenced a capability that was never registered.
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),

    /// The planner produced a plan that references unknown capabilities
    /// or is not a finite acyclic sequence. Fatal for the request.
    #[error("plan validation failed: {0}")]
    PlanValidation(String),

    /// The LLM returned an empty, unparsable, or multi-statement query.
    /// Eligible for one correction attempt, like an execution failure.
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    /// The validator rejected a query containing a mutating keyword.
    /// Terminal for the attempt; never passed to the corrector.
    #[error("unsafe operation rejected: {0}")]
    UnsafeQuery(String),

    /// The dataset store failed to execute a validated query.
    #[error("query execution failed: {0}")]
    Execution(String),

    /// The correction budget ran out. Reports the original error, not
    /// the error of the last corrected attempt.
    #[error("correction attempts exhausted after {attempts} tries: {source_message}")]
    CorrectionExhausted { attempts: u32, source_message: String },

    /// The LLM provider failed (timeout, quota, malformed output).
    #[error("llm service error: {0}")]
    Service(String),

    /// A bounded timeout expired on an LLM call or query execution.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The session was cancelled while work was in flight.
    #[error("cancelled")]
    Cancelled,

    /// Dataset store or event log I/O failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
