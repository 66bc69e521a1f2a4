//! Query engine: generate → validate → execute → self-correct.
//!
//! The correction loop is an explicit attempt state machine so the
//! retry bound is structural: `run` walks `0..=max_corrections`
//! attempts, each one Plan → Validate → Execute, and a failed attempt
//! either feeds the corrector once more or settles with the ORIGINAL
//! error. Corrections are never recursive.

pub mod store;
pub mod validator;

pub use store::{DatasetStore, QueryRow, QueryRows, SqliteDatasetStore, StaticDatasetStore};
pub use validator::{normalize_statement, validate_read_only};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};
use crate::llm::{LlmOptions, LlmProvider};

/// Successful outcome of one engine run.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// The statement that finally succeeded (possibly corrected).
    pub query_text: String,
    pub rows: QueryRows,
    /// Execution attempts spent, including the successful one.
    pub attempts: u32,
}

/// How one attempt failed.
enum AttemptFailure {
    /// Stop immediately with this error; the corrector never sees it.
    Terminal(EngineError),
    /// A corrected statement was rejected by the validator. Settles
    /// with the error that triggered the correction.
    UnsafeCorrection(String),
    /// Execution-class failure, eligible for correction.
    Retryable(String),
}

pub struct QueryEngine {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn DatasetStore>,
    max_corrections: u32,
    query_timeout: Duration,
}

impl QueryEngine {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn DatasetStore>,
        max_corrections: u32,
        query_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            store,
            max_corrections,
            query_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn DatasetStore> {
        &self.store
    }

    /// One LLM call producing a single statement for the instruction.
    pub async fn plan_query(
        &self,
        instruction: &str,
        schema_context: &str,
    ) -> EngineResult<String> {
        let raw = self.generate_candidate(instruction, schema_context).await?;
        normalize_statement(&raw)
    }

    /// Pure with respect to engine state.
    pub fn validate(&self, query_text: &str) -> EngineResult<()> {
        validate_read_only(query_text)
    }

    /// Execute under the read-only store with a bounded timeout.
    pub async fn execute(&self, query_text: &str, dataset_ref: &str) -> EngineResult<QueryRows> {
        match tokio::time::timeout(
            self.query_timeout,
            self.store.execute(dataset_ref, query_text),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(format!(
                "query exceeded {}s",
                self.query_timeout.as_secs()
            ))),
        }
    }

    /// One LLM call proposing a corrected statement for a failure.
    pub async fn correct(
        &self,
        original_query: &str,
        error_message: &str,
        schema_context: &str,
    ) -> EngineResult<String> {
        let prompt = format!(
            "The following SQL query failed. Fix it.\n\n\
             ORIGINAL QUERY:\n{}\n\n\
             ERROR:\n{}\n\n\
             SCHEMA CONTEXT:\n{}\n\n\
             Return ONLY the corrected SQL query, no explanation.",
            original_query, error_message, schema_context
        );
        self.llm
            .generate(&prompt, &LlmOptions::with_temperature(0.1))
            .await
    }

    /// Full cycle for one instruction: plan, then up to
    /// `max_corrections` corrected attempts, each Validate → Execute.
    pub async fn run(
        &self,
        instruction: &str,
        schema_context: &str,
        dataset_ref: &str,
    ) -> EngineResult<QueryOutcome> {
        let mut candidate = self.generate_candidate(instruction, schema_context).await?;
        let mut first_error: Option<String> = None;
        let mut executions = 0u32;

        for attempt in 0..=self.max_corrections {
            match self
                .try_candidate(&candidate, dataset_ref, attempt, &mut executions)
                .await
            {
                Ok(rows) => {
                    return Ok(QueryOutcome {
                        query_text: normalize_statement(&candidate)?,
                        rows,
                        attempts: executions,
                    });
                }
                Err(AttemptFailure::Terminal(err)) => return Err(err),
                Err(AttemptFailure::UnsafeCorrection(message)) => {
                    return Err(EngineError::CorrectionExhausted {
                        attempts: executions,
                        source_message: first_error.unwrap_or(message),
                    });
                }
                Err(AttemptFailure::Retryable(message)) => {
                    let original = first_error.get_or_insert_with(|| message.clone()).clone();
                    if attempt == self.max_corrections {
                        return Err(EngineError::CorrectionExhausted {
                            attempts: executions,
                            source_message: original,
                        });
                    }
                    warn!(error = %message, attempt, "query failed, requesting correction");
                    candidate = self
                        .correct(&candidate, &message, schema_context)
                        .await?;
                }
            }
        }
        // The loop always returns; max_corrections is finite.
        unreachable!("correction loop settled without a result")
    }

    async fn generate_candidate(
        &self,
        instruction: &str,
        schema_context: &str,
    ) -> EngineResult<String> {
        let prompt = format!(
            "You are a data analyst writing SQL for SQLite.\n\n\
             REQUEST: {}\n\n\
             {}\n\n\
             Rules:\n\
             - Return ONLY the SQL, no explanation and no markdown.\n\
             - Exactly one SELECT statement.\n\
             - Never modify data.\n",
            instruction, schema_context
        );
        let raw = self
            .llm
            .generate(&prompt, &LlmOptions::with_temperature(0.2))
            .await?;
        debug!(candidate = %raw.trim(), "planned query");
        Ok(raw)
    }

    async fn try_candidate(
        &self,
        candidate: &str,
        dataset_ref: &str,
        attempt: u32,
        executions: &mut u32,
    ) -> Result<QueryRows, AttemptFailure> {
        let query = match normalize_statement(candidate) {
            Ok(query) => query,
            // A malformed statement counts as an execution failure and
            // may be corrected once.
            Err(err) => return Err(AttemptFailure::Retryable(err.to_string())),
        };

        if let Err(err) = validate_read_only(&query) {
            // Unsafe queries are terminal either way: the first attempt
            // surfaces the rejection itself, a corrected attempt
            // settles with the error that triggered the correction.
            return Err(if attempt == 0 {
                AttemptFailure::Terminal(err)
            } else {
                AttemptFailure::UnsafeCorrection(err.to_string())
            });
        }

        *executions += 1;
        match self.execute(&query, dataset_ref).await {
            Ok(rows) => Ok(rows),
            Err(EngineError::Execution(message)) | Err(EngineError::Timeout(message)) => {
                Err(AttemptFailure::Retryable(message))
            }
            Err(other) => Err(AttemptFailure::Terminal(other)),
        }
    }
}
