//! LLM-driven querying capability.
//!
//! One struct covers both data-querying domains; the domain decides
//! the planning prompt and, with it, which field types the generated
//! queries may touch. The quantitative domain works on numeric, date,
//! and boolean fields and never pattern-matches text; the semantic
//! domain matches meaning in text fields and never aggregates. The
//! boundary is a prompt-level design rule; the engine's validator
//! enforces the read-only subset for both regardless.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::errors::{EngineError, EngineResult};
use crate::events::{EventEmitter, EventSink};
use crate::llm::{extract_json, LlmOptions, LlmProvider};
use crate::query::QueryEngine;
use crate::types::{
    CapabilityDescriptor, CapabilityResult, QueryRecord, ResultMetrics, ResultStatus, TaskEnvelope,
};

use super::{render_prior_results, with_cancel, CapabilityExecutor};

/// Which slice of the dataset a querying capability is allowed to
/// reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityDomain {
    /// Aggregation, statistics, trends over numeric/date/boolean fields.
    Quantitative,
    /// Meaning-based matching and filtering over text fields.
    Semantic,
}

pub struct QueryCapability {
    name: String,
    domain: CapabilityDomain,
    llm: Arc<dyn LlmProvider>,
    engine: Arc<QueryEngine>,
    sink: Arc<dyn EventSink>,
}

#[derive(Deserialize)]
struct QueryPlanJson {
    #[serde(default)]
    rationale: String,
    queries: Vec<PlannedQueryJson>,
}

#[derive(Deserialize)]
struct PlannedQueryJson {
    purpose: String,
    instruction: String,
}

#[derive(Deserialize)]
struct InsightsJson {
    summary: String,
    #[serde(default)]
    findings: Vec<String>,
    #[serde(default)]
    insights: Vec<String>,
}

impl QueryCapability {
    pub fn new(
        name: &str,
        domain: CapabilityDomain,
        llm: Arc<dyn LlmProvider>,
        engine: Arc<QueryEngine>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            name: name.to_string(),
            domain,
            llm,
            engine,
            sink,
        }
    }

    /// Self-description for the registry. Work types only: never
    /// example user phrases, never another capability's name.
    pub fn descriptor(&self) -> CapabilityDescriptor {
        let (description, capabilities) = match self.domain {
            CapabilityDomain::Quantitative => (
                "Analyzes structured data with read-only queries to answer quantitative questions",
                vec![
                    "Aggregate, filter, group, and compare records",
                    "Calculate statistics and distributions",
                    "Analyze trends over date fields",
                    "Provide data-backed evidence for findings",
                ],
            ),
            CapabilityDomain::Semantic => (
                "Searches unstructured text fields by meaning and fuzzy matching",
                vec![
                    "Match concepts and related terms in text fields",
                    "Fuzzy matching on names and free text",
                    "Filter records by textual content",
                ],
            ),
        };
        CapabilityDescriptor {
            name: self.name.clone(),
            description: description.to_string(),
            capabilities: capabilities.into_iter().map(String::from).collect(),
            input_schema: serde_json::json!({
                "instruction": "string",
                "dataset_ref": "string",
                "prior_results": "array"
            }),
            output_schema: serde_json::json!({
                "summary": "string",
                "findings": "array of string",
                "results": "array of row sets"
            }),
        }
    }

    fn domain_rules(&self) -> &'static str {
        match self.domain {
            CapabilityDomain::Quantitative => {
                "Work only with numeric, date, and boolean fields.\n\
                 Never use LIKE or pattern matching on text fields; textual \
                 meaning is outside this module's domain."
            }
            CapabilityDomain::Semantic => {
                "Work only with text fields, matching meaning with LIKE \
                 patterns over related terms.\n\
                 Never aggregate, never do arithmetic, never compare numeric \
                 or date fields; quantitative work is outside this module's \
                 domain."
            }
        }
    }

    async fn plan_queries(
        &self,
        envelope: &TaskEnvelope,
        schema_context: &str,
    ) -> EngineResult<QueryPlanJson> {
        let prior_block = render_prior_results(&envelope.prior_results);
        let prompt = format!(
            "You are planning read-only SQLite queries to answer an analysis task.\n\n\
             TASK: {}\n\n\
             {}\n\n\
             {}\n\n\
             RULES:\n{}\n\n\
             Respond with JSON only:\n\
             {{\n\
               \"rationale\": \"one sentence on your approach\",\n\
               \"queries\": [\n\
                 {{\"purpose\": \"what this query answers\", \"instruction\": \"precise description of the single query to write\"}}\n\
               ]\n\
             }}\n\
             Plan between one and three queries: answer the core task first, \
             then add supporting statistics only when they clearly help.",
            envelope.instruction,
            schema_context,
            prior_block,
            self.domain_rules()
        );
        let response = self
            .llm
            .generate(&prompt, &LlmOptions::with_temperature(0.2))
            .await?;
        let plan: QueryPlanJson = extract_json(&response)?;
        if plan.queries.is_empty() {
            return Err(EngineError::Service(
                "query plan contained no queries".to_string(),
            ));
        }
        Ok(plan)
    }

    async fn synthesize_insights(
        &self,
        instruction: &str,
        result_sets: &[serde_json::Value],
    ) -> EngineResult<InsightsJson> {
        let prompt = format!(
            "You are a data analyst. Synthesize insights from these query results.\n\n\
             ORIGINAL TASK: {}\n\n\
             QUERY RESULTS:\n{}\n\n\
             Return valid JSON only:\n\
             {{\n\
               \"summary\": \"direct answer with key numbers\",\n\
               \"findings\": [\"finding backed by the data\"],\n\
               \"insights\": [\"pattern worth noting\"]\n\
             }}",
            instruction,
            serde_json::Value::Array(result_sets.to_vec())
        );
        let response = self
            .llm
            .generate(&prompt, &LlmOptions::with_temperature(0.3))
            .await?;
        extract_json(&response)
    }
}

#[async_trait]
impl CapabilityExecutor for QueryCapability {
    async fn execute(&self, envelope: TaskEnvelope) -> EngineResult<CapabilityResult> {
        let started = Instant::now();
        let events = EventEmitter::new(
            Arc::clone(&self.sink),
            &envelope.context.session_id,
            &self.name,
        );
        let cancel = envelope.context.cancel.clone();

        events.received(
            "Received analysis task",
            serde_json::json!({ "instruction": envelope.instruction }),
        );

        let schema = with_cancel(&cancel, self.engine.store().schema(&envelope.dataset_ref)).await?;
        let schema_context = schema.render_for_prompt(crate::query::store::DATASET_TABLE);

        let plan = match with_cancel(&cancel, self.plan_queries(&envelope, &schema_context)).await {
            Ok(plan) => plan,
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(err) => {
                events.error("Query planning failed", serde_json::json!({ "error": err.to_string() }));
                return Ok(CapabilityResult::failed(err.to_string()));
            }
        };
        events.thinking(
            "Planned queries",
            serde_json::json!({
                "rationale": plan.rationale,
                "query_count": plan.queries.len(),
            }),
        );

        let mut result_sets: Vec<serde_json::Value> = Vec::new();
        let mut queries_run: Vec<QueryRecord> = Vec::new();
        let mut row_count = 0u64;
        let mut last_error: Option<String> = None;

        for planned in &plan.queries {
            events.action(
                "Executing query",
                serde_json::json!({ "purpose": planned.purpose }),
            );
            match with_cancel(
                &cancel,
                self.engine
                    .run(&planned.instruction, &schema_context, &envelope.dataset_ref),
            )
            .await
            {
                Ok(outcome) => {
                    row_count += outcome.rows.rows.len() as u64;
                    events.result(
                        "Query completed",
                        serde_json::json!({
                            "purpose": planned.purpose,
                            "row_count": outcome.rows.rows.len(),
                            "attempts": outcome.attempts,
                            "truncated": outcome.rows.truncated,
                        }),
                        None,
                    );
                    result_sets.push(serde_json::json!({
                        "purpose": planned.purpose,
                        "row_count": outcome.rows.rows.len(),
                        "data": outcome.rows.rows.iter().take(50).collect::<Vec<_>>(),
                    }));
                    queries_run.push(QueryRecord {
                        query_text: outcome.query_text,
                        purpose: planned.purpose.clone(),
                    });
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) => {
                    // One failed query degrades the result; the
                    // remaining planned queries still run.
                    events.error(
                        "Query failed",
                        serde_json::json!({
                            "purpose": planned.purpose,
                            "error": err.to_string(),
                        }),
                    );
                    last_error = Some(err.to_string());
                }
            }
        }

        if result_sets.is_empty() {
            let message = last_error.unwrap_or_else(|| "no query produced results".to_string());
            return Ok(CapabilityResult {
                status: ResultStatus::Failed,
                payload: serde_json::Value::Null,
                queries_run,
                metrics: ResultMetrics {
                    duration_ms: started.elapsed().as_millis() as u64,
                    row_count,
                },
                error: Some(message),
            });
        }

        events.thinking(
            "Synthesizing insights",
            serde_json::json!({ "result_sets": result_sets.len() }),
        );
        let insights = with_cancel(
            &cancel,
            self.synthesize_insights(&envelope.instruction, &result_sets),
        )
        .await;
        let payload = match insights {
            Ok(insights) => serde_json::json!({
                "summary": insights.summary,
                "findings": insights.findings,
                "insights": insights.insights,
                "results": result_sets,
            }),
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(err) => {
                // Degrade gracefully: raw results without narrative.
                info!(capability = %self.name, error = %err, "insight synthesis failed");
                serde_json::json!({
                    "summary": "analysis completed; insight synthesis unavailable",
                    "results": result_sets,
                })
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        events.result(
            "Analysis complete",
            serde_json::json!({
                "queries_run": queries_run.len(),
                "row_count": row_count,
            }),
            Some(duration_ms),
        );

        Ok(CapabilityResult {
            status: ResultStatus::Completed,
            payload,
            queries_run,
            metrics: ResultMetrics {
                duration_ms,
                row_count,
            },
            error: None,
        })
    }
}
