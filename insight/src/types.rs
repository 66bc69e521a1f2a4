//! Core data model for the orchestration engine.
//!
//! Everything a request touches flows through these types: capability
//! self-descriptions, the execution plan built once per request, the
//! envelope a capability receives, its result, and the transparency
//! events appended to the session log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::CancelToken;

pub type SessionId = String;
pub type DatasetRef = String;

/// Self-description of an analysis capability, registered once at
/// process start and immutable afterwards.
///
/// Descriptors are self-contained: they must never reference another
/// capability by name, and must describe the *kind of work* the module
/// does rather than example user phrases, so routing never overfits to
/// memorized wording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Unique registry key.
    pub name: String,
    /// Free-text description of the work this capability performs.
    pub description: String,
    /// Work types this capability covers, one short phrase each.
    pub capabilities: Vec<String>,
    /// Shape of the envelope payload this capability expects.
    pub input_schema: serde_json::Value,
    /// Shape of the result payload this capability produces.
    pub output_schema: serde_json::Value,
}

/// One step of an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Registry name of the capability to invoke.
    pub capability_name: String,
    /// Natural-language sub-task for that capability.
    pub instruction: String,
    /// Ordinal of an earlier step whose result this step consumes.
    /// Must point strictly backwards; forward references are rejected
    /// during plan validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<usize>,
}

/// Ordered sequence of capability invocations, produced by one planner
/// call per request. Immutable after creation, discarded after the
/// request completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// The planner's one-line interpretation of the request.
    #[serde(default)]
    pub understanding: String,
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// Validate the plan against the set of registered capability
    /// names: every step must resolve, and `depends_on` must reference
    /// an earlier step only (finite, acyclic by construction).
    pub fn validate(&self, known_names: &[String]) -> Result<(), crate::errors::EngineError> {
        use crate::errors::EngineError;
        if self.steps.is_empty() {
            return Err(EngineError::PlanValidation(
                "plan contains no steps".to_string(),
            ));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            if !known_names.iter().any(|n| n == &step.capability_name) {
                return Err(EngineError::PlanValidation(format!(
                    "step {} references unregistered capability '{}'",
                    idx, step.capability_name
                )));
            }
            if let Some(dep) = step.depends_on {
                if dep >= idx {
                    return Err(EngineError::PlanValidation(format!(
                        "step {} depends on step {} which does not precede it",
                        idx, dep
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Result of an earlier plan step, passed forward opaquely. Never
/// mutated once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorResult {
    pub capability_name: String,
    pub instruction: String,
    pub result: serde_json::Value,
}

/// Per-request context a capability may consult. Deliberately narrow:
/// a capability sees the session it reports into and the cancellation
/// signal, never the registry or another capability.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub session_id: SessionId,
    pub cancel: CancelToken,
}

/// The only input a capability executor receives.
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    pub instruction: String,
    pub dataset_ref: DatasetRef,
    pub context: TaskContext,
    /// Results of the steps this one depends on, in plan order.
    pub prior_results: Vec<PriorResult>,
}

/// Terminal status of one capability invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

/// One query a capability ran, recorded for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query_text: String,
    pub purpose: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultMetrics {
    pub duration_ms: u64,
    pub row_count: u64,
}

/// What a capability hands back to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityResult {
    pub status: ResultStatus,
    pub payload: serde_json::Value,
    pub queries_run: Vec<QueryRecord>,
    pub metrics: ResultMetrics,
    /// Populated when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CapabilityResult {
    pub fn completed(payload: serde_json::Value) -> Self {
        Self {
            status: ResultStatus::Completed,
            payload,
            queries_run: Vec::new(),
            metrics: ResultMetrics::default(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            payload: serde_json::Value::Null,
            queries_run: Vec::new(),
            metrics: ResultMetrics::default(),
            error: Some(error.into()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ResultStatus::Completed
    }
}

/// Kind of progress a transparency event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Received,
    Thinking,
    Decision,
    Action,
    Result,
    Error,
}

/// Append-only record of one step of progress. Owned by the event bus
/// once appended; a single capability writes each event, many stream
/// consumers read it. Never updated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyEvent {
    pub id: String,
    pub session_id: SessionId,
    pub capability_name: String,
    pub kind: EventKind,
    pub title: String,
    pub details: serde_json::Value,
    /// Monotone per `(session, capability)`, assigned by the bus.
    pub step_number: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// An incoming analysis request, as handed over by the chat layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub text: String,
    pub dataset_ref: DatasetRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, depends_on: Option<usize>) -> PlanStep {
        PlanStep {
            capability_name: name.to_string(),
            instruction: "do something".to_string(),
            depends_on,
        }
    }

    #[test]
    fn test_plan_validation_rejects_unknown_capability() {
        let plan = ExecutionPlan {
            understanding: String::new(),
            steps: vec![step("quantitative_analytics", None), step("nope", None)],
        };
        let known = vec!["quantitative_analytics".to_string()];
        let err = plan.validate(&known).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_plan_validation_rejects_forward_dependency() {
        let plan = ExecutionPlan {
            understanding: String::new(),
            steps: vec![step("a", Some(1)), step("a", None)],
        };
        let known = vec!["a".to_string()];
        assert!(plan.validate(&known).is_err());
    }

    #[test]
    fn test_plan_validation_rejects_self_dependency() {
        let plan = ExecutionPlan {
            understanding: String::new(),
            steps: vec![step("a", None), step("a", Some(1))],
        };
        let known = vec!["a".to_string()];
        assert!(plan.validate(&known).is_err());
    }

    #[test]
    fn test_plan_validation_accepts_backward_dependency() {
        let plan = ExecutionPlan {
            understanding: String::new(),
            steps: vec![step("a", None), step("a", Some(0))],
        };
        let known = vec!["a".to_string()];
        assert!(plan.validate(&known).is_ok());
    }

    #[test]
    fn test_empty_plan_rejected() {
        let plan = ExecutionPlan {
            understanding: String::new(),
            steps: vec![],
        };
        assert!(plan.validate(&[]).is_err());
    }
}
