//! Execution planning.
//!
//! Routing is a pure function of capability metadata: the planner sees
//! the user request, a dataset summary, and each descriptor's
//! name/description/schemas (never another capability's name inside a
//! descriptor, and never example user phrases) and returns an ordered
//! plan. The strategy is swappable so tests can use a stub.

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::{EngineError, EngineResult};
use crate::llm::{extract_json, LlmOptions, LlmProvider};
use crate::types::{AnalysisRequest, CapabilityDescriptor, ExecutionPlan, PlanStep};

/// Strategy turning a request plus a catalog into an execution plan.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        request: &AnalysisRequest,
        dataset_summary: &str,
        catalog: &[CapabilityDescriptor],
    ) -> EngineResult<ExecutionPlan>;
}

/// JSON shape the model is asked to produce.
#[derive(Deserialize)]
struct PlanJson {
    #[serde(default)]
    understanding: String,
    steps: Vec<PlanStepJson>,
}

#[derive(Deserialize)]
struct PlanStepJson {
    capability: String,
    instruction: String,
    #[serde(default)]
    depends_on: Option<usize>,
}

/// LLM-backed planner: one model call per request.
pub struct LlmPlanner {
    llm: std::sync::Arc<dyn LlmProvider>,
}

impl LlmPlanner {
    pub fn new(llm: std::sync::Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    fn render_catalog(catalog: &[CapabilityDescriptor]) -> String {
        catalog
            .iter()
            .map(|d| {
                format!(
                    "- {}: {}\n  Work types: {}\n  Input: {}\n  Output: {}",
                    d.name,
                    d.description,
                    d.capabilities.join("; "),
                    d.input_schema,
                    d.output_schema
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn build_prompt(
        request: &AnalysisRequest,
        dataset_summary: &str,
        catalog: &[CapabilityDescriptor],
    ) -> String {
        format!(
            "You are an analysis orchestrator. Decompose the user request into \
             tasks for the available capability modules.\n\n\
             USER REQUEST:\n{}\n\n\
             DATASET:\n{}\n\n\
             AVAILABLE CAPABILITIES:\n{}\n\n\
             Respond with JSON only:\n\
             {{\n\
               \"understanding\": \"your interpretation of the request\",\n\
               \"steps\": [\n\
                 {{\n\
                   \"capability\": \"capability_name\",\n\
                   \"instruction\": \"specific task for this capability\",\n\
                   \"depends_on\": null\n\
                 }}\n\
               ]\n\
             }}\n\n\
             Rules:\n\
             - Use only capability names listed above.\n\
             - Independent steps may run concurrently; set depends_on to the \
               zero-based index of an EARLIER step only when that step's \
               result is required as input.\n\
             - Keep the plan minimal: one step per distinct piece of work.",
            request.text,
            dataset_summary,
            Self::render_catalog(catalog)
        )
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(
        &self,
        request: &AnalysisRequest,
        dataset_summary: &str,
        catalog: &[CapabilityDescriptor],
    ) -> EngineResult<ExecutionPlan> {
        let prompt = Self::build_prompt(request, dataset_summary, catalog);
        let response = self
            .llm
            .generate(&prompt, &LlmOptions::with_temperature(0.3))
            .await?;
        let parsed: PlanJson = extract_json(&response)
            .map_err(|e| EngineError::PlanValidation(format!("unparsable plan: {}", e)))?;
        Ok(ExecutionPlan {
            understanding: parsed.understanding,
            steps: parsed
                .steps
                .into_iter()
                .map(|s| PlanStep {
                    capability_name: s.capability,
                    instruction: s.instruction,
                    depends_on: s.depends_on,
                })
                .collect(),
        })
    }
}

/// Fixed-plan stub for unit tests.
pub struct StubPlanner {
    plan: ExecutionPlan,
}

impl StubPlanner {
    pub fn new(plan: ExecutionPlan) -> Self {
        Self { plan }
    }
}

#[async_trait]
impl Planner for StubPlanner {
    async fn plan(
        &self,
        _request: &AnalysisRequest,
        _dataset_summary: &str,
        _catalog: &[CapabilityDescriptor],
    ) -> EngineResult<ExecutionPlan> {
        Ok(self.plan.clone())
    }
}
