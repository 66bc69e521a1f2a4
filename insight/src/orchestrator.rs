//! Request orchestration.
//!
//! The orchestrator is the only component aware of the capability
//! catalog: it turns a request into a plan with one planner call,
//! drives the steps in dependency order (independent steps run
//! concurrently, dependents wait for their prerequisite's result),
//! and synthesizes the surviving step payloads into one answer. One
//! failed step degrades the answer; only plan validation or total
//! synthesis failure fails the whole request.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EventEmitter, EventSink, InMemoryEventBus};
use crate::llm::{LlmOptions, LlmProvider};
use crate::planner::Planner;
use crate::query::DatasetStore;
use crate::registry::CapabilityRegistry;
use crate::session::{CancelToken, SessionRegistry};
use crate::types::{
    AnalysisRequest, CapabilityResult, ExecutionPlan, PriorResult, TaskContext, TaskEnvelope,
};

pub const ORCHESTRATOR_NAME: &str = "orchestrator";

/// Deterministic answer used when every plan step failed.
pub const FALLBACK_ANSWER: &str = "no results produced";

/// How one plan step settled.
#[derive(Debug, Clone)]
enum StepOutcome {
    Completed(CapabilityResult),
    Failed(String),
    /// Dependency failed or was skipped; the step never ran.
    Skipped,
    Cancelled,
}

impl StepOutcome {
    fn completed(&self) -> Option<&CapabilityResult> {
        match self {
            StepOutcome::Completed(result) => Some(result),
            _ => None,
        }
    }
}

pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    planner: Arc<dyn Planner>,
    llm: Arc<dyn LlmProvider>,
    bus: Arc<InMemoryEventBus>,
    sessions: Arc<SessionRegistry>,
    store: Arc<dyn DatasetStore>,
    step_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        planner: Arc<dyn Planner>,
        llm: Arc<dyn LlmProvider>,
        bus: Arc<InMemoryEventBus>,
        sessions: Arc<SessionRegistry>,
        store: Arc<dyn DatasetStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            planner,
            llm,
            bus,
            sessions,
            store,
            step_timeout: Duration::from_secs(config.step_timeout_seconds),
        }
    }

    pub fn bus(&self) -> &Arc<InMemoryEventBus> {
        &self.bus
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Process one request end to end, emitting transparency events
    /// throughout and closing the session with a terminal marker.
    pub async fn handle(&self, request: AnalysisRequest) -> EngineResult<String> {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cancel = self.sessions.begin(&session_id);
        let events = EventEmitter::new(
            self.sink(),
            &session_id,
            ORCHESTRATOR_NAME,
        );

        let outcome = self
            .run_session(&request, &session_id, &cancel, &events)
            .await;
        self.sessions.finish(&session_id);

        match outcome {
            Ok(answer) => {
                self.bus.complete_session(&session_id, Some(answer.clone()));
                Ok(answer)
            }
            Err(EngineError::Cancelled) => {
                // Cancellation is an audit record, not a user-facing
                // failure: the session completes without an answer.
                events.error(
                    "Session cancelled",
                    serde_json::json!({ "reason": "cancelled" }),
                );
                self.bus.complete_session(&session_id, None);
                Err(EngineError::Cancelled)
            }
            Err(err) => {
                events.error(
                    "Request failed",
                    serde_json::json!({ "error": err.to_string() }),
                );
                self.bus.fail_session(&session_id, &err.to_string());
                Err(err)
            }
        }
    }

    fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.bus) as Arc<dyn EventSink>
    }

    async fn run_session(
        &self,
        request: &AnalysisRequest,
        session_id: &str,
        cancel: &CancelToken,
        events: &EventEmitter,
    ) -> EngineResult<String> {
        let started = Instant::now();
        events.received(
            "Received user request",
            serde_json::json!({
                "message_preview": preview(&request.text, 100),
                "dataset_ref": request.dataset_ref,
            }),
        );

        // The dataset profile enriches planning but is not required
        // for routing; a missing profile degrades, not fails.
        let dataset_summary = match self.store.schema(&request.dataset_ref).await {
            Ok(schema) => schema.render_for_prompt(crate::query::store::DATASET_TABLE),
            Err(err) => {
                warn!(error = %err, "dataset profile unavailable for planning");
                "No dataset profile available.".to_string()
            }
        };

        let catalog = self.registry.catalog();
        events.thinking(
            "Interpreting request",
            serde_json::json!({ "capabilities_available": catalog.len() }),
        );

        let plan = self
            .planner
            .plan(request, &dataset_summary, &catalog)
            .await?;
        plan.validate(&self.registry.names())?;
        info!(session_id, steps = plan.steps.len(), "plan built");

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let outcomes = self
            .execute_plan(&plan, request, session_id, cancel, events)
            .await;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let successes: Vec<(usize, PriorResult)> = plan
            .steps
            .iter()
            .enumerate()
            .filter_map(|(idx, step)| {
                outcomes[idx].completed().map(|result| {
                    (
                        idx,
                        PriorResult {
                            capability_name: step.capability_name.clone(),
                            instruction: step.instruction.clone(),
                            result: result.payload.clone(),
                        },
                    )
                })
            })
            .collect();

        let answer = if successes.is_empty() {
            FALLBACK_ANSWER.to_string()
        } else {
            events.thinking(
                "Synthesizing final answer",
                serde_json::json!({ "successful_steps": successes.len() }),
            );
            self.synthesize(request, &plan, &successes).await?
        };

        events.result(
            "Analysis complete",
            serde_json::json!({ "answer_preview": preview(&answer, 200) }),
            Some(started.elapsed().as_millis() as u64),
        );
        Ok(answer)
    }

    /// Drive every step to a settled outcome. Steps whose dependency
    /// is satisfied run concurrently on a join set; a step whose
    /// dependency failed, was skipped, or was cancelled settles as
    /// `Skipped` without ever being invoked.
    async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        request: &AnalysisRequest,
        session_id: &str,
        cancel: &CancelToken,
        events: &EventEmitter,
    ) -> Vec<StepOutcome> {
        let n = plan.steps.len();
        let mut outcomes: Vec<Option<StepOutcome>> = vec![None; n];
        let mut scheduled = vec![false; n];
        let mut join_set: JoinSet<(usize, EngineResult<CapabilityResult>)> = JoinSet::new();

        loop {
            let mut progressed = false;

            for idx in 0..n {
                if scheduled[idx] {
                    continue;
                }
                let step = &plan.steps[idx];

                let dep_state = match step.depends_on {
                    None => Some(true),
                    Some(dep) => outcomes[dep].as_ref().map(|o| o.completed().is_some()),
                };
                let dep_ok = match dep_state {
                    None => continue, // dependency still running
                    Some(ok) => ok,
                };

                scheduled[idx] = true;
                progressed = true;

                if !dep_ok {
                    events.error(
                        "Step skipped",
                        serde_json::json!({
                            "capability": step.capability_name,
                            "reason": "dependency did not complete",
                            "depends_on": step.depends_on,
                        }),
                    );
                    outcomes[idx] = Some(StepOutcome::Skipped);
                    continue;
                }
                if cancel.is_cancelled() {
                    events.error(
                        "Step cancelled",
                        serde_json::json!({
                            "capability": step.capability_name,
                            "reason": "cancelled",
                        }),
                    );
                    outcomes[idx] = Some(StepOutcome::Cancelled);
                    continue;
                }

                events.decision(
                    "Invoking capability",
                    serde_json::json!({
                        "capability": step.capability_name,
                        "instruction": step.instruction,
                    }),
                );

                let executor = match self.registry.get(&step.capability_name) {
                    Ok(executor) => executor,
                    Err(err) => {
                        // Unreachable after plan validation, but a step
                        // failure is the safe degradation.
                        outcomes[idx] = Some(StepOutcome::Failed(err.to_string()));
                        continue;
                    }
                };

                let envelope = TaskEnvelope {
                    instruction: step.instruction.clone(),
                    dataset_ref: request.dataset_ref.clone(),
                    context: TaskContext {
                        session_id: session_id.to_string(),
                        cancel: cancel.clone(),
                    },
                    prior_results: dependency_results(plan, idx, &outcomes),
                };

                let step_timeout = self.step_timeout;
                let step_cancel = cancel.clone();
                join_set.spawn(async move {
                    let result = tokio::select! {
                        biased;
                        _ = step_cancel.cancelled() => Err(EngineError::Cancelled),
                        joined = tokio::time::timeout(step_timeout, executor.execute(envelope)) => {
                            match joined {
                                Ok(inner) => inner,
                                Err(_) => Err(EngineError::Timeout(format!(
                                    "capability exceeded {}s",
                                    step_timeout.as_secs()
                                ))),
                            }
                        }
                    };
                    (idx, result)
                });
            }

            let all_settled = outcomes.iter().all(|o| o.is_some());
            if all_settled {
                break;
            }
            if join_set.is_empty() {
                if progressed {
                    continue;
                }
                // Nothing running and nothing schedulable: a task was
                // lost (executor panic). Fail what is still open so
                // dependents cascade into Skipped.
                for idx in 0..n {
                    if scheduled[idx] && outcomes[idx].is_none() {
                        outcomes[idx] =
                            Some(StepOutcome::Failed("capability task aborted".to_string()));
                    }
                }
                continue;
            }

            match join_set.join_next().await {
                Some(Ok((idx, result))) => {
                    outcomes[idx] = Some(self.settle_step(plan, idx, result, events));
                }
                Some(Err(join_err)) => {
                    warn!(error = %join_err, "capability task panicked");
                }
                None => {}
            }
        }

        outcomes
            .into_iter()
            .map(|o| o.unwrap_or(StepOutcome::Skipped))
            .collect()
    }

    fn settle_step(
        &self,
        plan: &ExecutionPlan,
        idx: usize,
        result: EngineResult<CapabilityResult>,
        events: &EventEmitter,
    ) -> StepOutcome {
        let capability = &plan.steps[idx].capability_name;
        match result {
            Ok(result) if result.is_completed() => StepOutcome::Completed(result),
            Ok(result) => {
                let message = result
                    .error
                    .unwrap_or_else(|| "capability reported failure".to_string());
                events.error(
                    "Step failed",
                    serde_json::json!({ "capability": capability, "error": message }),
                );
                StepOutcome::Failed(message)
            }
            Err(EngineError::Cancelled) => {
                events.error(
                    "Step cancelled",
                    serde_json::json!({ "capability": capability, "reason": "cancelled" }),
                );
                StepOutcome::Cancelled
            }
            Err(err) => {
                events.error(
                    "Step failed",
                    serde_json::json!({ "capability": capability, "error": err.to_string() }),
                );
                StepOutcome::Failed(err.to_string())
            }
        }
    }

    async fn synthesize(
        &self,
        request: &AnalysisRequest,
        plan: &ExecutionPlan,
        successes: &[(usize, PriorResult)],
    ) -> EngineResult<String> {
        let results_block = successes
            .iter()
            .map(|(_, prior)| {
                serde_json::json!({
                    "capability": prior.capability_name,
                    "task": prior.instruction,
                    "result": prior.result,
                })
            })
            .collect::<Vec<_>>();

        let prompt = format!(
            "You are presenting data analysis findings to a user. Synthesize \
             these results into a clear, insightful response.\n\n\
             USER'S ORIGINAL QUESTION:\n{}\n\n\
             YOUR UNDERSTANDING:\n{}\n\n\
             CAPABILITY RESULTS:\n{}\n\n\
             Create a response that:\n\
             1. Directly addresses the user's question\n\
             2. Presents key findings with specific numbers\n\
             3. Is conversational but data-driven\n\
             4. Uses markdown formatting for clarity\n\n\
             Do NOT just list raw data - interpret it and explain what it \
             means. Return the response text only, not JSON.",
            request.text,
            plan.understanding,
            serde_json::Value::Array(results_block)
        );

        let answer = self
            .llm
            .generate(&prompt, &LlmOptions::with_temperature(0.4))
            .await?;
        Ok(answer.trim().to_string())
    }
}

/// Results a step receives: its transitive dependency chain, completed
/// steps only, ordered by plan position. The merge order is always
/// plan order, never left to synthesis.
fn dependency_results(
    plan: &ExecutionPlan,
    idx: usize,
    outcomes: &[Option<StepOutcome>],
) -> Vec<PriorResult> {
    let mut chain = BTreeSet::new();
    let mut cursor = plan.steps[idx].depends_on;
    while let Some(dep) = cursor {
        if !chain.insert(dep) {
            break;
        }
        cursor = plan.steps[dep].depends_on;
    }
    chain
        .into_iter()
        .filter_map(|dep| {
            outcomes[dep]
                .as_ref()
                .and_then(|o| o.completed())
                .map(|result| PriorResult {
                    capability_name: plan.steps[dep].capability_name.clone(),
                    instruction: plan.steps[dep].instruction.clone(),
                    result: result.payload.clone(),
                })
        })
        .collect()
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
