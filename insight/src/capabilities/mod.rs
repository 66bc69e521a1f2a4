//! Capability execution contract.
//!
//! Every analysis module implements [`CapabilityExecutor`] and receives
//! nothing but a [`TaskEnvelope`]: no registry handle, no reference to
//! other capabilities. Data flows strictly one way: the orchestrator
//! threads earlier results into `prior_results`, capabilities never
//! call each other.
//!
//! Per invocation each module walks the same state machine:
//! Received -> Thinking -> Acting (0..k) -> Result | Error, reporting
//! every transition to the event bus.

mod discovery;
mod query_capability;

pub use discovery::DataDiscoveryCapability;
pub use query_capability::{CapabilityDomain, QueryCapability};

use std::future::Future;

use async_trait::async_trait;

use crate::errors::{EngineError, EngineResult};
use crate::session::CancelToken;
use crate::types::{CapabilityResult, PriorResult, TaskEnvelope};

#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    async fn execute(&self, envelope: TaskEnvelope) -> EngineResult<CapabilityResult>;
}

/// Race a unit of work against the session's cancellation signal.
/// Cancellation wins ties; the in-flight future is dropped best-effort.
pub(crate) async fn with_cancel<T, F>(cancel: &CancelToken, work: F) -> EngineResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        result = work => result,
    }
}

/// Render prior step results into a prompt block. Payloads are opaque;
/// they are shown as compact JSON in plan order, bounded so a noisy
/// step cannot flood the context.
pub(crate) fn render_prior_results(prior_results: &[PriorResult]) -> String {
    if prior_results.is_empty() {
        return String::new();
    }
    let mut lines = vec!["EARLIER RESULTS (in plan order):".to_string()];
    for prior in prior_results {
        let mut rendered = prior.result.to_string();
        if rendered.len() > 2000 {
            rendered.truncate(2000);
            rendered.push_str("...");
        }
        lines.push(format!(
            "- {} ({}): {}",
            prior.capability_name, prior.instruction, rendered
        ));
    }
    lines.join("\n")
}
