//! Dataset discovery capability.
//!
//! Pure reasoning over the typed schema context: no database query is
//! issued, but the module follows the same event sequence as every
//! other capability.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::{EngineError, EngineResult};
use crate::events::{EventEmitter, EventSink};
use crate::llm::{extract_json, LlmOptions, LlmProvider};
use crate::query::DatasetStore;
use crate::types::{
    CapabilityDescriptor, CapabilityResult, ResultMetrics, ResultStatus, TaskEnvelope,
};

use super::{with_cancel, CapabilityExecutor};

pub struct DataDiscoveryCapability {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn DatasetStore>,
    sink: Arc<dyn EventSink>,
}

#[derive(Deserialize)]
struct SemanticProfileJson {
    entity_name: String,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    domain_description: String,
    #[serde(default)]
    field_categories: serde_json::Value,
    #[serde(default)]
    suggested_analyses: Vec<String>,
}

pub const DISCOVERY_CAPABILITY_NAME: &str = "data_discovery";

impl DataDiscoveryCapability {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn DatasetStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self { llm, store, sink }
    }

    pub fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            name: DISCOVERY_CAPABILITY_NAME.to_string(),
            description:
                "Produces a semantic understanding of a dataset from its typed schema and samples"
                    .to_string(),
            capabilities: vec![
                "Identify the entity type and domain of a dataset".to_string(),
                "Categorize fields by purpose".to_string(),
                "Suggest analyses suited to the data's nature".to_string(),
            ],
            input_schema: serde_json::json!({
                "instruction": "string",
                "dataset_ref": "string"
            }),
            output_schema: serde_json::json!({
                "semantic_profile": "entity, domain, field categories, suggested analyses"
            }),
        }
    }
}

#[async_trait]
impl CapabilityExecutor for DataDiscoveryCapability {
    async fn execute(&self, envelope: TaskEnvelope) -> EngineResult<CapabilityResult> {
        let started = Instant::now();
        let events = EventEmitter::new(
            Arc::clone(&self.sink),
            &envelope.context.session_id,
            DISCOVERY_CAPABILITY_NAME,
        );
        let cancel = envelope.context.cancel.clone();

        events.received(
            "Received discovery request",
            serde_json::json!({ "dataset_ref": envelope.dataset_ref }),
        );

        let schema = with_cancel(&cancel, self.store.schema(&envelope.dataset_ref)).await?;
        events.thinking(
            "Profiling dataset schema",
            serde_json::json!({ "field_count": schema.fields.len(), "row_count": schema.row_count }),
        );

        let prompt = format!(
            "Analyze this dataset schema and produce a semantic profile.\n\n\
             TASK: {}\n\n\
             {}\n\n\
             Respond with JSON only:\n\
             {{\n\
               \"entity_name\": \"what one row represents\",\n\
               \"domain\": \"business domain\",\n\
               \"domain_description\": \"one sentence\",\n\
               \"field_categories\": {{\"field_name\": \"identity|metric|segmentation|temporal|free_text\"}},\n\
               \"suggested_analyses\": [\"analysis suited to this data\"]\n\
             }}",
            envelope.instruction,
            schema.render_for_prompt(crate::query::store::DATASET_TABLE)
        );

        let profile: SemanticProfileJson = match with_cancel(&cancel, async {
            let response = self
                .llm
                .generate(&prompt, &LlmOptions::with_temperature(0.2))
                .await?;
            extract_json(&response)
        })
        .await
        {
            Ok(profile) => profile,
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(err) => {
                events.error(
                    "Discovery failed",
                    serde_json::json!({ "error": err.to_string() }),
                );
                return Ok(CapabilityResult::failed(err.to_string()));
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        events.result(
            "Discovery complete",
            serde_json::json!({ "entity": profile.entity_name, "domain": profile.domain }),
            Some(duration_ms),
        );

        Ok(CapabilityResult {
            status: ResultStatus::Completed,
            payload: serde_json::json!({
                "semantic_profile": {
                    "entity_name": profile.entity_name,
                    "domain": profile.domain,
                    "domain_description": profile.domain_description,
                    "field_categories": profile.field_categories,
                    "suggested_analyses": profile.suggested_analyses,
                }
            }),
            queries_run: Vec::new(),
            metrics: ResultMetrics {
                duration_ms,
                row_count: 0,
            },
            error: None,
        })
    }
}
