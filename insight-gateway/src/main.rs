//! Insight gateway binary.
//!
//! Wires the engine together (LLM provider, dataset store, capability
//! registry, event bus, orchestrator) and serves the HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use insight::capabilities::{CapabilityDomain, DataDiscoveryCapability, QueryCapability};
use insight::config::EngineConfig;
use insight::events::{EventSink, InMemoryEventBus};
use insight::llm::LlmProviderFactory;
use insight::orchestrator::Orchestrator;
use insight::planner::LlmPlanner;
use insight::query::{DatasetStore, QueryEngine, SqliteDatasetStore};
use insight::registry::CapabilityRegistry;
use insight::server::{serve, AppState};
use insight::session::SessionRegistry;

#[derive(Parser, Debug)]
#[command(name = "insight-gateway", about = "Insight analysis gateway")]
struct Args {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "127.0.0.1:8098", env = "INSIGHT_BIND_ADDR")]
    bind: String,

    /// Directory holding ingested dataset files (<dataset_ref>.db).
    #[arg(long, default_value = "./data", env = "INSIGHT_DATA_DIR")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_env();

    let llm = LlmProviderFactory::create(&config.llm).context("failed to create LLM provider")?;
    info!(provider = %llm.info().name, model = %llm.info().model, "llm provider ready");

    let store: Arc<dyn DatasetStore> = Arc::new(SqliteDatasetStore::new(args.data_dir.clone()));
    let bus = Arc::new(InMemoryEventBus::new(Duration::from_secs(
        config.stream_inactivity_timeout_seconds,
    )));
    let sink: Arc<dyn EventSink> = bus.clone();
    let engine = Arc::new(QueryEngine::new(
        Arc::clone(&llm),
        Arc::clone(&store),
        config.max_corrections,
        Duration::from_secs(config.query_timeout_seconds),
    ));

    // Explicit startup registration; the catalog is immutable after
    // this block.
    let registry = Arc::new(CapabilityRegistry::new());
    let quantitative = QueryCapability::new(
        "quantitative_analytics",
        CapabilityDomain::Quantitative,
        Arc::clone(&llm),
        Arc::clone(&engine),
        Arc::clone(&sink),
    );
    registry
        .register(quantitative.descriptor(), Arc::new(quantitative))
        .context("registering quantitative_analytics")?;

    let semantic = QueryCapability::new(
        "semantic_search",
        CapabilityDomain::Semantic,
        Arc::clone(&llm),
        Arc::clone(&engine),
        Arc::clone(&sink),
    );
    registry
        .register(semantic.descriptor(), Arc::new(semantic))
        .context("registering semantic_search")?;

    let discovery =
        DataDiscoveryCapability::new(Arc::clone(&llm), Arc::clone(&store), Arc::clone(&sink));
    registry
        .register(discovery.descriptor(), Arc::new(discovery))
        .context("registering data_discovery")?;

    info!(capabilities = registry.catalog().len(), "registry ready");

    let sessions = Arc::new(SessionRegistry::new());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&registry),
        Arc::new(LlmPlanner::new(Arc::clone(&llm))),
        Arc::clone(&llm),
        Arc::clone(&bus),
        Arc::clone(&sessions),
        Arc::clone(&store),
        &config,
    ));

    let state = AppState {
        orchestrator,
        bus,
        sessions,
    };
    serve(state, &args.bind).await.context("gateway exited")?;
    Ok(())
}
