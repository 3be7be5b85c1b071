#![forbid(unsafe_code)]

//! **kg-consumer-service** – Consumer runtime binary.
//!
//! Wires the bus, the vector/graph store adapters, the intelligence and
//! stamping service clients, and the orchestrator into one running
//! process, then hands control to [`kg_consumer::ConsumerRuntime`].
//!
//! ## Usage
//!
//! ```bash
//! kg-consumer-service \
//!   --vector-store-url http://localhost:6333 \
//!   --graph-store-url http://localhost:7474 \
//!   --intelligence-url http://localhost:9000 \
//!   --stamping-url http://localhost:9100 \
//!   --project-root /repo
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kg_bus_core::{Bus, InMemoryBus};
use kg_consumer::{ConsumerConfig, ConsumerRuntime};
use kg_graph_store::HttpGraphStore;
use kg_orchestrator::intelligence::HttpIntelligenceClient;
use kg_orchestrator::stamping::HttpStampingClient;
use kg_orchestrator::{Orchestrator, OrchestratorConfig};
use kg_vector_store::HttpVectorStore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

#[derive(Parser)]
#[command(name = "kg-consumer-service")]
#[command(about = "Knowledge-graph enrichment consumer runtime")]
#[command(version)]
struct Cli {
    /// Bus bootstrap endpoint(s); the in-memory bus accepts but doesn't use
    /// this yet, pending a real broker adapter.
    #[arg(long, env = "BUS_BOOTSTRAP_SERVERS", default_value = "")]
    bus_bootstrap_servers: String,

    /// Consumer group id.
    #[arg(long, env = "BUS_CONSUMER_GROUP", default_value = "enrichment-consumer")]
    bus_consumer_group: String,

    /// Base URL of the vector store's HTTP API.
    #[arg(long, env = "VECTOR_STORE_URL")]
    vector_store_url: Url,

    /// Vector store collection name.
    #[arg(long, env = "VECTOR_STORE_COLLECTION", default_value = "file_locations")]
    vector_store_collection: String,

    /// Expected embedding dimension.
    #[arg(long, env = "VECTOR_DIMENSION", default_value_t = 1536)]
    vector_dimension: usize,

    /// Base URL of the property graph store's HTTP API.
    #[arg(long, env = "GRAPH_STORE_URL")]
    graph_store_url: Url,

    /// Base URL of the intelligence service.
    #[arg(long, env = "INTELLIGENCE_URL")]
    intelligence_url: Url,

    /// Base URL of the legacy stamping service.
    #[arg(long, env = "METADATA_STAMPING_URL")]
    stamping_url: Url,

    /// Project root used to scope vector payloads.
    #[arg(long, env = "PROJECT_ROOT", default_value = "")]
    project_root: String,

    /// Number of worker tasks pulling from the enrichment topic concurrently.
    #[arg(long, env = "CONSUMER_WORKERS", default_value_t = 8)]
    consumer_workers: usize,

    /// Bound on files enriched concurrently across all workers.
    #[arg(long, env = "MAX_CONCURRENT_FILES", default_value_t = 5)]
    max_concurrent_files: usize,

    /// Files over this size, in megabytes, are skipped instead of enriched.
    #[arg(long, env = "MAX_FILE_SIZE_MB", default_value_t = 10)]
    max_file_size_mb: usize,

    /// Total timeout, in seconds, for outbound HTTP calls to the stores and
    /// services this process depends on.
    #[arg(long, env = "HTTP_TOTAL_TIMEOUT_SEC", default_value_t = 30)]
    http_total_timeout_sec: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialise logging")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    info!("starting kg-consumer-service v{}", env!("CARGO_PKG_VERSION"));

    let mut consumer_config = match ConsumerConfig::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "failed to load consumer configuration");
            std::process::exit(kg_consumer::EXIT_CONFIG_ERROR);
        }
    };
    consumer_config.workers = cli.consumer_workers;

    info!(
        group = %cli.bus_consumer_group,
        bootstrap_servers_configured = !cli.bus_bootstrap_servers.is_empty(),
        "bus configuration loaded"
    );

    let http_timeout = Duration::from_secs(cli.http_total_timeout_sec);
    let vector_store = Arc::new(HttpVectorStore::new(
        cli.vector_store_url,
        cli.vector_store_collection,
        cli.vector_dimension,
        http_timeout,
    ));
    let graph_store = Arc::new(HttpGraphStore::new(cli.graph_store_url, http_timeout));
    let intelligence = Arc::new(HttpIntelligenceClient::new(cli.intelligence_url, http_timeout));
    let stamping = Arc::new(HttpStampingClient::new(cli.stamping_url, http_timeout));
    let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::default());

    let orchestrator = Arc::new(
        Orchestrator::new(
            intelligence,
            stamping,
            vector_store,
            graph_store,
            OrchestratorConfig {
                project_root: cli.project_root,
                intelligence_concurrency: kg_orchestrator::DEFAULT_INTELLIGENCE_CONCURRENCY,
                max_concurrent_files: cli.max_concurrent_files,
                max_file_size_bytes: cli.max_file_size_mb * 1024 * 1024,
            },
        )
        .await,
    );
    info!(mode = ?orchestrator.mode(), "orchestrator ready");

    let runtime = ConsumerRuntime::new(consumer_config, bus, orchestrator);
    if let Err(err) = runtime.run().await {
        tracing::error!(%err, "consumer runtime exited with an error");
        std::process::exit(err.exit_code());
    }

    info!("kg-consumer-service stopped");
    std::process::exit(kg_consumer::EXIT_OK);
}
