use std::sync::Arc;

use tracing::{error, info, warn};

use strata::config::Config;
use strata::db::Database;
use strata::processors::{
    vector_index::VectorIndexProcessor, watermark::WatermarkProcessor, ProcessorRegistry,
};
use strata::services::ai::AiClient;
use strata::services::settings::SettingsCache;
use strata::services::task_queue::TaskQueue;
use strata::services::thumbnail::ThumbnailService;
use strata::services::vector_store::VectorStore;
use strata::storage::registry::AdapterRegistry;
use strata::vfs::VirtualFs;
use strata::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::from_env()?;
    info!("starting strata on {}", config.server_address);

    let db = Database::new_with_pool_config(&config.database_url, 20, 2).await?;
    info!("database pool connected");

    sqlx::migrate!("./migrations").run(db.get_pool()).await?;
    info!("migrations applied");

    let settings = Arc::new(SettingsCache::new(db.clone()));

    // Live backend instances; a failed refresh only delays availability
    // until the next routing triggers a retry.
    let registry = Arc::new(AdapterRegistry::new());
    if let Err(e) = registry.refresh(&db).await {
        warn!("initial adapter refresh failed: {}", e);
    }

    let vector_store = Arc::new(VectorStore::open(&config.data_dir)?);
    let ai = Arc::new(AiClient::new(settings.clone())?);

    let mut processors = ProcessorRegistry::new();
    processors.register(Arc::new(WatermarkProcessor));
    processors.register(Arc::new(VectorIndexProcessor::new(
        vector_store.clone(),
        ai.clone(),
    )));
    let processors = Arc::new(processors);

    let queue = Arc::new(TaskQueue::new());
    let vfs = Arc::new(VirtualFs::new(
        db.clone(),
        registry.clone(),
        queue.clone(),
        processors.clone(),
    ));
    queue.start_worker(vfs.clone()).await;

    let state = Arc::new(AppState {
        db,
        config: config.clone(),
        registry,
        queue: queue.clone(),
        vfs,
        processors,
        thumbnails: Arc::new(ThumbnailService::new(&config.data_dir)),
        settings,
        vector_store,
        ai,
    });

    let app = strata::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server_address).await?;
    info!("listening on http://{}", config.server_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    info!("shutting down");
    queue.stop_worker().await;
    Ok(())
}
