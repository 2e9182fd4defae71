use anyhow::Result;
use rollcall_core::{EmbeddingExtractor, OnnxExtractor};
use rollcall_store::{GalleryCache, Store};
use rollcalld::pool::{ExtractorFactory, ExtractorPool};
use rollcalld::sessions::SessionManager;
use rollcalld::sweep::spawn_sweep;
use rollcalld::{AppState, Config};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        bind = %config.bind_addr,
        workers = config.extract_workers,
        "rollcalld starting"
    );

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Store::open(&config.db_path).await?;
    let gallery = Arc::new(GalleryCache::new(store.clone()));

    let detector_path = config.detector_model_path();
    let embedder_path = config.embedding_model_path();
    let factory: ExtractorFactory = Arc::new(move || {
        OnnxExtractor::load(&detector_path, &embedder_path)
            .map(|e| Box::new(e) as Box<dyn EmbeddingExtractor>)
    });
    let pool = ExtractorPool::spawn(config.extract_workers, config.queue_depth, factory);

    let manager = Arc::new(SessionManager::new(
        store,
        gallery,
        pool,
        config.voting_policy(),
        config.distance_threshold,
    ));

    let sweep = spawn_sweep(
        manager.clone(),
        config.max_session_secs,
        config.sweep_interval_secs,
    );

    let app = rollcalld::router(AppState {
        manager,
        max_frame_bytes: config.max_frame_bytes,
    });
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "rollcalld ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    sweep.abort();
    tracing::info!("rollcalld shutting down");
    Ok(())
}
