//! Ragpilot server entry point

use ragpilot::agent::ProcessRunner;
use ragpilot::{
    ChatOracle, Collaborators, Config, EmbeddingConfig, HttpEmbedder, HttpFetcher,
    HttpPartitioner, HttpSearch, OracleConfig, SessionConfig, SessionStore,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let oracle = Arc::new(ChatOracle::new(OracleConfig::from_config(&config))?);
    let embedder = Arc::new(HttpEmbedder::new(EmbeddingConfig {
        base_url: config.embed_url.clone(),
        api_key: config.embed_api_key.clone(),
        model: config.embed_model.clone(),
        dimension: config.embedding_dim,
        timeout: std::time::Duration::from_secs(30),
    })?);
    let partitioner = Arc::new(HttpPartitioner::new(
        &config.partitioner_url,
        config.partitioner_api_key.as_deref(),
    )?);
    let fetcher = Arc::new(HttpFetcher::new()?);
    let search = Arc::new(HttpSearch::new(
        &config.search_url,
        config.search_api_key.as_deref(),
    )?);
    let runner = Arc::new(ProcessRunner::default());

    let store = SessionStore::new(
        Collaborators {
            oracle,
            embedder,
            partitioner,
            fetcher,
            search,
            runner,
        },
        SessionConfig::from_config(&config),
    );
    store.spawn_eviction();

    let app = ragpilot::server::router(store);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
