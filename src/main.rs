use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use flex_image::config::Config;
use flex_image::dedup::{DedupIndex, FileIndexStore};
use flex_image::handlers::{self, AppState};
use flex_image::resolver::Resolver;
use flex_image::storage::StorageRegistry;
use flex_image::upload::Uploader;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional in deployment; fall back to the process environment.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flex_image=debug,tower_http=debug,axum=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    config.validate()?;

    let index = Arc::new(DedupIndex::new(
        Box::new(FileIndexStore::new(config.index_path.clone())),
        config.site_base_dir.clone(),
    ));

    // Offline maintenance entry point, not a server mode.
    if std::env::args().nth(1).as_deref() == Some("rebuild-index") {
        let start = config.upload_base();
        tracing::info!("rebuilding dedup index from {}", start.display());
        let report =
            tokio::task::spawn_blocking(move || index.rebuild(&start, &mut |msg| println!("{msg}")))
                .await?;
        if report.failed > 0 {
            std::process::exit(1);
        }
        return Ok(());
    }

    tracing::info!("Starting image service");
    tracing::info!("Default storage: {:?}", config.default_storage);

    let registry = Arc::new(StorageRegistry::from_config(&config)?);
    let resolver = Arc::new(Resolver::new(&config));
    let uploader = Arc::new(Uploader::new(
        registry.clone(),
        index.clone(),
        config.max_upload_size,
    ));

    let max_body = config.max_upload_size;
    let serve_route = format!("/{}/*path", config.upload_dir.trim_matches('/'));
    let state = AppState { resolver, uploader };

    let app = Router::new()
        .route(&serve_route, get(handlers::serve_image))
        .route("/upload", post(handlers::upload_images))
        .layer(DefaultBodyLimit::max(max_body * 8))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
