use axum::routing::{get, post, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use charforge::app_state::AppState;
use charforge::config::AppConfig;
use charforge::db::{self, store::PgStore};
use charforge::routes;
use charforge::services::queue::{QueueEngine, RedisQueueBackend};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing charforge API server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // The API only enqueues and inspects; workers consume.
    tracing::info!("Connecting to Redis job queue");
    let backend = RedisQueueBackend::connect(&config.redis_url, &config.queue_prefix)
        .await
        .expect("Failed to connect to Redis");
    let queue = QueueEngine::new(Arc::new(backend));

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(PgStore::new(db_pool), queue, config);

    let api = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/queues/{queue}", get(routes::queues::queue_counts))
        .route(
            "/api/v1/queues/{queue}/jobs/{job_id}",
            get(routes::queues::job_status),
        )
        .route(
            "/api/v1/characters/{character_id}/images",
            post(routes::characters::generate_images),
        )
        .route(
            "/api/v1/admin/batch-generation",
            post(routes::admin::start_batch_generation),
        )
        .route(
            "/api/v1/admin/batch-generation/logs",
            get(routes::admin::todays_batch_logs),
        )
        .route("/api/v1/admin/curation/run", post(routes::admin::start_curation))
        .route("/api/v1/admin/settings", get(routes::admin::get_settings))
        .route("/api/v1/admin/settings/{key}", put(routes::admin::put_setting))
        .with_state(state);

    let app = api
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
