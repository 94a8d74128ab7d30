use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use charforge::config::{AppConfig, RuntimeSettings};
use charforge::db::{self, store::PgStore};
use charforge::models::job::QueueDefinition;
use charforge::services::batch::{BatchGenerator, BatchSettings};
use charforge::services::credits::CreditLedger;
use charforge::services::curation::{CurationPipeline, CurationPolicy};
use charforge::services::image_source::CivitaiClient;
use charforge::services::jobs::JobDispatcher;
use charforge::services::queue::{QueueEngine, RedisQueueBackend};
use charforge::services::scheduler::Scheduler;
use charforge::services::stages::MultiStageGenerator;
use charforge::services::storage::R2Client;
use charforge::services::workers_ai::WorkersAiClient;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting charforge worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    let store = Arc::new(PgStore::new(db_pool));

    tracing::info!("Connecting to Redis job queue");
    let backend = RedisQueueBackend::connect(&config.redis_url, &config.queue_prefix)
        .await
        .expect("Failed to connect to Redis");
    let engine = Arc::new(QueueEngine::new(Arc::new(backend)));

    tracing::info!("Initializing services");
    let storage = Arc::new(
        R2Client::new(
            &config.r2_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
            &config.r2_public_url,
        )
        .expect("Failed to initialize R2 client"),
    );
    let workers_ai = Arc::new(
        WorkersAiClient::new(
            &config.cf_account_id,
            &config.cf_api_token,
            &config.image_model,
            &config.vision_model,
            &config.text_model,
        )
        .expect("Failed to initialize Workers AI client"),
    );
    let civitai = Arc::new(
        CivitaiClient::new(config.civitai_api_key.clone()).expect("Failed to initialize Civitai client"),
    );

    // Scheduled catalog generation is paid by the platform account.
    let ledger = CreditLedger::new(store.clone()).with_overdraft_account(config.system_user_id);
    let stages = Arc::new(MultiStageGenerator::new(
        store.clone(),
        workers_ai.clone(),
        storage,
        Duration::from_secs(config.stage_timeout_secs),
    ));
    let batch = Arc::new(BatchGenerator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        ledger.clone(),
        workers_ai.clone(),
        stages.clone(),
        BatchSettings::default(),
    ));
    let curation = Arc::new(CurationPipeline::new(
        store.clone(),
        workers_ai,
        civitai,
        CurationPolicy::default(),
    ));

    let fallback = RuntimeSettings::from(&config);
    let dispatcher = Arc::new(JobDispatcher::new(
        store.clone(),
        fallback.clone(),
        ledger,
        stages,
        batch,
        curation,
        config.system_user_id,
    ));

    for definition in QueueDefinition::defaults() {
        engine
            .register_worker(definition, dispatcher.clone())
            .expect("Failed to register queue worker");
    }

    let scheduler = Scheduler::new(engine.clone());
    match RuntimeSettings::load(store.as_ref(), fallback.clone()).await {
        Ok(settings) => {
            if let Err(e) = scheduler.register_defaults(&settings, Utc::now()).await {
                tracing::error!(error = %e, "Failed to register recurring jobs");
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to load runtime settings, recurring jobs not registered"),
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(store.clone(), fallback, shutdown_rx));

    tracing::info!("Worker ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutting down worker");
    shutdown_tx.send_replace(true);
    if let Err(e) = scheduler_task.await {
        tracing::error!(error = %e, "Scheduler task ended abnormally");
    }
    engine.shutdown().await;
}
