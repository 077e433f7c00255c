use http::HeaderName;
use idempotency_service::api::{create_router, AppState};
use idempotency_service::config::{Settings, StoreBackend};
use idempotency_service::idempotency::{ConfigRegistry, IdempotencyOrchestrator, LockReaperJob};
use idempotency_service::observability::{init_logging, init_metrics, HealthChecker};
use idempotency_service::repositories::{MemoryStore, Stores};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;
    init_logging(&settings.application.log_config());
    info!("Configuration loaded, store backend: {:?}", settings.store.backend);

    let metrics_handle = init_metrics();

    let mut pool = None;
    if let Some(database) = settings.database.as_ref().filter(|_| settings.store.backend != StoreBackend::Memory) {
        info!("Connecting to database...");
        let connected = PgPoolOptions::new()
            .max_connections(database.pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&database.url)
            .await?;
        info!("Database connection established");

        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&connected).await?;
        info!("Migrations applied successfully");
        pool = Some(connected);
    }

    let mut redis_client = None;
    if let Some(redis_settings) = settings.redis.as_ref().filter(|_| settings.store.backend == StoreBackend::Hybrid) {
        info!("Connecting to Redis...");
        let client = redis::Client::open(redis_settings.url.as_str())?;
        let mut con = client.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("PING").query_async(&mut con).await?;
        info!("Redis connection established");
        redis_client = Some(client);
    }

    let stores = match (settings.store.backend, &pool, &redis_client, &settings.redis) {
        (StoreBackend::Postgres, Some(pool), _, _) => Stores::postgres(pool.clone()),
        (StoreBackend::Hybrid, Some(pool), Some(client), Some(redis_settings)) => {
            Stores::hybrid(pool.clone(), client.clone(), &redis_settings.key_prefix)
        }
        _ => Stores::memory(Arc::new(MemoryStore::new())),
    };

    let retry = settings.retry.policy();
    let registry = Arc::new(ConfigRegistry::new(stores.configs.clone(), retry.clone()));
    for config in settings.operation_configs()? {
        registry.register(config).await?;
    }
    let loaded = registry.load().await?;
    info!("{} idempotent operations registered", loaded);

    let orchestrator = Arc::new(IdempotencyOrchestrator::new(stores, Arc::clone(&registry), retry));

    if settings.reaper.enabled {
        LockReaperJob::new(
            Arc::clone(&orchestrator),
            settings.reaper.interval_seconds,
            settings.reaper.batch_size,
        )
        .start();
        info!("Lock reaper started, interval {}s", settings.reaper.interval_seconds);
    }

    let health_checker = Arc::new(HealthChecker::new(pool, redis_client).with_registry(registry));
    let state = AppState::new(orchestrator)
        .with_metrics(metrics_handle)
        .with_health_checker(health_checker);

    let request_id = HeaderName::from_static("x-request-id");
    let app = create_router(state)
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid));

    let address = format!("{}:{}", settings.application.host, settings.application.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Listening on {}", address);
    axum::serve(listener, app).await?;

    Ok(())
}
