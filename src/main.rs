use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use metered_gateway::billing::{
    CounterStore, MemoryCounterStore, PaymentGateway, PgBillingStore, RateLimiter,
    RedisCounterStore, SignatureVerifier, StripeAdapter,
};
use metered_gateway::provider::{ModelProvider, OpenAiCompatibleProvider};
use metered_gateway::{app, config, AppServices};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if required secrets are missing
    let _ = config::JWT_SECRET.as_str();
    let _ = config::STRIPE_WEBHOOK_SECRET.as_str();
    let _ = config::STRIPE_SECRET_KEY.as_str();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    // Run migrations if available
    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let counters: Arc<dyn CounterStore> = match config::REDIS_URL.as_deref() {
        Some(url) => Arc::new(RedisCounterStore::connect(url, *config::COUNTER_STORE_TIMEOUT).await?),
        None => {
            tracing::warn!(
                "REDIS_URL not set; free-tier counters are process-local and not shared between replicas"
            );
            Arc::new(MemoryCounterStore::new())
        }
    };
    let limiter = RateLimiter::new(
        counters,
        *config::FREE_DAILY_LIMIT,
        *config::FREE_WINDOW,
        config::RATE_LIMIT_PREFIX.as_str(),
    );

    let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeAdapter::new(
        config::STRIPE_API_BASE.as_str(),
        config::STRIPE_SECRET_KEY.as_str(),
        config::APP_URL.as_str(),
    )?);
    let provider: Arc<dyn ModelProvider> = Arc::new(
        OpenAiCompatibleProvider::new(
            config::MODEL_API_BASE.as_str(),
            config::MODEL_API_KEY.clone(),
            config::MODEL_NAME.as_str(),
            config::SYSTEM_PROMPT.as_str(),
        )
        .map_err(|error| Box::<dyn std::error::Error>::from(format!("{error:#}")))?,
    );

    let services = AppServices::assemble(
        Arc::new(PgBillingStore::new(pool.clone())),
        limiter,
        config::plan_catalog_from_env(),
        SignatureVerifier::new(
            config::STRIPE_WEBHOOK_SECRET.as_str(),
            *config::STRIPE_WEBHOOK_TOLERANCE,
        ),
        gateway,
        provider,
    );

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let router = Router::new()
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(app(services))
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await?;

    Ok(())
}
