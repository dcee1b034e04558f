use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tripdesk_api::middleware::rate_limit::RedisTokenBucket;
use tripdesk_api::state::{AppState, StateOptions};
use tripdesk_core::config::Settings;
use tripdesk_core::crm::{
    ContactSyncProvider, HttpContactSyncClient, HttpMessagingClient, MessagingProvider,
};
use tripdesk_core::lifecycle::TransitionGraph;
use tripdesk_core::payments::WebhookSecrets;
use tripdesk_core::rate_limit::{RateLimiter, SlidingWindowLimiter};
use tripdesk_db::PgStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let settings = Settings::from_env()?;
    if settings.is_production()
        && (settings.razorpay_webhook_secret.is_none() || settings.stripe_webhook_secret.is_none())
    {
        warn!("webhook secret missing in production; deliveries for that provider will be rejected");
    }

    let store = Arc::new(PgStore::connect(&settings.database_url, 10).await?);
    store.migrate().await?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.provider_timeout_secs))
        .build()?;

    let rate_limiter: Arc<dyn RateLimiter> = match &settings.redis_url {
        Some(url) => Arc::new(RedisTokenBucket::new(
            redis::Client::open(url.as_str())?,
            settings.rate_limit_per_minute,
        )),
        None => Arc::new(SlidingWindowLimiter::per_minute(settings.rate_limit_per_minute)),
    };

    let options = StateOptions {
        graph: TransitionGraph::configured(settings.lifecycle_extra_transitions.as_deref())?,
        secrets: WebhookSecrets {
            razorpay: settings.razorpay_webhook_secret.clone(),
            stripe: settings.stripe_webhook_secret.clone(),
        },
        messaging: settings.messaging.clone().map(|config| {
            Arc::new(HttpMessagingClient::new(http.clone(), config)) as Arc<dyn MessagingProvider>
        }),
        contact_sync: settings.contact_sync.clone().map(|config| {
            Arc::new(HttpContactSyncClient::new(http.clone(), config)) as Arc<dyn ContactSyncProvider>
        }),
        provider_timeout: Duration::from_secs(settings.provider_timeout_secs),
        dedup_window_days: settings.dedup_window_days,
        queue_capacity: settings.automation_queue_capacity,
        queue_workers: settings.worker_concurrency,
        rate_limiter,
        tripdesk_env: settings.tripdesk_env.clone(),
    };
    let (state, _workers) = AppState::build(store, options);

    let app = tripdesk_api::app(state);
    let addr: SocketAddr = settings.api_bind.parse()?;

    info!(%addr, env = %settings.tripdesk_env, "starting api");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
