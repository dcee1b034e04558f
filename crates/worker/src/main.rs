use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tracing::{error, info};
use tripdesk_core::config::Settings;
use tripdesk_core::crm::Dispatcher;
use tripdesk_db::PgStore;

mod jobs;

use jobs::automation_retry::{sweep, SweepConfig};

/// Re-runs failed CRM automation channels.
#[derive(Debug, Parser)]
#[command(name = "tripdesk-worker")]
struct Args {
    /// Run a single sweep and exit.
    #[arg(long)]
    once: bool,
    #[arg(long, default_value_t = 60)]
    interval_secs: u64,
    #[arg(long, default_value_t = 100)]
    batch_size: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();
    let settings = Settings::from_env()?;

    let store = Arc::new(PgStore::connect(&settings.database_url, 5).await?);
    store.migrate().await?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.provider_timeout_secs))
        .build()?;
    let dispatcher = Dispatcher::new(store.clone(), store.clone(), store.clone(), store.clone())
        .with_settings(&settings, &client);

    let config = SweepConfig {
        batch_size: args.batch_size,
        max_attempts: settings.automation_retry_max_attempts,
        concurrency: settings.worker_concurrency,
    };

    info!(once = args.once, interval_secs = args.interval_secs, "worker starting");

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("worker stopping");
                return Ok(());
            }
        }

        match sweep(&dispatcher, store.as_ref(), config, Utc::now()).await {
            Ok(_) => {}
            Err(err) if args.once => return Err(err.into()),
            Err(err) => error!(event = "automation_retry_sweep_failed", error = %err),
        }
        if args.once {
            return Ok(());
        }
    }
}
