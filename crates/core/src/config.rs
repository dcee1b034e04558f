use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MessagingConfig {
    pub api_url: String,
    pub api_token: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ContactSyncConfig {
    pub api_url: String,
    pub api_key: String,
    pub list_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub tripdesk_env: String,
    pub api_bind: String,
    pub worker_concurrency: usize,
    pub razorpay_webhook_secret: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub messaging: Option<MessagingConfig>,
    pub contact_sync: Option<ContactSyncConfig>,
    pub provider_timeout_secs: u64,
    pub dedup_window_days: i64,
    pub rate_limit_per_minute: u32,
    pub automation_queue_capacity: usize,
    pub lifecycle_extra_transitions: Option<String>,
    pub automation_retry_max_attempts: i32,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let database_url = get("DATABASE_URL")
            .or_else(|| get("TRIPDESK_DATABASE_URL"))
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let redis_url = get("REDIS_URL").or_else(|| get("TRIPDESK_REDIS_URL"));
        let tripdesk_env = get("TRIPDESK_ENV").unwrap_or_else(|| "dev".to_string());
        let api_bind = get("TRIPDESK_API_BIND").unwrap_or_else(|| "0.0.0.0:3000".to_string());

        let messaging = match (get("MESSAGING_API_URL"), get("MESSAGING_API_TOKEN")) {
            (Some(api_url), Some(api_token)) => Some(MessagingConfig { api_url, api_token }),
            _ => None,
        };
        let contact_sync = match (get("CONTACT_SYNC_API_URL"), get("CONTACT_SYNC_API_KEY")) {
            (Some(api_url), Some(api_key)) => Some(ContactSyncConfig {
                api_url,
                api_key,
                list_id: get("CONTACT_SYNC_LIST_ID"),
            }),
            _ => None,
        };

        Ok(Self {
            database_url,
            redis_url,
            tripdesk_env,
            api_bind,
            worker_concurrency: parse_or(&get, "TRIPDESK_WORKER_CONCURRENCY", 4)?,
            razorpay_webhook_secret: get("RAZORPAY_WEBHOOK_SECRET"),
            stripe_webhook_secret: get("STRIPE_WEBHOOK_SECRET"),
            messaging,
            contact_sync,
            provider_timeout_secs: parse_or(&get, "PROVIDER_TIMEOUT_SECS", 8)?,
            dedup_window_days: parse_or(&get, "DEDUP_WINDOW_DAYS", 7)?,
            rate_limit_per_minute: parse_or(&get, "RATE_LIMIT_PER_MINUTE", 60)?,
            automation_queue_capacity: parse_or(&get, "AUTOMATION_QUEUE_CAPACITY", 256)?,
            lifecycle_extra_transitions: get("LIFECYCLE_EXTRA_TRANSITIONS"),
            automation_retry_max_attempts: parse_or(&get, "AUTOMATION_RETRY_MAX_ATTEMPTS", 5)?,
        })
    }

    pub fn is_production(&self) -> bool {
        matches!(self.tripdesk_env.as_str(), "prod" | "production")
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            key,
            reason: format!("'{raw}': {err}"),
        }),
        None => Ok(default),
    }
}
