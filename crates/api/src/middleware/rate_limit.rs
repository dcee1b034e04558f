use std::net::SocketAddr;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::Response,
};
use tracing::warn;
use tripdesk_core::rate_limit::{RateLimitError, RateLimiter};

use crate::{
    error::{ApiError, AppError},
    state::{AppState, RequestId},
};

pub async fn rate_limit(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let key = client_key(&req);

    match state.rate_limiter.allow(&key).await {
        Ok(true) => {}
        Ok(false) => return Err(AppError::RateLimited.with_request_id(&request_id)),
        // Admit on backend failure; gateways must still reach the webhook routes.
        Err(err) => warn!(event = "rate_limit_backend_error", client = %key, error = %err),
    }

    Ok(next.run(req).await)
}

/// First `X-Forwarded-For` hop, else the peer address.
fn client_key(req: &Request<Body>) -> String {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(client) = forwarded {
        return client.to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Token bucket kept in Redis so every API instance shares one budget.
pub struct RedisTokenBucket {
    client: redis::Client,
    capacity: u32,
    refill_per_min: u32,
}

impl RedisTokenBucket {
    pub fn new(client: redis::Client, per_minute: u32) -> Self {
        Self {
            client,
            capacity: per_minute,
            refill_per_min: per_minute,
        }
    }
}

#[async_trait]
impl RateLimiter for RedisTokenBucket {
    async fn allow(&self, key: &str) -> Result<bool, RateLimitError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| RateLimitError(err.to_string()))?;
        allow_request(&mut conn, key, self.capacity, self.refill_per_min)
            .await
            .map_err(|err| RateLimitError(err.to_string()))
    }
}

const TOKEN_BUCKET_SCRIPT: &str = r#"
local bucket = KEYS[1]
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill = tonumber(ARGV[3])

local data = redis.call('HMGET', bucket, 'tokens', 'ts')
local tokens = tonumber(data[1]) or capacity
local ts = tonumber(data[2]) or now

local delta = math.max(0, now - ts)
local new_tokens = math.min(capacity, tokens + (delta * refill / 60))

if new_tokens < 1 then
  redis.call('HMSET', bucket, 'tokens', new_tokens, 'ts', now)
  redis.call('EXPIRE', bucket, 120)
  return 0
else
  new_tokens = new_tokens - 1
  redis.call('HMSET', bucket, 'tokens', new_tokens, 'ts', now)
  redis.call('EXPIRE', bucket, 120)
  return 1
end
"#;

async fn allow_request(
    conn: &mut redis::aio::MultiplexedConnection,
    key: &str,
    capacity: u32,
    refill_per_min: u32,
) -> redis::RedisResult<bool> {
    let now = chrono::Utc::now().timestamp();
    let allowed: i32 = redis::Script::new(TOKEN_BUCKET_SCRIPT)
        .key(format!("tripdesk:rl:{key}"))
        .arg(now)
        .arg(capacity)
        .arg(refill_per_min)
        .invoke_async(conn)
        .await?;

    Ok(allowed == 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(forwarded: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/v1/crm/automations");
        if let Some(value) = forwarded {
            builder = builder.header("x-forwarded-for", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_client_key_prefers_first_forwarded_hop() {
        let req = request(Some("203.0.113.7, 10.0.0.1"));
        assert_eq!(client_key(&req), "203.0.113.7");
    }

    #[test]
    fn test_client_key_uses_peer_address() {
        let mut req = request(None);
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 10], 4000))));
        assert_eq!(client_key(&req), "192.0.2.10");
    }

    #[test]
    fn test_client_key_falls_back_to_anonymous() {
        assert_eq!(client_key(&request(Some("  "))), "anonymous");
    }
}
