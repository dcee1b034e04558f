//! HTTP surface of the booking back office.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    Router,
};

use crate::middleware::{rate_limit::rate_limit, request_id::request_id};
use crate::state::AppState;

/// Full router: health is exempt from rate limiting; every route gets a
/// request id.
pub fn app(state: AppState) -> Router {
    let v1 = routes::v1_router(state.clone()).layer(from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .merge(routes::health_router(state))
        .merge(v1)
        .layer(from_fn(request_id))
}
