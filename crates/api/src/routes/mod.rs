pub mod bookings;
pub mod crm;
pub mod failures;
pub mod health;
pub mod payments;
pub mod webhooks;

use axum::Router;

use crate::state::AppState;

pub fn v1_router(state: AppState) -> Router {
    Router::new()
        .merge(bookings::router(state.clone()))
        .merge(payments::router(state.clone()))
        .merge(webhooks::router(state.clone()))
        .merge(crm::router(state.clone()))
        .merge(failures::router(state))
}

pub fn health_router(state: AppState) -> Router {
    health::router(state)
}
