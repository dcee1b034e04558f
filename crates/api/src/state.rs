use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tripdesk_core::crm::{AutomationQueue, ContactSyncProvider, Dispatcher, MessagingProvider};
use tripdesk_core::lifecycle::{LifecycleEngine, TransitionGraph, DEFAULT_GRAPH};
use tripdesk_core::payments::{PaymentService, WebhookSecrets};
use tripdesk_core::rate_limit::{RateLimiter, SlidingWindowLimiter};
use tripdesk_core::store::{BookingStore, FailureStore, LeadStore, PaymentStore, RecordStore};

#[derive(Clone)]
pub struct AppState {
    pub bookings: Arc<dyn BookingStore>,
    pub failures: Arc<dyn FailureStore>,
    pub lifecycle: LifecycleEngine,
    pub payments: PaymentService,
    pub dispatcher: Arc<Dispatcher>,
    pub automations: AutomationQueue,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub tripdesk_env: String,
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Knobs for assembling [`AppState`] over a single store.
pub struct StateOptions {
    pub graph: TransitionGraph,
    pub secrets: WebhookSecrets,
    pub messaging: Option<Arc<dyn MessagingProvider>>,
    pub contact_sync: Option<Arc<dyn ContactSyncProvider>>,
    pub provider_timeout: Duration,
    pub dedup_window_days: i64,
    pub queue_capacity: usize,
    pub queue_workers: usize,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub tripdesk_env: String,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            graph: DEFAULT_GRAPH.clone(),
            secrets: WebhookSecrets::default(),
            messaging: None,
            contact_sync: None,
            provider_timeout: Duration::from_secs(8),
            dedup_window_days: 7,
            queue_capacity: 256,
            queue_workers: 4,
            rate_limiter: Arc::new(SlidingWindowLimiter::per_minute(60)),
            tripdesk_env: "dev".to_string(),
        }
    }
}

impl AppState {
    /// Wires every service over `store` and starts the automation workers.
    pub fn build<S>(store: Arc<S>, options: StateOptions) -> (Self, Vec<JoinHandle<()>>)
    where
        S: BookingStore + PaymentStore + LeadStore + FailureStore + RecordStore + 'static,
    {
        let bookings: Arc<dyn BookingStore> = store.clone();
        let failures: Arc<dyn FailureStore> = store.clone();
        let lifecycle = LifecycleEngine::with_graph(bookings.clone(), options.graph);
        let payments = PaymentService::new(
            bookings.clone(),
            store.clone(),
            failures.clone(),
            lifecycle.clone(),
        )
        .with_secrets(options.secrets);

        let mut dispatcher = Dispatcher::new(store.clone(), bookings.clone(), failures.clone(), store)
            .with_timeout(options.provider_timeout)
            .with_window_days(options.dedup_window_days);
        if let Some(provider) = options.messaging {
            dispatcher = dispatcher.with_messaging(provider);
        }
        if let Some(provider) = options.contact_sync {
            dispatcher = dispatcher.with_contact_sync(provider);
        }
        let dispatcher = Arc::new(dispatcher);
        let (automations, workers) =
            AutomationQueue::start(dispatcher.clone(), options.queue_capacity, options.queue_workers);

        let state = Self {
            bookings,
            failures,
            lifecycle,
            payments,
            dispatcher,
            automations,
            rate_limiter: options.rate_limiter,
            tripdesk_env: options.tripdesk_env,
        };
        (state, workers)
    }
}
