//! Fire-and-forget automation dispatch.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::{AutomationRequest, Dispatcher};

/// Bounded queue drained by a fixed pool of dispatch workers.
///
/// Workers stop once every sender handle has been dropped and the queue is
/// empty.
#[derive(Clone)]
pub struct AutomationQueue {
    sender: mpsc::Sender<AutomationRequest>,
}

impl AutomationQueue {
    pub fn start(
        dispatcher: Arc<Dispatcher>,
        capacity: usize,
        workers: usize,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (sender, receiver) = mpsc::channel::<AutomationRequest>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(request) = next else {
                            break;
                        };
                        let event = request.event;
                        let dispatcher = dispatcher.clone();
                        let job = tokio::spawn(async move {
                            dispatcher.dispatch_best_effort(request).await;
                        });
                        if let Err(err) = job.await {
                            error!(worker, automation_event = %event, error = %err, "automation job panicked");
                        }
                    }
                })
            })
            .collect();

        (Self { sender }, handles)
    }

    /// Returns false when the queue is full or closed; the request is dropped.
    pub fn enqueue(&self, request: AutomationRequest) -> bool {
        let event = request.event;
        match self.sender.try_send(request) {
            Ok(()) => true,
            Err(err) => {
                warn!(automation_event = %event, error = %err, "automation request dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DEDUP_COLLECTION;
    use crate::store::MemoryStore;
    use crate::types::{AutomationEvent, Lead};

    #[tokio::test]
    async fn test_queue_drains_and_stops() {
        let store = Arc::new(MemoryStore::new());
        store.insert_lead(Lead {
            id: "ld_1".into(),
            name: "Asha".into(),
            email: None,
            phone: None,
            stage: None,
        });
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
        ));
        let (queue, handles) = AutomationQueue::start(dispatcher, 8, 2);

        assert!(queue.enqueue(AutomationRequest::for_lead(AutomationEvent::LeadCreated, "ld_1")));
        assert!(queue.enqueue(AutomationRequest::for_lead(AutomationEvent::LeadCreated, "ld_1")));
        drop(queue);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.collection_rows(DEDUP_COLLECTION).len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_request() {
        let (sender, _receiver) = mpsc::channel(1);
        let queue = AutomationQueue { sender };

        assert!(queue.enqueue(AutomationRequest::for_lead(AutomationEvent::LeadCreated, "ld_1")));
        assert!(!queue.enqueue(AutomationRequest::for_lead(AutomationEvent::QuoteSent, "ld_1")));
    }
}
