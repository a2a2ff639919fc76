use engine_core::error::EngineError;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
    shutdown::WorkerHandle,
    store::{TransactionRecord, TransactionStatus},
};

const DEFAULT_CAPACITY: usize = 1024;

/// Emitted after a change to a transaction record has been committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub queue_id: String,
    /// `None` for the initial enqueue
    pub previous_status: Option<TransactionStatus>,
    pub new_status: TransactionStatus,
    pub record: TransactionRecord,
}

/// In-process fanout of lifecycle events.
///
/// Emitting never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers observe a lag instead of stalling the queue.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, previous_status: Option<TransactionStatus>, record: &TransactionRecord) {
        let event = LifecycleEvent {
            queue_id: record.queue_id.clone(),
            previous_status,
            new_status: record.status,
            record: record.clone(),
        };

        tracing::debug!(
            queue_id = %event.queue_id,
            previous_status = ?previous_status,
            new_status = %event.new_status,
            "Lifecycle event"
        );

        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

/// External consumer of lifecycle events (webhook dispatcher, websocket
/// broadcaster). Failures are reported as [`EngineError::DeliveryError`] and
/// never reach the transaction.
pub trait LifecycleListener: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn on_event(
        &self,
        event: &LifecycleEvent,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;
}

/// Runs `listener` against every event on `bus` until shut down.
pub fn spawn_listener<L: LifecycleListener>(bus: &EventBus, listener: L) -> WorkerHandle {
    let mut receiver = bus.subscribe();
    let name = listener.name();

    WorkerHandle::spawn(name, move |mut shutdown_rx| async move {
        loop {
            let event = tokio::select! {
                _ = &mut shutdown_rx => break,
                event = receiver.recv() => event,
            };

            match event {
                Ok(event) => {
                    if let Err(e) = listener.on_event(&event).await {
                        tracing::warn!(
                            listener = name,
                            queue_id = %event.queue_id,
                            error = %e,
                            "Lifecycle delivery failed"
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(listener = name, skipped, "Lifecycle listener lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }

        tracing::debug!(listener = name, "Lifecycle listener stopped");
        Ok(())
    })
}
