use engine_core::error::EngineError;
use engine_executors::events::{LifecycleEvent, LifecycleListener};

/// Writes every lifecycle transition to the log.
pub struct LoggingListener;

impl LifecycleListener for LoggingListener {
    fn name(&self) -> &'static str {
        "lifecycle-log"
    }

    async fn on_event(&self, event: &LifecycleEvent) -> Result<(), EngineError> {
        let record = &event.record;
        tracing::info!(
            queue_id = %event.queue_id,
            chain_id = record.chain_id,
            wallet = ?record.from_address,
            nonce = ?record.nonce,
            previous_status = ?event.previous_status,
            new_status = %event.new_status,
            error = ?record.error_message,
            "Transaction status changed"
        );
        Ok(())
    }
}
