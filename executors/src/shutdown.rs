use engine_core::error::EngineError;
use tokio::{sync::oneshot, task::JoinHandle};

/// Handle for a single background task that can be shut down gracefully
pub struct WorkerHandle {
    pub name: &'static str,
    pub join_handle: JoinHandle<Result<(), EngineError>>,
    pub shutdown_tx: oneshot::Sender<()>,
}

impl WorkerHandle {
    /// Spawns `run`, handing it the receiving half of the shutdown signal.
    pub fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(run(shutdown_rx));
        Self {
            name,
            join_handle,
            shutdown_tx,
        }
    }

    pub async fn shutdown(self) -> Result<(), EngineError> {
        tracing::info!(worker = self.name, "Initiating graceful shutdown");

        if self.shutdown_tx.send(()).is_err() {
            tracing::warn!(worker = self.name, "Worker was already shutting down");
        }

        match self.join_handle.await {
            Ok(Ok(())) => {
                tracing::info!(worker = self.name, "Worker shut down gracefully");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(worker = self.name, error = ?e, "Worker shut down with error");
                Err(e)
            }
            Err(e) => {
                tracing::error!(worker = self.name, error = ?e, "Worker panicked during shutdown");
                Err(EngineError::InternalError {
                    message: format!("Worker {} panic: {e}", self.name),
                })
            }
        }
    }
}

/// Coordinates shutdown of every background task
#[derive(Default)]
pub struct ShutdownHandle {
    workers: Vec<WorkerHandle>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&mut self, worker: WorkerHandle) {
        self.workers.push(worker);
    }

    /// Builder-style method to add a worker
    pub fn and_worker(mut self, worker: WorkerHandle) -> Self {
        self.add_worker(worker);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker first, then waits for all of them.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        let worker_count = self.workers.len();
        tracing::info!(worker_count, "Initiating graceful shutdown of workers");

        let mut join_handles = Vec::with_capacity(worker_count);
        for worker in self.workers {
            if worker.shutdown_tx.send(()).is_err() {
                tracing::warn!(worker = worker.name, "Worker was already shutting down");
            }
            join_handles.push((worker.name, worker.join_handle));
        }

        let (names, handles): (Vec<_>, Vec<_>) = join_handles.into_iter().unzip();
        let results = futures::future::join_all(handles).await;

        let mut first_error = None;
        let mut error_count = 0;
        for (name, result) in names.into_iter().zip(results) {
            let error = match result {
                Ok(Ok(())) => {
                    tracing::debug!(worker = name, "Worker shut down gracefully");
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) => EngineError::InternalError {
                    message: format!("Worker {name} panic: {e}"),
                },
            };
            tracing::error!(worker = name, error = ?error, "Worker shut down with error");
            error_count += 1;
            first_error.get_or_insert(error);
        }

        match first_error {
            None => {
                tracing::info!(worker_count, "All workers shut down gracefully");
                Ok(())
            }
            Some(error) => {
                tracing::error!(error_count, "Workers had errors during shutdown");
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signals_and_joins_all_workers() {
        let first = WorkerHandle::spawn("first", |rx| async move {
            let _ = rx.await;
            Ok(())
        });
        let second = WorkerHandle::spawn("second", |rx| async move {
            let _ = rx.await;
            Err(EngineError::InternalError {
                message: "boom".to_string(),
            })
        });

        let handle = ShutdownHandle::new().and_worker(first).and_worker(second);
        assert_eq!(handle.worker_count(), 2);

        let err = handle.shutdown().await.unwrap_err();
        assert!(matches!(err, EngineError::InternalError { .. }));
    }
}
