//! Graceful shutdown coordinator: a broadcast channel fans the signal out to
//! every accept loop and the cache's refresh channel; registered components
//! are then joined under a bounded timeout so a wedged one cannot hang the
//! process. Grounded on the teacher's `graceful_shutdown.rs`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::error::Result;

const COMPONENT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type ShutdownFn = Box<dyn Fn() -> tokio::task::JoinHandle<Result<()>> + Send + Sync>;

struct ShutdownComponent {
    name: String,
    shutdown_fn: ShutdownFn,
}

pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<()>,
    components: Arc<Mutex<Vec<ShutdownComponent>>>,
}

impl GracefulShutdown {
    pub fn new() -> Arc<GracefulShutdown> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(GracefulShutdown {
            shutdown_tx,
            components: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// A fresh receiver for an accept loop or worker to select! against.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub async fn register_component<F, Fut>(&self, name: impl Into<String>, shutdown_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let component = ShutdownComponent {
            name: name.into(),
            shutdown_fn: Box::new(move || tokio::spawn(shutdown_fn())),
        };
        self.components.lock().await.push(component);
    }

    /// Fans out the shutdown signal, then joins every registered component in
    /// registration order, each bounded by [`COMPONENT_SHUTDOWN_TIMEOUT`].
    pub async fn shutdown(&self) {
        info!("initiating graceful shutdown");
        if self.shutdown_tx.send(()).is_err() {
            warn!("shutdown broadcast had no active receivers");
        }

        let components = self.components.lock().await;
        for component in components.iter() {
            info!(component = %component.name, "shutting down component");
            let handle = (component.shutdown_fn)();
            match timeout(COMPONENT_SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => info!(component = %component.name, "component shut down"),
                Ok(Ok(Err(e))) => error!(component = %component.name, error = %e, "component shutdown failed"),
                Ok(Err(e)) => error!(component = %component.name, error = %e, "component shutdown task panicked"),
                Err(_) => warn!(component = %component.name, "component shutdown timed out"),
            }
        }
        info!("graceful shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn shutdown_wakes_subscribers() {
        let shutdown = GracefulShutdown::new();
        let mut rx = shutdown.subscribe();
        shutdown.shutdown().await;
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn registered_component_runs_during_shutdown() {
        let shutdown = GracefulShutdown::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        shutdown
            .register_component("test-component", move || {
                let ran = ran_clone.clone();
                async move {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        shutdown.shutdown().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn slow_component_times_out_without_blocking_shutdown() {
        let shutdown = GracefulShutdown::new();
        shutdown
            .register_component("slow", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        let result = tokio::time::timeout(Duration::from_secs(7), shutdown.shutdown()).await;
        assert!(result.is_ok(), "shutdown must not wait out the slow component");
    }
}
