use std::future::Future;

use eyre::{Context, Result};
use tokio::spawn;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, Level, debug, error, span};

use crate::shutdown::Shutdown;

#[derive(Debug)]
pub enum ServiceExit {
    GracefulShutdown,
    EarlyStop,
    Panic(JoinError),
}

/// Runs a long-lived service under the shutdown manager. A service that stops
/// without a shutdown being triggered, or panics, takes the process down with
/// it; shutdown completion waits for the service to return.
pub fn spawn_service(
    shutdown: &Shutdown,
    name: impl Into<String>,
    future: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<ServiceExit>> {
    let shutdown = shutdown.clone();
    let service_name = name.into();

    let supervised = {
        let shutdown = shutdown.clone();
        async move {
            debug!("Service starting");
            let exit = match spawn(future).await {
                Ok(_) if shutdown.is_shutdown_triggered() => ServiceExit::GracefulShutdown,
                Ok(_) => {
                    shutdown.trigger_shutdown();
                    ServiceExit::EarlyStop
                }
                Err(err) => {
                    shutdown.trigger_shutdown();
                    ServiceExit::Panic(err)
                }
            };

            match &exit {
                ServiceExit::GracefulShutdown => debug!("Service gracefully shutdown"),
                ServiceExit::EarlyStop => error!("Service stopped early"),
                ServiceExit::Panic(err) => error!(%err, "Service panicked"),
            }
            exit
        }
    };

    let instrumented = supervised.instrument(span!(Level::ERROR, "service", "{}", service_name));

    let waited = shutdown
        .wrap_delay_shutdown(instrumented)
        .context(service_name)?;

    Ok(spawn(waited))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    fn test_shutdown() -> Shutdown {
        Shutdown::new_with_signal(std::future::pending::<()>())
    }

    #[tokio::test]
    async fn graceful_shutdown_on_shutdown_request() {
        let shutdown = test_shutdown();
        let handle = spawn_service(&shutdown, "test", {
            let shutdown = shutdown.clone();
            async move {
                shutdown.wait_shutdown_triggered().await;
                tokio::time::sleep(Duration::from_micros(500)).await;
            }
        })
        .unwrap();

        shutdown.trigger_shutdown();

        assert_matches!(handle.await, Ok(ServiceExit::GracefulShutdown));
    }

    #[tokio::test]
    async fn should_capture_early_stop() {
        let shutdown = test_shutdown();
        let handle = spawn_service(&shutdown, "test", async move {
            tokio::time::sleep(Duration::from_micros(500)).await;
        })
        .unwrap();

        assert_matches!(handle.await, Ok(ServiceExit::EarlyStop));
        assert!(shutdown.is_shutdown_triggered());
    }

    #[tokio::test]
    async fn should_capture_panic() {
        let shutdown = test_shutdown();
        let handle = spawn_service(&shutdown, "test", async move {
            tokio::time::sleep(Duration::from_micros(500)).await;
            panic!();
        })
        .unwrap();

        assert_matches!(handle.await, Ok(ServiceExit::Panic(_)));
        assert!(shutdown.is_shutdown_triggered());
    }
}
