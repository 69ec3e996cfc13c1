use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, HostingError};
use crate::logging::{HOST_TARGET, event_ids};

/// A background service whose lifetime follows the host.
///
/// ```rust,ignore
/// struct Heartbeat;
///
/// #[async_trait]
/// impl HostedService for Heartbeat {
///     async fn start(&self, _token: CancellationToken) -> Result<(), BoxError> {
///         tokio::spawn(beat());
///         Ok(())
///     }
///
///     async fn stop(&self, _token: CancellationToken) -> Result<(), BoxError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait HostedService: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called before the server starts accepting requests.
    async fn start(&self, token: CancellationToken) -> Result<(), BoxError>;

    /// Called during shutdown. `token` fires when the shutdown timeout ends.
    async fn stop(&self, token: CancellationToken) -> Result<(), BoxError>;

    /// Release resources. Called once, when the host is disposed.
    async fn dispose(&self) {}
}

/// Starts and stops the registered hosted services in order.
pub struct HostedServiceExecutor {
    services: Vec<Arc<dyn HostedService>>,
    /// Leading services whose `start` succeeded.
    started: usize,
}

impl HostedServiceExecutor {
    pub fn new(services: Vec<Arc<dyn HostedService>>) -> Self {
        HostedServiceExecutor {
            services,
            started: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Start every service sequentially. The first failure aborts startup.
    pub async fn start(&mut self, token: CancellationToken) -> Result<(), HostingError> {
        for service in self.services.iter().skip(self.started) {
            if let Err(source) = service.start(token.clone()).await {
                tracing::error!(
                    target: HOST_TARGET,
                    event_id = event_ids::HOSTED_SERVICE_START_EXCEPTION,
                    service = service.name(),
                    error = %source,
                    "An error occurred starting the hosted service"
                );
                return Err(HostingError::HostedServiceStart {
                    name: service.name().to_owned(),
                    source,
                });
            }
            self.started += 1;
        }
        Ok(())
    }

    /// Stop every started service, even when some of them fail.
    pub async fn stop(&mut self, token: CancellationToken) -> Result<(), HostingError> {
        let mut failures: Vec<BoxError> = Vec::new();
        for service in &self.services[..self.started] {
            if let Err(err) = service.stop(token.clone()).await {
                tracing::error!(
                    target: HOST_TARGET,
                    event_id = event_ids::HOSTED_SERVICE_STOP_EXCEPTION,
                    service = service.name(),
                    error = %err,
                    "An error occurred stopping the hosted service"
                );
                failures.push(err);
            }
        }
        self.started = 0;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HostingError::Aggregate(failures))
        }
    }

    pub async fn dispose(&mut self) {
        for service in &self.services {
            service.dispose().await;
        }
    }
}

impl std::fmt::Debug for HostedServiceExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedServiceExecutor")
            .field("services", &self.services.len())
            .field("started", &self.started)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MessageError;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        fail_start: bool,
        fail_stop: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl HostedService for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn start(&self, _token: CancellationToken) -> Result<(), BoxError> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            if self.fail_start {
                return Err(Box::new(MessageError(format!("{} start", self.name))));
            }
            Ok(())
        }

        async fn stop(&self, _token: CancellationToken) -> Result<(), BoxError> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            if self.fail_stop {
                return Err(Box::new(MessageError(format!("{} stop", self.name))));
            }
            Ok(())
        }
    }

    fn recorder(
        name: &'static str,
        fail_start: bool,
        fail_stop: bool,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn HostedService> {
        Arc::new(Recorder {
            name,
            fail_start,
            fail_stop,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn test_stop_failures_are_aggregated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut executor = HostedServiceExecutor::new(vec![
            recorder("one", false, true, &log),
            recorder("two", false, false, &log),
            recorder("three", false, true, &log),
        ]);

        executor.start(CancellationToken::new()).await.unwrap();
        let err = executor.stop(CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.inner_errors(), vec!["one stop", "three stop"]);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start one", "start two", "start three", "stop one", "stop two", "stop three"]
        );
    }

    #[tokio::test]
    async fn test_failed_start_only_stops_started_services() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut executor = HostedServiceExecutor::new(vec![
            recorder("one", false, false, &log),
            recorder("two", true, false, &log),
            recorder("three", false, false, &log),
        ]);

        let err = executor.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, HostingError::HostedServiceStart { ref name, .. } if name == "two"));

        executor.stop(CancellationToken::new()).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start one", "start two", "stop one"]
        );
    }

    #[tokio::test]
    async fn test_stop_without_start_touches_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut executor = HostedServiceExecutor::new(vec![recorder("one", false, false, &log)]);

        executor.stop(CancellationToken::new()).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }
}
