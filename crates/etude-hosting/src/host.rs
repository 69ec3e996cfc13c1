//! The web host: starts the pipeline, hosted services and server in order
//! and tears them down again.

use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::application::{ApplicationBuilder, ConfigureFn, HostingApplication, build_pipeline};
use crate::builder::Services;
use crate::config::WebHostOptions;
use crate::diagnostics::HostingApplicationDiagnostics;
use crate::environment::HostingEnvironment;
use crate::error::{BoxError, HostingError, MessageError};
use crate::error_page;
use crate::hosted::HostedServiceExecutor;
use crate::lifetime::ApplicationLifetime;
use crate::logging::{HOST_TARGET, event_ids};
use crate::server::Server;

/// A configured web application, ready to start.
///
/// Built by [`WebHostBuilder`](crate::WebHostBuilder).
pub struct WebHost {
    options: WebHostOptions,
    environment: Arc<HostingEnvironment>,
    services: Arc<Services>,
    server: Option<Box<dyn Server>>,
    configure: Option<ConfigureFn>,
    /// A failure captured while building, shown as the error page.
    startup_error: Option<BoxError>,
    /// The pipeline, kept once built so a failed start can be retried.
    router: Option<Router>,
    diagnostics: HostingApplicationDiagnostics,
    lifetime: ApplicationLifetime,
    hosted: HostedServiceExecutor,
    application: Option<Arc<HostingApplication>>,
    stopped: bool,
    disposed: bool,
}

impl WebHost {
    pub(crate) fn new(
        options: WebHostOptions,
        environment: Arc<HostingEnvironment>,
        services: Arc<Services>,
        server: Option<Box<dyn Server>>,
        configure: Option<ConfigureFn>,
        startup_error: Option<BoxError>,
        diagnostics: HostingApplicationDiagnostics,
    ) -> Self {
        let hosted = HostedServiceExecutor::new(services.hosted_services().to_vec());
        WebHost {
            options,
            environment,
            services,
            server,
            configure,
            startup_error,
            router: None,
            diagnostics,
            lifetime: ApplicationLifetime::new(),
            hosted,
            application: None,
            stopped: false,
            disposed: false,
        }
    }

    pub fn lifetime(&self) -> &ApplicationLifetime {
        &self.lifetime
    }

    pub fn environment(&self) -> &HostingEnvironment {
        &self.environment
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn options(&self) -> &WebHostOptions {
        &self.options
    }

    /// The server's addresses: configured urls before start, bound
    /// addresses after.
    pub fn server_addresses(&self) -> Vec<String> {
        self.server
            .as_ref()
            .map(|server| server.features().addresses.addresses.clone())
            .unwrap_or_default()
    }

    pub async fn start(&mut self) -> Result<(), HostingError> {
        self.start_with_token(CancellationToken::new()).await
    }

    /// Build the pipeline, start hosted services, then the server, then
    /// signal `application_started`.
    pub async fn start_with_token(&mut self, token: CancellationToken) -> Result<(), HostingError> {
        if self.server.is_none() {
            return Err(HostingError::NoServer);
        }
        if self.application.is_some() {
            return Ok(());
        }

        tracing::debug!(
            target: HOST_TARGET,
            event_id = event_ids::STARTING,
            "Hosting starting"
        );
        self.diagnostics.event_source().host_start();

        let router = match self.router.clone() {
            Some(router) => router,
            None => {
                let router = self.build_application()?;
                self.router = Some(router.clone());
                router
            }
        };
        let application = Arc::new(HostingApplication::new(router, self.diagnostics.clone()));

        self.hosted.start(token.clone()).await?;

        let server = self.server.as_mut().ok_or(HostingError::NoServer)?;
        let addresses = &mut server.features_mut().addresses;
        if addresses.addresses.is_empty() && !self.options.urls.is_empty() {
            addresses.addresses = self.options.urls.clone();
            addresses.prefer_hosting_urls = self.options.prefer_hosting_urls;
        }
        server
            .start(application.clone(), token)
            .await
            .map_err(HostingError::Startup)?;
        self.application = Some(application);

        self.lifetime.notify_started();
        tracing::debug!(
            target: HOST_TARGET,
            event_id = event_ids::STARTED,
            "Hosting started"
        );
        Ok(())
    }

    /// Run the configure callback through the startup filters. A failure
    /// becomes the error page when startup errors are captured.
    fn build_application(&mut self) -> Result<Router, HostingError> {
        let built = match (self.startup_error.take(), self.configure.take()) {
            (Some(err), _) => Err(err),
            (None, Some(configure)) => {
                let builder = ApplicationBuilder::new(self.services.clone(), self.environment.clone());
                build_pipeline(builder, self.services.startup_filters(), configure)
            }
            (None, None) => Err(Box::new(MessageError(
                "No application configured. Call configure() on the WebHostBuilder.".to_owned(),
            )) as BoxError),
        };

        match built {
            Ok(router) => Ok(router),
            Err(err) => {
                tracing::error!(
                    target: HOST_TARGET,
                    event_id = event_ids::APPLICATION_STARTUP_EXCEPTION,
                    error = %err,
                    "Application startup exception"
                );
                if !self.options.capture_startup_errors {
                    // The configure callback is spent; a retried start
                    // reports the same failure.
                    self.startup_error = Some(Box::new(MessageError(err.to_string())));
                    return Err(HostingError::Startup(err));
                }
                println!("Application startup exception: {err}");
                let detailed = self.options.detailed_errors || self.environment.is_development();
                Ok(error_page::router(&err, detailed))
            }
        }
    }

    /// Stop the server and hosted services. A second call does nothing.
    ///
    /// `token` is combined with the shutdown timeout; whichever fires first
    /// cuts the graceful phase short.
    pub async fn stop(&mut self, token: CancellationToken) -> Result<(), HostingError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let token = token.child_token();
        let timer = {
            let token = token.clone();
            let timeout = self.options.shutdown_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        };

        self.lifetime.stop_application();

        if let (Some(_), Some(server)) = (self.application.as_ref(), self.server.as_mut()) {
            if let Err(err) = server.stop(token.clone()).await {
                tracing::error!(
                    target: HOST_TARGET,
                    event_id = event_ids::SERVER_SHUTDOWN_EXCEPTION,
                    error = %err,
                    "Server shutdown exception"
                );
            }
        }

        let result = self.hosted.stop(token).await;
        timer.abort();

        self.lifetime.notify_stopped();
        tracing::debug!(
            target: HOST_TARGET,
            event_id = event_ids::SHUTDOWN,
            "Hosting shutdown"
        );
        self.diagnostics.event_source().host_stop();
        result
    }

    /// Stop if still running, then release the server, hosted services and
    /// registered disposables.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if !self.stopped {
            if let Err(err) = self.stop(CancellationToken::new()).await {
                tracing::error!(
                    target: HOST_TARGET,
                    error = %err,
                    "An error occurred stopping the host during disposal"
                );
            }
        }
        if let Some(server) = self.server.as_mut() {
            server.dispose().await;
        }
        self.hosted.dispose().await;
        self.services.dispose().await;
    }

    /// Run until SIGINT, SIGQUIT or SIGTERM (Ctrl+C elsewhere), or until
    /// the application requests a stop.
    pub async fn run(self) -> Result<(), HostingError> {
        let token = CancellationToken::new();
        let signals = {
            let token = token.clone();
            tokio::spawn(async move {
                match shutdown_signal().await {
                    Ok(()) => token.cancel(),
                    Err(e) => tracing::warn!(
                        target: HOST_TARGET,
                        "Failed to install shutdown signal handlers: {}",
                        e
                    ),
                }
            })
        };
        let result = self.run_until(token).await;
        signals.abort();
        result
    }

    /// Run until `token` fires or the application requests a stop.
    pub async fn run_until(mut self, token: CancellationToken) -> Result<(), HostingError> {
        if let Err(err) = self.start_with_token(token.clone()).await {
            self.dispose().await;
            return Err(err);
        }

        let suppress = self.options.suppress_status_messages;
        if !suppress {
            println!("Hosting environment: {}", self.environment.environment_name);
            println!("Content root path: {}", self.environment.content_root.display());
            for address in self.server_addresses() {
                println!("Now listening on: {address}");
            }
            println!("Application started. Press Ctrl+C to shut down.");
        }

        let stopping = self.lifetime.application_stopping().token();
        tokio::select! {
            _ = token.cancelled() => {}
            _ = stopping.cancelled() => {}
        }
        if !suppress {
            println!("Application is shutting down...");
        }

        let result = self.stop(CancellationToken::new()).await;
        self.dispose().await;
        result
    }
}

impl std::fmt::Debug for WebHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebHost")
            .field("environment", &self.environment.environment_name)
            .field("started", &self.application.is_some())
            .field("stopped", &self.stopped)
            .field("hosted", &self.hosted)
            .finish()
    }
}

/// Resolves on the first SIGINT, SIGQUIT or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = quit.recv() => {}
        _ = terminate.recv() => {}
    }
    tracing::info!(target: HOST_TARGET, "Shutdown signal received");
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!(target: HOST_TARGET, "Shutdown signal received");
    Ok(())
}
