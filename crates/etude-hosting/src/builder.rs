//! Host construction: settings, services, pipeline and collaborators.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::application::{ApplicationBuilder, ConfigureFn, StartupFilter};
use crate::config::{Configuration, WebHostDefaults, WebHostOptions};
use crate::diagnostics::HostingApplicationDiagnostics;
use crate::diagnostics::activity::ActivitySource;
use crate::diagnostics::event_source::HostingEventSource;
use crate::diagnostics::listener::DiagnosticListener;
use crate::diagnostics::metrics::{HostingMetrics, MetricsSink};
use crate::diagnostics::propagator::Propagator;
use crate::environment::HostingEnvironment;
use crate::error::{BoxError, HostingError};
use crate::host::WebHost;
use crate::hosted::HostedService;
use crate::logging::{HOST_TARGET, event_ids};
use crate::server::Server;

// ═══════════════════════════════════════════════════════════════════
// Services
// ═══════════════════════════════════════════════════════════════════

/// Something that releases resources asynchronously when the host is
/// disposed.
#[async_trait]
pub trait AsyncDisposable: Send + Sync {
    async fn dispose(&self);
}

/// Everything registered by `configure_services`.
#[derive(Default)]
pub struct Services {
    hosted_services: Vec<Arc<dyn HostedService>>,
    startup_filters: Vec<Arc<dyn StartupFilter>>,
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    disposables: Vec<Arc<dyn AsyncDisposable>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hosted_service<S>(&mut self, service: S) -> &mut Self
    where
        S: HostedService + 'static,
    {
        self.hosted_services.push(Arc::new(service));
        self
    }

    pub fn add_startup_filter<F>(&mut self, filter: F) -> &mut Self
    where
        F: StartupFilter + 'static,
    {
        self.startup_filters.push(Arc::new(filter));
        self
    }

    /// Register a shared value, replacing any earlier value of the same type.
    pub fn insert<T>(&mut self, value: T) -> &mut Self
    where
        T: Send + Sync + 'static,
    {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.values
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn contains<T>(&self) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.values.contains_key(&TypeId::of::<T>())
    }

    /// Disposed in reverse registration order by [`WebHost::dispose`].
    pub fn add_disposable<D>(&mut self, disposable: D) -> &mut Self
    where
        D: AsyncDisposable + 'static,
    {
        self.disposables.push(Arc::new(disposable));
        self
    }

    pub fn hosted_services(&self) -> &[Arc<dyn HostedService>] {
        &self.hosted_services
    }

    pub fn startup_filters(&self) -> &[Arc<dyn StartupFilter>] {
        &self.startup_filters
    }

    pub(crate) async fn dispose(&self) {
        for disposable in self.disposables.iter().rev() {
            disposable.dispose().await;
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("hosted_services", &self.hosted_services.len())
            .field("startup_filters", &self.startup_filters.len())
            .field("values", &self.values.len())
            .field("disposables", &self.disposables.len())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════
// Hosting startups
// ═══════════════════════════════════════════════════════════════════

/// A unit of host configuration contributed by a library.
///
/// Startups run inside [`WebHostBuilder::build`] in registration order,
/// unless `preventHostingStartup` is set.
pub trait HostingStartup: Send {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn configure(&self, builder: &mut StartupBuilder<'_>) -> Result<(), BoxError>;
}

/// What a [`HostingStartup`] may change on the builder it runs against.
pub struct StartupBuilder<'a> {
    builder: &'a mut WebHostBuilder,
}

impl StartupBuilder<'_> {
    /// Current value of a setting, direct settings first.
    pub fn get_setting(&self, key: &str) -> Option<&str> {
        self.builder.get_setting(key)
    }

    pub fn use_setting(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.builder.settings.set(key, value);
        self
    }

    pub fn configure_services<F>(&mut self, configure: F) -> &mut Self
    where
        F: FnOnce(&mut Services, &HostingEnvironment) -> Result<(), BoxError> + Send + 'static,
    {
        self.builder.configure_services.push(Box::new(configure));
        self
    }

    pub fn add_startup_filter<F>(&mut self, filter: F) -> &mut Self
    where
        F: StartupFilter + 'static,
    {
        self.builder.startup_filters.push(Arc::new(filter));
        self
    }

    pub fn add_hosted_service<S>(&mut self, service: S) -> &mut Self
    where
        S: HostedService + 'static,
    {
        self.builder.hosted_services.push(Arc::new(service));
        self
    }
}

// ═══════════════════════════════════════════════════════════════════
// WebHostBuilder
// ═══════════════════════════════════════════════════════════════════

type ConfigureServicesFn =
    Box<dyn FnOnce(&mut Services, &HostingEnvironment) -> Result<(), BoxError> + Send>;

/// Builder for a [`WebHost`].
///
/// Settings given directly (`use_setting` and the `use_*` shortcuts) win
/// over `ASPNETCORE_`-prefixed environment variables.
///
/// ```rust,no_run
/// use axum::routing::get;
/// use etude_hosting::{HyperServer, WebHostBuilder};
///
/// # async fn run() -> Result<(), etude_hosting::HostingError> {
/// let host = WebHostBuilder::new()
///     .use_server(HyperServer::new())
///     .use_urls(["http://localhost:8080"])
///     .configure(|app| {
///         app.route("/", get(|| async { "hello" }));
///         Ok(())
///     })
///     .build()?;
/// host.run().await
/// # }
/// ```
pub struct WebHostBuilder {
    settings: Configuration,
    environment_settings: Configuration,
    server: Option<Box<dyn Server>>,
    configure_services: Vec<ConfigureServicesFn>,
    configure: Option<ConfigureFn>,
    hosted_services: Vec<Arc<dyn HostedService>>,
    startup_filters: Vec<Arc<dyn StartupFilter>>,
    hosting_startups: Vec<Box<dyn HostingStartup>>,
    propagator: Option<Arc<dyn Propagator>>,
    diagnostic_listener: Option<Arc<dyn DiagnosticListener>>,
    activity_source: Option<Arc<ActivitySource>>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
    event_source: Option<Arc<HostingEventSource>>,
}

impl Default for WebHostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WebHostBuilder {
    /// A builder reading `ASPNETCORE_*` variables (and `.env`) as fallback
    /// settings.
    pub fn new() -> Self {
        Self::with_environment_settings(Configuration::from_env())
    }

    /// A builder over an explicit fallback configuration instead of the
    /// process environment.
    pub fn with_environment_settings(environment_settings: Configuration) -> Self {
        WebHostBuilder {
            settings: Configuration::new(),
            environment_settings,
            server: None,
            configure_services: Vec::new(),
            configure: None,
            hosted_services: Vec::new(),
            startup_filters: Vec::new(),
            hosting_startups: Vec::new(),
            propagator: None,
            diagnostic_listener: None,
            activity_source: None,
            metrics_sink: None,
            event_source: None,
        }
    }

    /// Current value of a setting, direct settings first.
    pub fn get_setting(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .or_else(|| self.environment_settings.get(key))
    }

    pub fn use_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.set(key, value);
        self
    }

    /// Copy every key of `configuration` into the direct settings.
    pub fn use_configuration(mut self, configuration: &Configuration) -> Self {
        self.settings.merge(configuration);
        self
    }

    pub fn use_server<S>(mut self, server: S) -> Self
    where
        S: Server + 'static,
    {
        self.server = Some(Box::new(server));
        self
    }

    /// Addresses the server should listen on.
    pub fn use_urls<I, S>(self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = urls
            .into_iter()
            .map(|url| url.as_ref().to_owned())
            .collect::<Vec<_>>()
            .join(";");
        self.use_setting(WebHostDefaults::SERVER_URLS_KEY, joined)
    }

    pub fn use_environment(self, environment: impl Into<String>) -> Self {
        self.use_setting(WebHostDefaults::ENVIRONMENT_KEY, environment)
    }

    pub fn use_content_root(self, content_root: impl AsRef<Path>) -> Self {
        let root = content_root.as_ref().to_string_lossy().into_owned();
        self.use_setting(WebHostDefaults::CONTENT_ROOT_KEY, root)
    }

    pub fn use_web_root(self, web_root: impl AsRef<Path>) -> Self {
        let root = web_root.as_ref().to_string_lossy().into_owned();
        self.use_setting(WebHostDefaults::WEB_ROOT_KEY, root)
    }

    pub fn capture_startup_errors(self, capture: bool) -> Self {
        self.use_setting(WebHostDefaults::CAPTURE_STARTUP_ERRORS_KEY, capture.to_string())
    }

    pub fn detailed_errors(self, detailed: bool) -> Self {
        self.use_setting(WebHostDefaults::DETAILED_ERRORS_KEY, detailed.to_string())
    }

    pub fn prefer_hosting_urls(self, prefer: bool) -> Self {
        self.use_setting(WebHostDefaults::PREFER_HOSTING_URLS_KEY, prefer.to_string())
    }

    pub fn suppress_status_messages(self, suppress: bool) -> Self {
        self.use_setting(WebHostDefaults::SUPPRESS_STATUS_MESSAGES_KEY, suppress.to_string())
    }

    /// Time allowed for a graceful stop. Whole seconds.
    pub fn use_shutdown_timeout(self, timeout: Duration) -> Self {
        self.use_setting(
            WebHostDefaults::SHUTDOWN_TIMEOUT_KEY,
            timeout.as_secs().to_string(),
        )
    }

    /// Register services. Callbacks run in order during `build`.
    pub fn configure_services<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(&mut Services, &HostingEnvironment) -> Result<(), BoxError> + Send + 'static,
    {
        self.configure_services.push(Box::new(configure));
        self
    }

    /// Build the request pipeline. Runs when the host starts; a later call
    /// replaces an earlier one.
    pub fn configure<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(&mut ApplicationBuilder) -> Result<(), BoxError> + Send + 'static,
    {
        self.configure = Some(Box::new(configure));
        self
    }

    pub fn add_startup_filter<F>(mut self, filter: F) -> Self
    where
        F: StartupFilter + 'static,
    {
        self.startup_filters.push(Arc::new(filter));
        self
    }

    pub fn add_hosted_service<S>(mut self, service: S) -> Self
    where
        S: HostedService + 'static,
    {
        self.hosted_services.push(Arc::new(service));
        self
    }

    pub fn use_hosting_startup<H>(mut self, startup: H) -> Self
    where
        H: HostingStartup + 'static,
    {
        self.hosting_startups.push(Box::new(startup));
        self
    }

    pub fn use_propagator<P>(mut self, propagator: P) -> Self
    where
        P: Propagator + 'static,
    {
        self.propagator = Some(Arc::new(propagator));
        self
    }

    pub fn use_diagnostic_listener<L>(mut self, listener: L) -> Self
    where
        L: DiagnosticListener + 'static,
    {
        self.diagnostic_listener = Some(Arc::new(listener));
        self
    }

    pub fn use_activity_source(mut self, source: ActivitySource) -> Self {
        self.activity_source = Some(Arc::new(source));
        self
    }

    pub fn use_metrics_sink<M>(mut self, sink: M) -> Self
    where
        M: MetricsSink + 'static,
    {
        self.metrics_sink = Some(Arc::new(sink));
        self
    }

    pub fn use_event_source(mut self, source: Arc<HostingEventSource>) -> Self {
        self.event_source = Some(source);
        self
    }

    fn options(&self) -> WebHostOptions {
        WebHostOptions::new(&self.settings, Some(&self.environment_settings))
    }

    /// Run hosting startups and service registration, and assemble the host.
    ///
    /// With `captureStartupErrors` set, failures are kept and reported by
    /// an error page once the host starts; otherwise they fail the build.
    pub fn build(mut self) -> Result<WebHost, HostingError> {
        let mut startup_failures: Vec<BoxError> = Vec::new();
        if !self.options().prevent_hosting_startup {
            for startup in std::mem::take(&mut self.hosting_startups) {
                let mut handle = StartupBuilder {
                    builder: &mut self,
                };
                match startup.configure(&mut handle) {
                    Ok(()) => tracing::debug!(
                        target: HOST_TARGET,
                        event_id = event_ids::HOSTING_STARTUP_ASSEMBLY_LOADED,
                        startup = startup.name(),
                        "Loaded hosting startup {}",
                        startup.name()
                    ),
                    Err(err) => {
                        tracing::error!(
                            target: HOST_TARGET,
                            event_id = event_ids::HOSTING_STARTUP_ASSEMBLY_EXCEPTION,
                            startup = startup.name(),
                            error = %err,
                            "Hosting startup {} failed to execute",
                            startup.name()
                        );
                        startup_failures.push(err);
                    }
                }
            }
        }

        let options = self.options();
        let mut startup_error: Option<BoxError> = None;
        if !startup_failures.is_empty() {
            let failure = HostingError::HostingStartup(startup_failures);
            if !options.capture_startup_errors {
                return Err(failure);
            }
            startup_error = Some(Box::new(failure));
        }

        let environment = Arc::new(HostingEnvironment::from_options(&options));
        let mut services = Services::new();
        services.hosted_services.extend(self.hosted_services);
        services.startup_filters.extend(self.startup_filters);
        for configure in self.configure_services {
            if let Err(err) = configure(&mut services, &environment) {
                if !options.capture_startup_errors {
                    return Err(HostingError::Startup(err));
                }
                startup_error.get_or_insert(err);
                break;
            }
        }

        let diagnostics = HostingApplicationDiagnostics::new(
            self.diagnostic_listener
                .unwrap_or_else(|| Arc::new(crate::diagnostics::listener::NullDiagnosticListener)),
            self.activity_source.unwrap_or_else(|| {
                Arc::new(ActivitySource::new(crate::diagnostics::ACTIVITY_SOURCE_NAME))
            }),
            self.propagator
                .unwrap_or_else(|| Arc::new(crate::diagnostics::propagator::TraceContextPropagator)),
            self.event_source
                .unwrap_or_else(|| Arc::new(HostingEventSource::new())),
            self.metrics_sink
                .map(HostingMetrics::new)
                .unwrap_or_default(),
        );

        Ok(WebHost::new(
            options,
            environment,
            Arc::new(services),
            self.server,
            self.configure,
            startup_error,
            diagnostics,
        ))
    }
}

impl std::fmt::Debug for WebHostBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebHostBuilder")
            .field("settings", &self.settings)
            .field("has_server", &self.server.is_some())
            .field("hosting_startups", &self.hosting_startups.len())
            .finish()
    }
}
