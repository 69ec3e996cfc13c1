//! The request delegate and the per-request control flow around it.
//!
//! ```text
//! transport
//!   → HostingApplication::create_context   (trace id, begin_request)
//!     → HostingApplication::process_request (axum Router, panics caught)
//!   → HostingApplication::dispose_context  (request_end, context_disposed, reset)
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{MatchedPath, Request};
use axum::handler::Handler;
use axum::http::{Response, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::MethodRouter;
use axum::Extension;
use futures_util::FutureExt;
use tower::ServiceExt;
use tracing::Instrument;

use crate::builder::Services;
use crate::context::{
    HostingContext, ReachedPipelineEnd, RequestIdentifier, RouteDiagnostics, next_trace_identifier,
};
use crate::diagnostics::HostingApplicationDiagnostics;
use crate::environment::HostingEnvironment;
use crate::error::{BoxError, RequestError};

// ═══════════════════════════════════════════════════════════════════
// HostingApplication
// ═══════════════════════════════════════════════════════════════════

/// The built request pipeline plus its diagnostics.
#[derive(Debug, Clone)]
pub struct HostingApplication {
    router: Router,
    diagnostics: HostingApplicationDiagnostics,
}

impl HostingApplication {
    pub fn new(router: Router, diagnostics: HostingApplicationDiagnostics) -> Self {
        HostingApplication {
            router,
            diagnostics,
        }
    }

    pub fn diagnostics(&self) -> &HostingApplicationDiagnostics {
        &self.diagnostics
    }

    /// Take over a pooled context (or a fresh one) for `request` and begin
    /// diagnostics.
    pub fn create_context(
        &self,
        request: Request,
        pooled: Option<HostingContext>,
    ) -> (HostingContext, Request) {
        let mut context = pooled.unwrap_or_default();
        let (mut parts, body) = request.into_parts();

        let trace_identifier = next_trace_identifier();
        context.http_context.initialize(&parts, &trace_identifier);
        parts
            .extensions
            .insert(RequestIdentifier(trace_identifier));

        self.diagnostics
            .begin_request(&mut context, &mut parts.extensions);
        (context, Request::from_parts(parts, body))
    }

    /// Run the request through the pipeline.
    ///
    /// A panicking handler comes back as `Err`; the transport decides what
    /// the client sees.
    pub async fn process_request(
        &self,
        context: &mut HostingContext,
        request: Request,
    ) -> Result<Response<Body>, RequestError> {
        let span = context.scope.clone().unwrap_or_else(tracing::Span::none);
        let outcome = AssertUnwindSafe(self.router.clone().oneshot(request))
            .catch_unwind()
            .instrument(span)
            .await;

        match outcome {
            Ok(Ok(response)) => {
                context.http_context.set_response(&response);
                Ok(response)
            }
            Ok(Err(infallible)) => match infallible {},
            Err(payload) => {
                context.http_context.set_failed();
                Err(RequestError::from_panic(payload.as_ref()))
            }
        }
    }

    /// End diagnostics and hand the context back for pooling.
    pub fn dispose_context(
        &self,
        mut context: HostingContext,
        error: Option<&RequestError>,
    ) -> HostingContext {
        self.diagnostics.request_end(&mut context, error);
        self.diagnostics.context_disposed(&context);
        context.reset();
        context
    }

    /// End diagnostics for a request whose future was dropped before it
    /// produced a response, e.g. on client disconnect or a forced shutdown.
    pub fn abort_context(&self, mut context: HostingContext) -> HostingContext {
        context.http_context.set_failed();
        let error = RequestError::new(
            ABORTED_ERROR_TYPE,
            "The request was aborted before a response was produced",
        );
        self.dispose_context(context, Some(&error))
    }
}

/// `error.type` reported for requests dropped mid-flight.
pub const ABORTED_ERROR_TYPE: &str = "aborted";

/// One pooled [`HostingContext`], owned by a connection.
///
/// Requests on a connection run one at a time, so the slot is either empty
/// (a request owns the context) or holds an idle, reset context.
#[derive(Debug, Default)]
pub struct ContextSlot {
    context: Option<HostingContext>,
}

impl ContextSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> Option<HostingContext> {
        self.context.take()
    }

    pub fn put(&mut self, context: HostingContext) {
        self.context = Some(context);
    }

    pub fn is_empty(&self) -> bool {
        self.context.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════
// Pipeline building
// ═══════════════════════════════════════════════════════════════════

/// Builds the request pipeline inside a `configure` callback.
///
/// ```rust,ignore
/// WebHostBuilder::new().configure(|app| {
///     app.route("/", get(|| async { "hello" }))
///         .nest("/api", api_router());
///     Ok(())
/// });
/// ```
pub struct ApplicationBuilder {
    router: Router,
    has_fallback: bool,
    services: Arc<Services>,
    environment: Arc<HostingEnvironment>,
}

impl ApplicationBuilder {
    pub fn new(services: Arc<Services>, environment: Arc<HostingEnvironment>) -> Self {
        ApplicationBuilder {
            router: Router::new(),
            has_fallback: false,
            services,
            environment,
        }
    }

    /// Values registered by `configure_services`.
    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn environment(&self) -> &HostingEnvironment {
        &self.environment
    }

    pub fn route(&mut self, path: &str, method_router: MethodRouter) -> &mut Self {
        self.map_router(|router| router.route(path, method_router))
    }

    pub fn nest(&mut self, path: &str, router: Router) -> &mut Self {
        self.map_router(|outer| outer.nest(path, router))
    }

    pub fn merge(&mut self, router: Router) -> &mut Self {
        self.map_router(|outer| outer.merge(router))
    }

    /// Replace the terminal 404 handler.
    pub fn fallback<H, T>(&mut self, handler: H) -> &mut Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.has_fallback = true;
        self.map_router(|router| router.fallback(handler))
    }

    /// Apply any `Router` transformation, typically `.layer(..)`.
    pub fn map_router<F>(&mut self, f: F) -> &mut Self
    where
        F: FnOnce(Router) -> Router,
    {
        let router = std::mem::take(&mut self.router);
        self.router = f(router);
        self
    }

    pub(crate) fn build(self) -> Router {
        let mut router = self.router;
        if !self.has_fallback {
            router = router.fallback(pipeline_end);
        }
        router.layer(middleware::from_fn(record_route))
    }
}

impl std::fmt::Debug for ApplicationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationBuilder")
            .field("has_fallback", &self.has_fallback)
            .field("environment", &self.environment.environment_name)
            .finish()
    }
}

/// Terminal handler: nothing in the application handled the request.
async fn pipeline_end() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Extension(ReachedPipelineEnd))
}

/// Copy the matched route template onto the response for diagnostics.
async fn record_route(request: Request, next: Next) -> Response<Body> {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned());
    let mut response = next.run(request).await;
    if let Some(route) = route {
        response.extensions_mut().insert(RouteDiagnostics(route));
    }
    response
}

/// A pipeline configuration step.
pub type ConfigureFn = Box<dyn FnOnce(&mut ApplicationBuilder) -> Result<(), BoxError> + Send>;

/// Wraps the application's configure step, typically to add middleware in
/// front of or behind it.
///
/// Filters compose so that the first registered filter runs outermost.
pub trait StartupFilter: Send + Sync {
    fn configure(&self, next: ConfigureFn) -> ConfigureFn;
}

impl<F> StartupFilter for F
where
    F: Fn(ConfigureFn) -> ConfigureFn + Send + Sync,
{
    fn configure(&self, next: ConfigureFn) -> ConfigureFn {
        self(next)
    }
}

/// Run `configure` wrapped in every filter and return the finished router.
pub(crate) fn build_pipeline(
    mut builder: ApplicationBuilder,
    filters: &[Arc<dyn StartupFilter>],
    configure: ConfigureFn,
) -> Result<Router, BoxError> {
    let configure = filters
        .iter()
        .rev()
        .fold(configure, |next, filter| filter.configure(next));
    configure(&mut builder)?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HttpContext;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use std::sync::Mutex;

    fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new(
            Arc::new(Services::default()),
            Arc::new(HostingEnvironment::default()),
        )
    }

    fn application(router: Router) -> HostingApplication {
        HostingApplication::new(router, HostingApplicationDiagnostics::default())
    }

    async fn exchange(app: &HostingApplication, uri: &str) -> (HttpContext, Option<RequestError>) {
        let request = HttpRequest::get(uri).body(Body::empty()).unwrap();
        let (mut context, request) = app.create_context(request, None);
        let error = app.process_request(&mut context, request).await.err();
        let snapshot = context.http_context.clone();
        app.dispose_context(context, error.as_ref());
        (snapshot, error)
    }

    async fn explode() -> &'static str {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn test_unmatched_request_reaches_pipeline_end() {
        let mut app = builder();
        app.route("/users/{id}", get(|| async { "user" }));
        let app = application(app.build());

        let (context, error) = exchange(&app, "/nothing").await;
        assert!(error.is_none());
        assert_eq!(context.response.status, StatusCode::NOT_FOUND);
        assert!(context.response.reached_pipeline_end);

        let (context, _) = exchange(&app, "/users/7").await;
        assert_eq!(context.response.status, StatusCode::OK);
        assert_eq!(context.response.route.as_deref(), Some("/users/{id}"));
        assert!(!context.response.reached_pipeline_end);
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_request_error() {
        let mut app = builder();
        app.route("/boom", get(explode));
        let app = application(app.build());

        let (context, error) = exchange(&app, "/boom").await;
        let error = error.unwrap();
        assert_eq!(error.type_name, "panic");
        assert_eq!(error.message, "handler exploded");
        assert_eq!(context.response.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_handlers_see_the_request_identifier() {
        let mut app = builder();
        app.route(
            "/id",
            get(|Extension(id): Extension<RequestIdentifier>| async move { id.0 }),
        );
        let app = application(app.build());

        let (context, _) = exchange(&app, "/id").await;
        assert_eq!(context.trace_identifier.len(), 13);
    }

    #[test]
    fn test_first_registered_filter_runs_outermost() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let filter = |name: &'static str| -> Arc<dyn StartupFilter> {
            let order = order.clone();
            Arc::new(move |next: ConfigureFn| -> ConfigureFn {
                let order = order.clone();
                Box::new(move |app: &mut ApplicationBuilder| -> Result<(), BoxError> {
                    order.lock().unwrap().push(format!("{name} before"));
                    next(app)?;
                    order.lock().unwrap().push(format!("{name} after"));
                    Ok(())
                })
            })
        };
        let filters = vec![filter("first"), filter("second")];

        let inner = order.clone();
        build_pipeline(
            builder(),
            &filters,
            Box::new(move |_app: &mut ApplicationBuilder| -> Result<(), BoxError> {
                inner.lock().unwrap().push("configure".to_owned());
                Ok(())
            }),
        )
        .unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec![
                "first before",
                "second before",
                "configure",
                "second after",
                "first after"
            ]
        );
    }
}
