//! Request begin/end instrumentation.
//!
//! Every observer kind has its own cheap gate, checked once per request:
//! the event source counters, the diagnostic listener, `tracing` at error
//! level, the activity source and the metrics sink. Work for an observer is
//! only done when its gate is open.

pub mod activity;
pub mod event_source;
pub mod listener;
pub mod log;
pub mod metrics;
pub mod propagator;

use std::sync::{Arc, LazyLock};
use std::time::Instant;

use axum::http::Extensions;
use tracing::Level;

use self::activity::{Activity, ActivityContext, ActivityKind, ActivitySource};
use self::event_source::HostingEventSource;
use self::listener::{
    ACTIVITY_NAME, ACTIVITY_START_KEY, ACTIVITY_STOP_KEY, BEGIN_REQUEST_KEY, DiagnosticEvent,
    DiagnosticListener, END_REQUEST_KEY, NullDiagnosticListener, UNHANDLED_EXCEPTION_KEY,
};
use self::log::{HostingRequestFinishedLog, HostingRequestStartingLog};
use self::metrics::{HostingMetrics, RequestOutcome};
use self::propagator::{Propagator, TraceContextPropagator};
use crate::context::HostingContext;
use crate::error::RequestError;
use crate::logging::{DIAGNOSTICS_TARGET, event_ids};

/// Name of the activity source requests are traced under.
pub const ACTIVITY_SOURCE_NAME: &str = "etude.hosting";

static ANCHOR: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Monotonic nanoseconds since the first call, plus one so that 0 can mean
/// "not tracked".
pub fn timestamp() -> u64 {
    ANCHOR.elapsed().as_nanos() as u64 + 1
}

fn elapsed_between(start: u64, end: u64) -> f64 {
    end.saturating_sub(start) as f64 / 1_000_000_000.0
}

/// The begin/end hooks and the observers they feed.
#[derive(Clone)]
pub struct HostingApplicationDiagnostics {
    diagnostic_listener: Arc<dyn DiagnosticListener>,
    activity_source: Arc<ActivitySource>,
    propagator: Arc<dyn Propagator>,
    event_source: Arc<HostingEventSource>,
    metrics: HostingMetrics,
}

impl Default for HostingApplicationDiagnostics {
    fn default() -> Self {
        HostingApplicationDiagnostics {
            diagnostic_listener: Arc::new(NullDiagnosticListener),
            activity_source: Arc::new(ActivitySource::new(ACTIVITY_SOURCE_NAME)),
            propagator: Arc::new(TraceContextPropagator),
            event_source: Arc::new(HostingEventSource::new()),
            metrics: HostingMetrics::default(),
        }
    }
}

impl HostingApplicationDiagnostics {
    pub fn new(
        diagnostic_listener: Arc<dyn DiagnosticListener>,
        activity_source: Arc<ActivitySource>,
        propagator: Arc<dyn Propagator>,
        event_source: Arc<HostingEventSource>,
        metrics: HostingMetrics,
    ) -> Self {
        HostingApplicationDiagnostics {
            diagnostic_listener,
            activity_source,
            propagator,
            event_source,
            metrics,
        }
    }

    pub fn event_source(&self) -> &Arc<HostingEventSource> {
        &self.event_source
    }

    pub fn activity_source(&self) -> &Arc<ActivitySource> {
        &self.activity_source
    }

    /// Start instrumenting a request. `extensions` are the request's, so
    /// handlers can reach the metrics tags feature.
    pub fn begin_request(&self, context: &mut HostingContext, extensions: &mut Extensions) {
        let mut start_timestamp = 0;

        if self.metrics.is_enabled() {
            context.metrics_enabled = true;
            let request = &context.http_context.request;
            let feature =
                self.metrics
                    .request_start(&request.scheme, &request.method, &request.protocol);
            extensions.insert(feature.clone());
            context.metrics_tags = Some(feature);
            start_timestamp = timestamp();
        }

        if self.event_source.is_enabled() {
            context.event_log_enabled = true;
            let request = &context.http_context.request;
            self.event_source
                .request_start(request.method.as_str(), &request.path);
        }

        let listener = &self.diagnostic_listener;
        let diagnostic_listener_enabled = listener.is_enabled();
        let logging_enabled = tracing::enabled!(target: DIAGNOSTICS_TARGET, Level::ERROR);

        if logging_enabled
            || (diagnostic_listener_enabled && listener.is_enabled_for(ACTIVITY_NAME))
            || self.activity_source.has_listeners()
        {
            context.activity = self.start_activity(
                context,
                logging_enabled || diagnostic_listener_enabled,
                diagnostic_listener_enabled,
            );
        }

        if diagnostic_listener_enabled && listener.is_enabled_for(BEGIN_REQUEST_KEY) {
            if start_timestamp == 0 {
                start_timestamp = timestamp();
            }
            listener.write(&DiagnosticEvent::BeginRequest {
                context: &context.http_context,
                timestamp: start_timestamp,
            });
        }

        if logging_enabled {
            let http = &context.http_context;
            let (trace_id, span_id) = context
                .activity
                .as_ref()
                .map(|activity| (activity.trace_id(), activity.span_id()))
                .unwrap_or_default();
            context.scope = Some(tracing::error_span!(
                target: DIAGNOSTICS_TARGET,
                "request",
                request_id = %http.trace_identifier,
                request_path = %http.request.path,
                trace_id,
                span_id,
            ));

            if tracing::enabled!(target: DIAGNOSTICS_TARGET, Level::INFO) {
                if start_timestamp == 0 {
                    start_timestamp = timestamp();
                }
                let starting = HostingRequestStartingLog::new(http);
                if let Some(scope) = context.scope.as_ref() {
                    scope.in_scope(|| {
                        tracing::info!(
                            target: DIAGNOSTICS_TARGET,
                            event_id = event_ids::REQUEST_STARTING,
                            protocol = %starting.protocol,
                            method = %starting.method,
                            path = %starting.path,
                            "{starting}"
                        )
                    });
                }
                context.starting_log = Some(starting);
            }
        }

        context.start_timestamp = start_timestamp;
    }

    /// Create, import and start the request activity.
    ///
    /// With `force`, an activity is synthesized even when no activity
    /// listener sampled one in.
    fn start_activity(
        &self,
        context: &mut HostingContext,
        force: bool,
        diagnostic_listener_enabled: bool,
    ) -> Option<Activity> {
        let headers = &context.http_context.request.headers;
        let (parent_id, trace_state) = self.propagator.extract_trace_id_and_state(headers);

        let parent = parent_id
            .as_deref()
            .and_then(|id| ActivityContext::try_parse(id, trace_state.as_deref(), true));
        let created = self.activity_source.create_activity(
            ACTIVITY_NAME,
            ActivityKind::Server,
            parent.as_ref(),
            if parent.is_none() { parent_id.as_deref() } else { None },
        );

        let mut activity = match created {
            Some(activity) => activity,
            None if force => {
                let mut activity = Activity::new(ACTIVITY_NAME).with_kind(ActivityKind::Server);
                if let Some(parent_id) = parent_id.as_deref() {
                    activity.set_parent_id(parent_id);
                }
                activity
            }
            None => return None,
        };

        if parent_id.is_some() {
            activity.set_trace_state(trace_state);
            if let Some(baggage) = self.propagator.extract_baggage(headers) {
                for (key, value) in baggage {
                    activity.add_baggage(key, value);
                }
            }
        }

        let listener = &self.diagnostic_listener;
        listener.on_activity_import(&mut activity, &context.http_context);

        activity.start();
        if diagnostic_listener_enabled && listener.is_enabled_for(ACTIVITY_START_KEY) {
            context.has_diagnostic_listener = true;
            listener.write(&DiagnosticEvent::ActivityStart {
                context: &context.http_context,
                activity: &activity,
            });
        }
        self.activity_source.notify_start(&activity);
        Some(activity)
    }

    /// Finish instrumenting a request. `error` is set when the application
    /// failed.
    pub fn request_end(&self, context: &mut HostingContext, error: Option<&RequestError>) {
        let mut current_timestamp = 0;
        if context.start_timestamp != 0 {
            current_timestamp = timestamp();
            let elapsed = elapsed_between(context.start_timestamp, current_timestamp);

            let scope = context
                .scope
                .as_ref()
                .filter(|_| tracing::enabled!(target: DIAGNOSTICS_TARGET, Level::INFO));
            if let Some(scope) = scope {
                let finished = HostingRequestFinishedLog::new(
                    &context.http_context,
                    context.starting_log.as_ref(),
                    elapsed * 1000.0,
                );
                scope.in_scope(|| {
                    tracing::info!(
                        target: DIAGNOSTICS_TARGET,
                        event_id = event_ids::REQUEST_FINISHED,
                        status_code = finished.status_code,
                        elapsed_ms = finished.elapsed_milliseconds,
                        "{finished}"
                    )
                });
            }
        }

        let response = &context.http_context.response;
        if let Some(feature) = context.metrics_tags.as_ref() {
            self.metrics.request_end(
                feature,
                &RequestOutcome {
                    status: response.status.as_u16(),
                    route: response.route.as_deref(),
                    error,
                    unhandled: response.reached_pipeline_end,
                    elapsed_seconds: (context.start_timestamp != 0)
                        .then(|| elapsed_between(context.start_timestamp, current_timestamp)),
                },
            );
        }

        if response.reached_pipeline_end && context.scope.is_some() {
            tracing::info!(
                target: DIAGNOSTICS_TARGET,
                event_id = event_ids::REQUEST_UNHANDLED,
                method = %context.http_context.request.method,
                path = %context.http_context.request.path,
                "Request reached the end of the middleware pipeline without being handled by application code. \
                 Request path: {} {}://{}{}{}, Response status code: {}",
                context.http_context.request.method,
                context.http_context.request.scheme,
                context.http_context.request.host,
                context.http_context.request.path_base,
                context.http_context.request.path,
                response.status.as_u16(),
            );
        }

        let listener = &self.diagnostic_listener;
        if listener.is_enabled() {
            if current_timestamp == 0 {
                current_timestamp = timestamp();
            }
            match error {
                None if listener.is_enabled_for(END_REQUEST_KEY) => {
                    listener.write(&DiagnosticEvent::EndRequest {
                        context: &context.http_context,
                        timestamp: current_timestamp,
                    });
                }
                Some(error) if listener.is_enabled_for(UNHANDLED_EXCEPTION_KEY) => {
                    listener.write(&DiagnosticEvent::UnhandledException {
                        context: &context.http_context,
                        timestamp: current_timestamp,
                        error,
                    });
                }
                _ => {}
            }
        }

        if let Some(activity) = context.activity.as_mut() {
            activity.set_tag(
                "http.response.status_code",
                context.http_context.response.status.as_str(),
            );
            activity.stop();
            if context.has_diagnostic_listener && listener.is_enabled_for(ACTIVITY_STOP_KEY) {
                listener.write(&DiagnosticEvent::ActivityStop {
                    context: &context.http_context,
                    activity: &*activity,
                });
            }
            self.activity_source.notify_stop(activity);
        }

        if context.event_log_enabled {
            if error.is_some() {
                self.event_source.unhandled_exception();
            }
            if context.http_context.response.status.as_u16() >= 500 {
                self.event_source.request_failed();
            }
        }

        context.scope = None;
    }

    /// Balance the event source's current-requests counter. Runs for every
    /// request, whatever the rest of diagnostics did.
    pub fn context_disposed(&self, context: &HostingContext) {
        if context.event_log_enabled {
            self.event_source.request_stop();
        }
    }
}

impl std::fmt::Debug for HostingApplicationDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostingApplicationDiagnostics")
            .field("activity_source", &self.activity_source)
            .field("event_source", &self.event_source)
            .field("metrics", &self.metrics)
            .finish()
    }
}
