//! Request metrics: an active-requests up/down counter and a request
//! duration histogram, recorded through a pluggable [`MetricsSink`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::http::Method;
use metrics::{Label, Recorder, SetRecorderError};

use crate::error::RequestError;

pub const ACTIVE_REQUESTS: &str = "http.server.active_requests";
pub const REQUEST_DURATION: &str = "http.server.request.duration";

pub const TAG_SCHEME: &str = "url.scheme";
pub const TAG_METHOD: &str = "http.request.method";
pub const TAG_PROTOCOL_VERSION: &str = "network.protocol.version";
pub const TAG_STATUS_CODE: &str = "http.response.status_code";
pub const TAG_ROUTE: &str = "http.route";
pub const TAG_UNHANDLED: &str = "http.request.is_unhandled";
pub const TAG_ERROR_TYPE: &str = "error.type";

pub type Tags = Vec<(String, String)>;

/// Destination of hosting measurements.
pub trait MetricsSink: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    fn active_requests_add(&self, delta: i64, tags: &[(String, String)]);

    fn request_duration_record(&self, seconds: f64, tags: &[(String, String)]);
}

/// Forwards to the global recorder of the `metrics` crate.
///
/// The facade cannot report whether a recorder is installed, so the sink is
/// off by default and request timing and tag building are skipped. Turn it
/// on once a recorder exists, or let [`install`](Self::install) do both.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCrateSink {
    enabled: bool,
}

impl MetricsCrateSink {
    /// A sink that records nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A sink for an application that installed its own recorder.
    pub fn enabled() -> Self {
        MetricsCrateSink { enabled: true }
    }

    /// Install `recorder` as the global recorder and return an enabled sink.
    pub fn install<R>(recorder: R) -> Result<Self, SetRecorderError<R>>
    where
        R: Recorder + Sync + 'static,
    {
        metrics::set_global_recorder(recorder)?;
        Ok(Self::enabled())
    }
}

fn labels(tags: &[(String, String)]) -> Vec<Label> {
    tags.iter()
        .map(|(key, value)| Label::new(key.clone(), value.clone()))
        .collect()
}

impl MetricsSink for MetricsCrateSink {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn active_requests_add(&self, delta: i64, tags: &[(String, String)]) {
        let gauge = metrics::gauge!(ACTIVE_REQUESTS, labels(tags));
        if delta >= 0 {
            gauge.increment(delta as f64);
        } else {
            gauge.decrement(delta.unsigned_abs() as f64);
        }
    }

    fn request_duration_record(&self, seconds: f64, tags: &[(String, String)]) {
        metrics::histogram!(REQUEST_DURATION, labels(tags)).record(seconds);
    }
}

/// Known methods keep their name; anything else collapses into `_OTHER`.
pub fn normalize_method(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::PUT => "PUT",
        Method::POST => "POST",
        Method::DELETE => "DELETE",
        Method::HEAD => "HEAD",
        Method::OPTIONS => "OPTIONS",
        Method::TRACE => "TRACE",
        Method::PATCH => "PATCH",
        Method::CONNECT => "CONNECT",
        _ => "_OTHER",
    }
}

/// `HTTP/1.1` -> `1.1`.
fn protocol_version(protocol: &str) -> &str {
    protocol.strip_prefix("HTTP/").unwrap_or(protocol)
}

#[derive(Debug, Default)]
struct TagsState {
    tags: Tags,
    disabled: bool,
    scheme: String,
    method: &'static str,
    protocol: String,
}

/// Per-request handle for downstream code to add duration tags or turn the
/// duration metric off. Inserted into the request extensions only while
/// metrics are enabled; extract it as `Option<Extension<_>>` otherwise.
#[derive(Debug, Clone, Default)]
pub struct MetricsTagsFeature {
    state: Arc<Mutex<TagsState>>,
}

impl MetricsTagsFeature {
    pub(crate) fn new(scheme: &str, method: &'static str, protocol: &str) -> Self {
        MetricsTagsFeature {
            state: Arc::new(Mutex::new(TagsState {
                scheme: scheme.to_owned(),
                method,
                protocol: protocol.to_owned(),
                ..TagsState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TagsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a tag to the duration measurement. A custom tag wins over the
    /// built-in tag of the same name.
    pub fn add_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock().tags.push((key.into(), value.into()));
    }

    pub fn tags(&self) -> Tags {
        self.lock().tags.clone()
    }

    /// Skip the duration histogram for this request.
    pub fn disable_metrics(&self) {
        self.lock().disabled = true;
    }

    pub fn is_disabled(&self) -> bool {
        self.lock().disabled
    }
}

/// Everything `request_end` needs to know about the outcome.
#[derive(Debug)]
pub struct RequestOutcome<'a> {
    pub status: u16,
    pub route: Option<&'a str>,
    pub error: Option<&'a RequestError>,
    pub unhandled: bool,
    pub elapsed_seconds: Option<f64>,
}

/// Hosting request metrics.
#[derive(Clone)]
pub struct HostingMetrics {
    sink: Arc<dyn MetricsSink>,
}

impl Default for HostingMetrics {
    fn default() -> Self {
        Self::new(Arc::new(MetricsCrateSink::disabled()))
    }
}

impl HostingMetrics {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        HostingMetrics { sink }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_enabled()
    }

    fn active_tags(scheme: &str, method: &str) -> Tags {
        vec![
            (TAG_SCHEME.to_owned(), scheme.to_owned()),
            (TAG_METHOD.to_owned(), method.to_owned()),
        ]
    }

    /// Count the request as active and hand back its tags feature.
    pub fn request_start(&self, scheme: &str, method: &Method, protocol: &str) -> MetricsTagsFeature {
        let method = normalize_method(method);
        self.sink
            .active_requests_add(1, &Self::active_tags(scheme, method));
        MetricsTagsFeature::new(scheme, method, protocol)
    }

    /// Mirror [`request_start`](Self::request_start) and record the
    /// duration unless the request disabled it.
    pub fn request_end(&self, feature: &MetricsTagsFeature, outcome: &RequestOutcome<'_>) {
        let state = feature.lock();
        self.sink
            .active_requests_add(-1, &Self::active_tags(&state.scheme, state.method));

        let Some(seconds) = outcome.elapsed_seconds else {
            return;
        };
        if state.disabled {
            return;
        }

        let mut tags = state.tags.clone();
        let mut add = |key: &str, value: String| {
            if !tags.iter().any(|(k, _)| k == key) {
                tags.push((key.to_owned(), value));
            }
        };
        add(TAG_SCHEME, state.scheme.clone());
        add(TAG_METHOD, state.method.to_owned());
        add(TAG_PROTOCOL_VERSION, protocol_version(&state.protocol).to_owned());
        add(TAG_STATUS_CODE, outcome.status.to_string());
        if let Some(route) = outcome.route {
            add(TAG_ROUTE, route.to_owned());
        }
        if outcome.unhandled {
            add(TAG_UNHANDLED, "true".to_owned());
        }
        if let Some(error) = outcome.error {
            add(TAG_ERROR_TYPE, error.type_name.clone());
        } else if outcome.status >= 500 {
            add(TAG_ERROR_TYPE, outcome.status.to_string());
        }
        drop(state);

        self.sink.request_duration_record(seconds, &tags);
    }
}

impl std::fmt::Debug for HostingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostingMetrics")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
