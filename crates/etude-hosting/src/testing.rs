//! Testing utilities for etude hosts.
//!
//! [`TestServer`] is an in-process transport: plug it into a
//! [`WebHostBuilder`](crate::WebHostBuilder), start the host and drive
//! requests through a [`TestClient`] without opening a socket.
//!
//! ```rust,ignore
//! use etude_hosting::testing::TestServer;
//!
//! #[tokio::test]
//! async fn test_hello() {
//!     let server = TestServer::new();
//!     let mut host = WebHostBuilder::new()
//!         .use_server(server.clone())
//!         .configure(|app| {
//!             app.route("/", get(|| async { "hello" }));
//!             Ok(())
//!         })
//!         .build()
//!         .unwrap();
//!     host.start().await.unwrap();
//!
//!     let res = server.client().get("/").await;
//!     assert_eq!(res.status, 200);
//!     assert_eq!(res.body, "hello");
//! }
//! ```
//!
//! The recording types capture what diagnostics emit so tests can assert on
//! it: [`RecordingListener`] for diagnostic events, [`RecordingMetrics`] for
//! measurements and [`RecordingActivityListener`] for activities.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode, header};
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;

use crate::application::{ContextSlot, HostingApplication};
use crate::context::HttpContext;
use crate::diagnostics::activity::{
    Activity, ActivityCreationOptions, ActivityListener, ActivitySamplingResult,
};
use crate::diagnostics::listener::{DiagnosticEvent, DiagnosticListener};
use crate::diagnostics::metrics::{MetricsSink, Tags};
use crate::error::{BoxError, HostingError, RequestError};
use crate::server::{Server, ServerFeatures, serve_request};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ═══════════════════════════════════════════════════════════════════
// TestServer
// ═══════════════════════════════════════════════════════════════════

#[derive(Default)]
struct TestServerInner {
    application: Mutex<Option<Arc<HostingApplication>>>,
    slot: Mutex<ContextSlot>,
}

/// A transport that serves requests handed to it by [`TestClient`].
///
/// Clones share state, so keep one clone and hand the other to
/// `use_server`.
#[derive(Clone, Default)]
pub struct TestServer {
    inner: Arc<TestServerInner>,
    features: ServerFeatures,
}

impl TestServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> TestClient {
        TestClient {
            inner: self.inner.clone(),
        }
    }

    /// Whether the host started this server and has not stopped it.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.application).is_some()
    }
}

#[async_trait]
impl Server for TestServer {
    async fn start(
        &mut self,
        application: Arc<HostingApplication>,
        token: CancellationToken,
    ) -> Result<(), BoxError> {
        if token.is_cancelled() {
            return Err(Box::new(HostingError::Canceled));
        }
        *lock(&self.inner.application) = Some(application);
        Ok(())
    }

    async fn stop(&mut self, _token: CancellationToken) -> Result<(), BoxError> {
        lock(&self.inner.application).take();
        Ok(())
    }

    fn features(&self) -> &ServerFeatures {
        &self.features
    }

    fn features_mut(&mut self) -> &mut ServerFeatures {
        &mut self.features
    }
}

impl std::fmt::Debug for TestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestServer")
            .field("running", &self.is_running())
            .field("features", &self.features)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════
// TestClient
// ═══════════════════════════════════════════════════════════════════

/// Sends requests straight into a [`TestServer`].
///
/// Paths are relative (`/users/7?x=1`); requests go to
/// `http://localhost`. Before the host starts, or after it stops, every
/// request gets a 503.
#[derive(Clone)]
pub struct TestClient {
    inner: Arc<TestServerInner>,
}

impl TestClient {
    /// Send a GET request.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.send(self.request(Method::GET, path, &[], Body::empty()))
            .await
    }

    /// Send a GET request with extra headers.
    pub async fn get_with_headers(&self, path: &str, headers: &[(&str, &str)]) -> TestResponse {
        self.send(self.request(Method::GET, path, headers, Body::empty()))
            .await
    }

    /// Send a POST request with a plain text body.
    pub async fn post(&self, path: &str, body: &str) -> TestResponse {
        self.send(self.request(
            Method::POST,
            path,
            &[("content-type", "text/plain; charset=utf-8")],
            Body::from(body.to_owned()),
        ))
        .await
    }

    /// Send any request.
    pub async fn send(&self, request: Request) -> TestResponse {
        let application = lock(&self.inner.application).clone();
        let response = match application {
            Some(application) => serve_request(&application, &self.inner.slot, request).await,
            None => {
                let mut response = axum::http::Response::new(Body::empty());
                *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                response
            }
        };
        TestResponse::from_response(response).await
    }

    fn request(&self, method: Method, path: &str, headers: &[(&str, &str)], body: Body) -> Request {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://localhost{path}"))
            .header(header::HOST, "localhost");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(body).expect("Invalid test request")
    }
}

/// A simplified HTTP response for test assertions.
#[derive(Debug)]
pub struct TestResponse {
    pub status: u16,
    pub body: String,
    pub headers: HeaderMap,
}

impl TestResponse {
    async fn from_response(response: axum::http::Response<Body>) -> Self {
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map(|collected| String::from_utf8_lossy(&collected.to_bytes()).into_owned())
            .unwrap_or_default();
        TestResponse {
            status: parts.status.as_u16(),
            body,
            headers: parts.headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// ═══════════════════════════════════════════════════════════════════
// Recorders
// ═══════════════════════════════════════════════════════════════════

/// What an activity looked like when it was reported.
#[derive(Debug, Clone, Default)]
pub struct RecordedActivity {
    pub operation_name: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub trace_state: Option<String>,
    pub baggage: Vec<(String, String)>,
    pub tags: Vec<(String, String)>,
    pub is_recorded: bool,
    pub stopped: bool,
}

impl From<&Activity> for RecordedActivity {
    fn from(activity: &Activity) -> Self {
        RecordedActivity {
            operation_name: activity.operation_name().to_owned(),
            trace_id: activity.trace_id().to_owned(),
            span_id: activity.span_id().to_owned(),
            parent_id: activity.parent_id().map(str::to_owned),
            parent_span_id: activity.parent_span_id().map(str::to_owned),
            trace_state: activity.trace_state().map(str::to_owned),
            baggage: activity.baggage().to_vec(),
            tags: activity.tags().to_vec(),
            is_recorded: activity.is_recorded(),
            stopped: activity.is_stopped(),
        }
    }
}

/// One event written to a [`RecordingListener`].
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub name: &'static str,
    pub trace_identifier: String,
    pub path: String,
    pub status: u16,
    pub timestamp: Option<u64>,
    pub activity: Option<RecordedActivity>,
    pub error: Option<RequestError>,
}

impl RecordedEvent {
    fn new(event: &DiagnosticEvent<'_>) -> Self {
        let context: &HttpContext = event.context();
        let mut recorded = RecordedEvent {
            name: event.name(),
            trace_identifier: context.trace_identifier.clone(),
            path: context.request.path.clone(),
            status: context.response.status.as_u16(),
            timestamp: None,
            activity: None,
            error: None,
        };
        match event {
            DiagnosticEvent::BeginRequest { timestamp, .. }
            | DiagnosticEvent::EndRequest { timestamp, .. } => {
                recorded.timestamp = Some(*timestamp);
            }
            DiagnosticEvent::UnhandledException {
                timestamp, error, ..
            } => {
                recorded.timestamp = Some(*timestamp);
                recorded.error = Some((*error).clone());
            }
            DiagnosticEvent::ActivityStart { activity, .. }
            | DiagnosticEvent::ActivityStop { activity, .. } => {
                recorded.activity = Some(RecordedActivity::from(*activity));
            }
        }
        recorded
    }
}

#[derive(Default)]
struct ListenerState {
    events: Vec<RecordedEvent>,
    imports: usize,
}

/// A [`DiagnosticListener`] that keeps every event it is sent.
///
/// Listens to every name unless built with [`only`](Self::only).
#[derive(Clone, Default)]
pub struct RecordingListener {
    names: Option<Arc<HashSet<String>>>,
    state: Arc<Mutex<ListenerState>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen only to the given event and activity names.
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RecordingListener {
            names: Some(Arc::new(names.into_iter().map(Into::into).collect())),
            state: Arc::default(),
        }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.state).events.clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.state).events.iter().map(|event| event.name).collect()
    }

    /// How many activities were handed to `on_activity_import`.
    pub fn imports(&self) -> usize {
        lock(&self.state).imports
    }

    pub fn clear(&self) {
        lock(&self.state).events.clear();
    }
}

impl DiagnosticListener for RecordingListener {
    fn is_enabled(&self) -> bool {
        true
    }

    fn is_enabled_for(&self, name: &str) -> bool {
        self.names
            .as_ref()
            .is_none_or(|names| names.contains(name))
    }

    fn write(&self, event: &DiagnosticEvent<'_>) {
        lock(&self.state).events.push(RecordedEvent::new(event));
    }

    fn on_activity_import(&self, _activity: &mut Activity, _context: &HttpContext) {
        lock(&self.state).imports += 1;
    }
}

impl std::fmt::Debug for RecordingListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingListener")
            .field("names", &self.names)
            .field("events", &lock(&self.state).events.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    active: Vec<(i64, Tags)>,
    durations: Vec<(f64, Tags)>,
}

/// A [`MetricsSink`] that keeps every measurement.
#[derive(Debug, Clone, Default)]
pub struct RecordingMetrics {
    state: Arc<Mutex<MetricsState>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every change to the active requests counter, in order.
    pub fn active_requests(&self) -> Vec<(i64, Tags)> {
        lock(&self.state).active.clone()
    }

    /// Sum of all active request deltas.
    pub fn active_request_count(&self) -> i64 {
        lock(&self.state).active.iter().map(|(delta, _)| delta).sum()
    }

    pub fn durations(&self) -> Vec<(f64, Tags)> {
        lock(&self.state).durations.clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn active_requests_add(&self, delta: i64, tags: &[(String, String)]) {
        lock(&self.state).active.push((delta, tags.to_vec()));
    }

    fn request_duration_record(&self, seconds: f64, tags: &[(String, String)]) {
        lock(&self.state).durations.push((seconds, tags.to_vec()));
    }
}

/// Look up `key` in a recorded tag list.
pub fn tag<'a>(tags: &'a [(String, String)], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

#[derive(Debug, Default)]
struct ActivityState {
    started: Vec<RecordedActivity>,
    stopped: Vec<RecordedActivity>,
}

/// An [`ActivityListener`] that samples every activity at a fixed level and
/// keeps what it sees.
#[derive(Debug, Clone)]
pub struct RecordingActivityListener {
    sampling: ActivitySamplingResult,
    state: Arc<Mutex<ActivityState>>,
}

impl RecordingActivityListener {
    pub fn new(sampling: ActivitySamplingResult) -> Self {
        RecordingActivityListener {
            sampling,
            state: Arc::default(),
        }
    }

    pub fn started(&self) -> Vec<RecordedActivity> {
        lock(&self.state).started.clone()
    }

    pub fn stopped(&self) -> Vec<RecordedActivity> {
        lock(&self.state).stopped.clone()
    }
}

impl Default for RecordingActivityListener {
    fn default() -> Self {
        Self::new(ActivitySamplingResult::AllDataAndRecorded)
    }
}

impl ActivityListener for RecordingActivityListener {
    fn sample(&self, _options: &ActivityCreationOptions<'_>) -> ActivitySamplingResult {
        self.sampling
    }

    fn on_start(&self, activity: &Activity) {
        lock(&self.state).started.push(RecordedActivity::from(activity));
    }

    fn on_stop(&self, activity: &Activity) {
        lock(&self.state).stopped.push(RecordedActivity::from(activity));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_before_start_gets_service_unavailable() {
        let server = TestServer::new();
        let res = server.client().get("/").await;
        assert_eq!(res.status, 503);
        assert!(!server.is_running());
    }

    #[test]
    fn test_recording_listener_filters_by_name() {
        let listener = RecordingListener::only(["a"]);
        assert!(listener.is_enabled_for("a"));
        assert!(!listener.is_enabled_for("b"));
        assert!(RecordingListener::new().is_enabled_for("b"));
    }

    #[test]
    fn test_recording_metrics_sums_active_deltas() {
        let metrics = RecordingMetrics::new();
        metrics.active_requests_add(1, &[]);
        metrics.active_requests_add(1, &[]);
        metrics.active_requests_add(-1, &[]);
        assert_eq!(metrics.active_request_count(), 1);
        assert_eq!(metrics.active_requests().len(), 3);
    }
}
