use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Extension;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use etude_hosting::diagnostics::activity::{ActivitySamplingResult, ActivitySource};
use etude_hosting::diagnostics::event_source::HostingEventSource;
use etude_hosting::diagnostics::listener::{
    ACTIVITY_START_KEY, ACTIVITY_STOP_KEY, BEGIN_REQUEST_KEY, END_REQUEST_KEY,
    UNHANDLED_EXCEPTION_KEY,
};
use etude_hosting::diagnostics::metrics::{
    MetricsTagsFeature, TAG_ERROR_TYPE, TAG_METHOD, TAG_PROTOCOL_VERSION, TAG_ROUTE, TAG_SCHEME,
    TAG_STATUS_CODE, TAG_UNHANDLED,
};
use etude_hosting::diagnostics::{ACTIVITY_SOURCE_NAME, HostingApplicationDiagnostics};
use etude_hosting::testing::{
    RecordingActivityListener, RecordingListener, RecordingMetrics, TestClient, TestServer, tag,
};
use etude_hosting::application::ABORTED_ERROR_TYPE;
use etude_hosting::server::serve_request;
use etude_hosting::{Configuration, ContextSlot, HostingApplication, WebHost, WebHostBuilder};

const TRACEPARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

async fn explode() -> &'static str {
    panic!("handler exploded")
}

fn builder() -> WebHostBuilder {
    WebHostBuilder::with_environment_settings(Configuration::new())
        .suppress_status_messages(true)
        .configure(|app| {
            app.route("/users/{id}", get(|| async { "user" }))
                .route("/boom", get(explode))
                .route(
                    "/unavailable",
                    get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "later") }),
                )
                .route(
                    "/tagged",
                    get(|Extension(tags): Extension<MetricsTagsFeature>| async move {
                        tags.add_tag(TAG_ROUTE, "custom-route");
                        tags.add_tag("tenant", "acme");
                        "tagged"
                    }),
                )
                .route(
                    "/quiet",
                    get(|Extension(tags): Extension<MetricsTagsFeature>| async move {
                        tags.disable_metrics();
                        "quiet"
                    }),
                );
            Ok(())
        })
}

async fn start(builder: WebHostBuilder) -> (WebHost, TestClient) {
    let server = TestServer::new();
    let mut host = builder.use_server(server.clone()).build().unwrap();
    host.start().await.unwrap();
    (host, server.client())
}

// ═══ Diagnostic listener ═══

#[tokio::test]
async fn test_listener_sees_begin_and_end_around_the_activity() {
    let listener = RecordingListener::new();
    let (_host, client) = start(builder().use_diagnostic_listener(listener.clone())).await;

    assert_eq!(client.get("/users/7").await.status, 200);

    assert_eq!(
        listener.names(),
        vec![
            ACTIVITY_START_KEY,
            BEGIN_REQUEST_KEY,
            END_REQUEST_KEY,
            ACTIVITY_STOP_KEY
        ]
    );
    let events = listener.events();
    assert!(events.iter().all(|event| event.path == "/users/7"));
    assert_eq!(events[2].status, 200);

    let stopped = events[3].activity.as_ref().unwrap();
    assert!(stopped.stopped);
    assert_eq!(
        tag(&stopped.tags, "http.response.status_code"),
        Some("200")
    );
    assert_eq!(listener.imports(), 1);
}

#[tokio::test]
async fn test_failed_request_reports_unhandled_exception() {
    let listener = RecordingListener::new();
    let (_host, client) = start(builder().use_diagnostic_listener(listener.clone())).await;

    assert_eq!(client.get("/boom").await.status, 500);

    let names = listener.names();
    assert!(names.contains(&UNHANDLED_EXCEPTION_KEY));
    assert!(!names.contains(&END_REQUEST_KEY));

    let failed = listener
        .events()
        .into_iter()
        .find(|event| event.name == UNHANDLED_EXCEPTION_KEY)
        .unwrap();
    let error = failed.error.unwrap();
    assert_eq!(error.type_name, "panic");
    assert_eq!(error.message, "handler exploded");
    assert_eq!(failed.status, 500);
}

#[tokio::test]
async fn test_listener_only_gets_the_events_it_asked_for() {
    let listener = RecordingListener::only([BEGIN_REQUEST_KEY]);
    let (_host, client) = start(builder().use_diagnostic_listener(listener.clone())).await;

    client.get("/users/1").await;
    client.get("/users/2").await;

    assert_eq!(listener.names(), vec![BEGIN_REQUEST_KEY, BEGIN_REQUEST_KEY]);
    let events = listener.events();
    assert_ne!(events[0].trace_identifier, events[1].trace_identifier);
    assert!(events[0].timestamp.unwrap() <= events[1].timestamp.unwrap());
}

// ═══ Activities ═══

#[tokio::test]
async fn test_traceparent_without_listeners_creates_no_activity() {
    let application = HostingApplication::new(
        axum::Router::new(),
        HostingApplicationDiagnostics::default(),
    );
    let request = Request::get("http://localhost/")
        .header("traceparent", TRACEPARENT)
        .body(Body::empty())
        .unwrap();

    let (context, _request) = application.create_context(request, None);
    assert!(context.activity.is_none());
    assert!(context.scope.is_none());
    assert!(!context.has_diagnostic_listener);
    application.dispose_context(context, None);
}

#[tokio::test]
async fn test_activity_joins_the_callers_trace() {
    let recorder = RecordingActivityListener::default();
    let mut source = ActivitySource::new(ACTIVITY_SOURCE_NAME);
    source.add_listener(Arc::new(recorder.clone()));
    let (_host, client) = start(builder().use_activity_source(source)).await;

    client
        .get_with_headers(
            "/users/7",
            &[
                ("traceparent", TRACEPARENT),
                ("tracestate", "congo=t61"),
                ("baggage", "user=alice,tier=gold"),
            ],
        )
        .await;

    let started = recorder.started();
    assert_eq!(started.len(), 1);
    let activity = &started[0];
    assert_eq!(activity.trace_id, "0af7651916cd43dd8448eb211c80319c");
    assert_eq!(activity.parent_span_id.as_deref(), Some("b7ad6b7169203331"));
    assert_ne!(activity.span_id, "b7ad6b7169203331");
    assert_eq!(activity.trace_state.as_deref(), Some("congo=t61"));
    assert_eq!(
        activity.baggage,
        vec![
            ("user".to_owned(), "alice".to_owned()),
            ("tier".to_owned(), "gold".to_owned()),
        ]
    );

    let stopped = recorder.stopped();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].span_id, activity.span_id);
}

#[tokio::test]
async fn test_unsampled_activity_is_not_created() {
    let recorder = RecordingActivityListener::new(ActivitySamplingResult::None);
    let mut source = ActivitySource::new(ACTIVITY_SOURCE_NAME);
    source.add_listener(Arc::new(recorder.clone()));
    let (_host, client) = start(builder().use_activity_source(source)).await;

    client.get("/users/7").await;
    assert!(recorder.started().is_empty());
}

#[tokio::test]
async fn test_request_without_parent_starts_a_new_trace() {
    let recorder = RecordingActivityListener::default();
    let mut source = ActivitySource::new(ACTIVITY_SOURCE_NAME);
    source.add_listener(Arc::new(recorder.clone()));
    let (_host, client) = start(builder().use_activity_source(source)).await;

    client.get("/users/1").await;
    client.get("/users/2").await;

    let started = recorder.started();
    assert_eq!(started.len(), 2);
    assert!(started.iter().all(|a| a.parent_span_id.is_none()));
    assert_eq!(started[0].trace_id.len(), 32);
    assert_ne!(started[0].trace_id, started[1].trace_id);
}

// ═══ Metrics ═══

#[tokio::test]
async fn test_active_requests_balance_with_matching_tags() {
    let metrics = RecordingMetrics::new();
    let (_host, client) = start(builder().use_metrics_sink(metrics.clone())).await;

    client.get("/users/7").await;
    client.get("/boom").await;
    client.get("/missing").await;

    let active = metrics.active_requests();
    assert_eq!(active.len(), 6);
    assert_eq!(metrics.active_request_count(), 0);
    for pair in active.chunks(2) {
        assert_eq!(pair[0].0, 1);
        assert_eq!(pair[1].0, -1);
        assert_eq!(pair[0].1, pair[1].1);
        assert_eq!(tag(&pair[0].1, TAG_SCHEME), Some("http"));
        assert_eq!(tag(&pair[0].1, TAG_METHOD), Some("GET"));
    }
}

#[tokio::test]
async fn test_duration_carries_route_status_and_protocol() {
    let metrics = RecordingMetrics::new();
    let (_host, client) = start(builder().use_metrics_sink(metrics.clone())).await;

    client.get("/users/7").await;

    let durations = metrics.durations();
    assert_eq!(durations.len(), 1);
    let (seconds, tags) = &durations[0];
    assert!(*seconds >= 0.0);
    assert_eq!(tag(tags, TAG_ROUTE), Some("/users/{id}"));
    assert_eq!(tag(tags, TAG_STATUS_CODE), Some("200"));
    assert_eq!(tag(tags, TAG_PROTOCOL_VERSION), Some("1.1"));
    assert_eq!(tag(tags, TAG_ERROR_TYPE), None);
    assert_eq!(tag(tags, TAG_UNHANDLED), None);
}

#[tokio::test]
async fn test_error_type_from_panic_or_server_status() {
    let metrics = RecordingMetrics::new();
    let (_host, client) = start(builder().use_metrics_sink(metrics.clone())).await;

    client.get("/boom").await;
    client.get("/unavailable").await;

    let durations = metrics.durations();
    assert_eq!(tag(&durations[0].1, TAG_ERROR_TYPE), Some("panic"));
    assert_eq!(tag(&durations[0].1, TAG_STATUS_CODE), Some("500"));
    assert_eq!(tag(&durations[1].1, TAG_ERROR_TYPE), Some("503"));
}

#[tokio::test]
async fn test_unmatched_request_is_tagged_unhandled() {
    let metrics = RecordingMetrics::new();
    let (_host, client) = start(builder().use_metrics_sink(metrics.clone())).await;

    assert_eq!(client.get("/missing").await.status, 404);

    let durations = metrics.durations();
    assert_eq!(tag(&durations[0].1, TAG_UNHANDLED), Some("true"));
    assert_eq!(tag(&durations[0].1, TAG_STATUS_CODE), Some("404"));
}

#[tokio::test]
async fn test_custom_tags_win_over_builtin_tags() {
    let metrics = RecordingMetrics::new();
    let (_host, client) = start(builder().use_metrics_sink(metrics.clone())).await;

    assert_eq!(client.get("/tagged").await.body, "tagged");

    let (_, tags) = &metrics.durations()[0];
    assert_eq!(tag(tags, TAG_ROUTE), Some("custom-route"));
    assert_eq!(tag(tags, "tenant"), Some("acme"));
    assert_eq!(tags.iter().filter(|(k, _)| k == TAG_ROUTE).count(), 1);
}

#[tokio::test]
async fn test_disabled_metrics_skip_duration_but_not_active_count() {
    let metrics = RecordingMetrics::new();
    let (_host, client) = start(builder().use_metrics_sink(metrics.clone())).await;

    client.get("/quiet").await;

    assert!(metrics.durations().is_empty());
    assert_eq!(metrics.active_requests().len(), 2);
    assert_eq!(metrics.active_request_count(), 0);
}

#[tokio::test]
async fn test_default_metrics_sink_adds_no_tags_feature() {
    let builder = WebHostBuilder::with_environment_settings(Configuration::new())
        .suppress_status_messages(true)
        .configure(|app| {
            app.route(
                "/feature",
                get(|tags: Option<Extension<MetricsTagsFeature>>| async move {
                    if tags.is_some() { "tags" } else { "none" }
                }),
            );
            Ok(())
        });
    let (_host, client) = start(builder).await;
    assert_eq!(client.get("/feature").await.body, "none");

    let metrics = RecordingMetrics::new();
    let builder = WebHostBuilder::with_environment_settings(Configuration::new())
        .suppress_status_messages(true)
        .use_metrics_sink(metrics.clone())
        .configure(|app| {
            app.route(
                "/feature",
                get(|tags: Option<Extension<MetricsTagsFeature>>| async move {
                    if tags.is_some() { "tags" } else { "none" }
                }),
            );
            Ok(())
        });
    let (_host, client) = start(builder).await;
    assert_eq!(client.get("/feature").await.body, "tags");
    assert_eq!(metrics.durations().len(), 1);
}

// ═══ Event counters ═══

#[tokio::test]
async fn test_event_counters_balance_whatever_the_outcome() {
    let events = Arc::new(HostingEventSource::enabled());
    let (_host, client) = start(builder().use_event_source(events.clone())).await;

    client.get("/users/7").await;
    client.get("/boom").await;
    client.get("/missing").await;
    client.get("/unavailable").await;

    assert_eq!(events.total_requests(), 4);
    assert_eq!(events.current_requests(), 0);
    assert_eq!(events.failed_requests(), 2);
    assert_eq!(events.unhandled_exceptions(), 1);
}

#[tokio::test]
async fn test_disabled_event_source_counts_nothing() {
    let events = Arc::new(HostingEventSource::new());
    let (_host, client) = start(builder().use_event_source(events.clone())).await;

    client.get("/users/7").await;

    assert_eq!(events.total_requests(), 0);
    assert_eq!(events.current_requests(), 0);
}

// ═══ Context pooling ═══

#[tokio::test]
async fn test_disposed_context_keeps_only_the_http_context() {
    let listener = RecordingListener::new();
    let metrics = RecordingMetrics::new();
    let source = Arc::new(HostingEventSource::enabled());
    let diagnostics = HostingApplicationDiagnostics::new(
        Arc::new(listener),
        Arc::new(ActivitySource::new(ACTIVITY_SOURCE_NAME)),
        Arc::new(etude_hosting::diagnostics::propagator::TraceContextPropagator),
        source,
        etude_hosting::diagnostics::metrics::HostingMetrics::new(Arc::new(metrics)),
    );
    let application = HostingApplication::new(axum::Router::new(), diagnostics);

    let mut pooled = None;
    for path in ["/a", "/b", "/c"] {
        let request = Request::get(format!("http://localhost{path}"))
            .body(Body::empty())
            .unwrap();
        let (mut context, request) = application.create_context(request, pooled.take());
        assert!(context.activity.is_some());
        assert!(context.metrics_tags.is_some());
        assert!(context.event_log_enabled);

        let result = application.process_request(&mut context, request).await;
        let context = application.dispose_context(context, result.as_ref().err());

        assert!(context.activity.is_none());
        assert!(context.scope.is_none());
        assert_eq!(context.start_timestamp, 0);
        assert!(!context.has_diagnostic_listener);
        assert!(!context.metrics_enabled);
        assert!(!context.event_log_enabled);
        assert!(context.starting_log.is_none());
        assert!(context.metrics_tags.is_none());
        assert_eq!(context.http_context.request.path, path);
        pooled = Some(context);
    }
}

#[tokio::test(start_paused = true)]
async fn test_dropped_request_still_balances_diagnostics() {
    let recorder = RecordingActivityListener::default();
    let mut source = ActivitySource::new(ACTIVITY_SOURCE_NAME);
    source.add_listener(Arc::new(recorder.clone()));
    let listener = RecordingListener::new();
    let metrics = RecordingMetrics::new();
    let events = Arc::new(HostingEventSource::enabled());
    let diagnostics = HostingApplicationDiagnostics::new(
        Arc::new(listener.clone()),
        Arc::new(source),
        Arc::new(etude_hosting::diagnostics::propagator::TraceContextPropagator),
        events.clone(),
        etude_hosting::diagnostics::metrics::HostingMetrics::new(Arc::new(metrics.clone())),
    );
    let router = axum::Router::new().route(
        "/slow",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            "late"
        }),
    );
    let application = HostingApplication::new(router, diagnostics);
    let slot = Mutex::new(ContextSlot::new());

    let request = Request::get("http://localhost/slow")
        .body(Body::empty())
        .unwrap();
    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        serve_request(&application, &slot, request),
    )
    .await;
    assert!(outcome.is_err());

    assert_eq!(events.total_requests(), 1);
    assert_eq!(events.current_requests(), 0);
    assert_eq!(events.unhandled_exceptions(), 1);
    assert_eq!(metrics.active_request_count(), 0);
    let durations = metrics.durations();
    assert_eq!(durations.len(), 1);
    assert_eq!(tag(&durations[0].1, TAG_ERROR_TYPE), Some(ABORTED_ERROR_TYPE));
    assert_eq!(recorder.started().len(), 1);
    assert_eq!(recorder.stopped().len(), 1);
    assert!(listener.names().contains(&UNHANDLED_EXCEPTION_KEY));
    assert!(!slot.lock().unwrap().is_empty());

    // The refilled context serves the next request on the connection.
    let request = Request::get("http://localhost/missing")
        .body(Body::empty())
        .unwrap();
    let response = serve_request(&application, &slot, request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(events.current_requests(), 0);
}
