use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use etude_hosting::body::{request_body_reader, response_body_pipe};
use etude_hosting::diagnostics::event_source::HostingEventSource;
use etude_hosting::testing::RecordingListener;
use etude_hosting::{Configuration, HyperServer, WebHost, WebHostBuilder};
use tokio_util::sync::CancellationToken;

/// Read the whole body through the pipe reader and send it back.
async fn echo(body: Body) -> Result<Vec<u8>, StatusCode> {
    let mut reader = request_body_reader(body);
    let mut collected = Vec::new();
    loop {
        let result = reader
            .read()
            .await
            .map_err(|_| StatusCode::BAD_REQUEST)?;
        let buffer = result.buffer();
        collected.extend_from_slice(&buffer.to_vec());
        let completed = result.is_completed();
        let end = buffer.end();
        reader
            .advance_to(end)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        if completed {
            return Ok(collected);
        }
    }
}

async fn count() -> Response {
    let (mut writer, body) = response_body_pipe();
    tokio::spawn(async move {
        for n in 0..5 {
            if writer.write(format!("{n}\n").as_bytes()).await.is_err() {
                return;
            }
        }
        let _ = writer.complete().await;
    });
    Response::new(body)
}

async fn explode() -> &'static str {
    panic!("handler exploded")
}

async fn start(listener: RecordingListener) -> (WebHost, String) {
    let mut host = WebHostBuilder::with_environment_settings(Configuration::new())
        .use_server(HyperServer::new())
        .use_urls(["http://127.0.0.1:0"])
        .suppress_status_messages(true)
        .use_diagnostic_listener(listener)
        .configure(|app| {
            app.route("/hello", get(|| async { "Hello from etude!" }))
                .route("/echo", post(echo))
                .route("/count", get(count))
                .route("/boom", get(explode));
            Ok(())
        })
        .build()
        .unwrap();
    host.start().await.unwrap();

    let addresses = host.server_addresses();
    assert_eq!(addresses.len(), 1);
    let base = addresses[0].clone();
    assert!(base.starts_with("http://127.0.0.1:"));
    assert!(!base.ends_with(":0"));
    (host, base)
}

#[tokio::test]
async fn test_real_socket_round_trip() {
    let listener = RecordingListener::new();
    let (mut host, base) = start(listener.clone()).await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{base}/hello")).send().await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.text().await.unwrap(), "Hello from etude!");

    let res = client.get(format!("{base}/missing")).send().await.unwrap();
    assert_eq!(res.status().as_u16(), 404);

    // Both requests used the same keep-alive connection and its pooled
    // context; each still got its own identifier.
    let events = listener.events();
    let mut ids: Vec<_> = events
        .iter()
        .map(|event| event.trace_identifier.clone())
        .collect();
    ids.dedup();
    assert_eq!(ids.len(), 2);

    host.stop(CancellationToken::new()).await.unwrap();
    host.dispose().await;
    assert!(client.get(format!("{base}/hello")).send().await.is_err());
}

#[tokio::test]
async fn test_request_body_through_pipe_reader() {
    let (mut host, base) = start(RecordingListener::new()).await;
    let payload = "x".repeat(20_000);

    let res = reqwest::Client::new()
        .post(format!("{base}/echo"))
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.text().await.unwrap(), payload);

    host.stop(CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn test_response_body_through_pipe_writer() {
    let (mut host, base) = start(RecordingListener::new()).await;

    let res = reqwest::get(format!("{base}/count")).await.unwrap();
    assert_eq!(res.text().await.unwrap(), "0\n1\n2\n3\n4\n");

    host.stop(CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_gets_500_over_the_wire() {
    let (mut host, base) = start(RecordingListener::new()).await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{base}/boom")).send().await.unwrap();
    assert_eq!(res.status().as_u16(), 500);

    let res = client.get(format!("{base}/hello")).send().await.unwrap();
    assert_eq!(res.status().as_u16(), 200);

    host.stop(CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_timeout_aborts_in_flight_requests() {
    let events = Arc::new(HostingEventSource::enabled());
    let mut host = WebHostBuilder::with_environment_settings(Configuration::new())
        .use_server(HyperServer::new())
        .use_urls(["http://127.0.0.1:0"])
        .suppress_status_messages(true)
        .use_shutdown_timeout(Duration::from_secs(1))
        .use_event_source(events.clone())
        .configure(|app| {
            app.route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    "late"
                }),
            );
            Ok(())
        })
        .build()
        .unwrap();
    host.start().await.unwrap();
    let base = host.server_addresses()[0].clone();

    let pending = tokio::spawn(reqwest::get(format!("{base}/slow")));
    for _ in 0..200 {
        if events.current_requests() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(events.current_requests(), 1);

    host.stop(CancellationToken::new()).await.unwrap();

    assert_eq!(events.current_requests(), 0);
    assert_eq!(events.unhandled_exceptions(), 1);
    assert!(pending.await.unwrap().is_err());
}
