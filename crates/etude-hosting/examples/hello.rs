//! # Etude Hello World
//!
//! A web host with two routes, a background heartbeat and lifetime hooks.
//!
//! ## Run
//!
//! ```bash
//! ASPNETCORE_URLS="http://localhost:8080" RUST_LOG=info cargo run -p etude-hosting --example hello
//! ```
//!
//! ## Endpoints
//!
//! - `GET /`            → greeting registered in `configure_services`
//! - `GET /users/{id}`  → the user id and the request identifier

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::Extension;
use axum::extract::Path;
use axum::routing::get;
use etude_hosting::{BoxError, HostedService, HyperServer, RequestIdentifier, WebHostBuilder};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Greeting(String);

/// Logs a line every few seconds until the host stops.
#[derive(Default)]
struct Heartbeat {
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl HostedService for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn start(&self, _token: CancellationToken) -> Result<(), BoxError> {
        let task = tokio::spawn(async {
            let mut ticks = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticks.tick().await;
                tracing::info!("still alive");
            }
        });
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
        Ok(())
    }

    async fn stop(&self, _token: CancellationToken) -> Result<(), BoxError> {
        if let Some(task) = self.task.lock().ok().and_then(|mut slot| slot.take()) {
            task.abort();
        }
        Ok(())
    }
}

async fn user(
    Path(id): Path<u32>,
    Extension(request): Extension<RequestIdentifier>,
) -> String {
    format!("user {id} (request {})", request.0)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    etude_hosting::logging::init_logging();

    let host = WebHostBuilder::new()
        .use_server(HyperServer::new())
        .add_hosted_service(Heartbeat::default())
        .configure_services(|services, env| {
            services.insert(Greeting(format!(
                "Hello from etude ({})!",
                env.environment_name
            )));
            Ok(())
        })
        .configure(|app| {
            let greeting = app
                .services()
                .get::<Greeting>()
                .map(|greeting| greeting.0.clone())
                .unwrap_or_default();
            app.route("/", get(move || async move { greeting }))
                .route("/users/{id}", get(user));
            Ok(())
        })
        .build()?;

    let lifetime = host.lifetime();
    lifetime
        .application_started()
        .register(|| tracing::info!("application started"));
    lifetime
        .application_stopping()
        .register(|| tracing::info!("application stopping"));

    host.run().await?;
    Ok(())
}
