//! Logging and tracing initialization for Etude.
//!
//! Every record the host writes is a `tracing` event. Records about the host
//! itself use the [`HOST_TARGET`] target, per-request records use
//! [`DIAGNOSTICS_TARGET`], and both carry a numeric `event_id` field from
//! [`event_ids`] so log pipelines can match on something stable.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use etude_hosting::logging::init_logging;
//! use etude_hosting::{HyperServer, WebHostBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Initialize logging - call this BEFORE building the host
//!     init_logging();
//!
//!     let host = WebHostBuilder::new()
//!         .use_server(HyperServer::new())
//!         .configure(|app| {
//!             app.route("/", axum::routing::get(|| async { "hello" }));
//!             Ok(())
//!         })
//!         .build()?;
//!     host.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! The logging level can be controlled via the `RUST_LOG` environment variable:
//!
//! ```bash
//! # Request starting/finished records
//! RUST_LOG=info cargo run
//!
//! # Only host lifecycle failures
//! RUST_LOG=etude_hosting=error cargo run
//!
//! # Fine-grained control
//! RUST_LOG=etude_hosting=debug,etude_hosting::diagnostics=warn,hyper=warn cargo run
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Target of host lifecycle records.
pub const HOST_TARGET: &str = "etude_hosting";

/// Target of per-request records.
pub const DIAGNOSTICS_TARGET: &str = "etude_hosting::diagnostics";

/// Stable numeric ids attached to host log records as `event_id`.
pub mod event_ids {
    pub const REQUEST_STARTING: u32 = 1;
    pub const REQUEST_FINISHED: u32 = 2;
    pub const STARTING: u32 = 3;
    pub const STARTED: u32 = 4;
    pub const SHUTDOWN: u32 = 5;
    pub const APPLICATION_STARTUP_EXCEPTION: u32 = 6;
    pub const APPLICATION_STOPPING_EXCEPTION: u32 = 7;
    pub const APPLICATION_STOPPED_EXCEPTION: u32 = 8;
    pub const HOSTED_SERVICE_START_EXCEPTION: u32 = 9;
    pub const HOSTED_SERVICE_STOP_EXCEPTION: u32 = 10;
    pub const HOSTING_STARTUP_ASSEMBLY_EXCEPTION: u32 = 11;
    pub const SERVER_SHUTDOWN_EXCEPTION: u32 = 12;
    pub const HOSTING_STARTUP_ASSEMBLY_LOADED: u32 = 13;
    pub const SERVER_LISTENING: u32 = 14;
    pub const PORTS_OVERRIDDEN_BY_URLS: u32 = 15;
    pub const REQUEST_UNHANDLED: u32 = 16;
}

/// Initialize logging with sensible defaults.
///
/// This function should be called once at the start of your application,
/// **before** building the `WebHost`. It sets up the tracing subscriber to
/// display formatted logs to stdout.
///
/// The log level is controlled by the `RUST_LOG` environment variable.
/// If not set, defaults to `info`, which includes the request starting and
/// request finished records.
///
/// # Panics
///
/// This function will panic if called multiple times. Only call it once
/// at application startup.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with a specific log level.
///
/// This is useful when you want to programmatically set the log level
/// instead of using the `RUST_LOG` environment variable.
///
/// # Common Levels
///
/// - `"debug"` - Host lifecycle records (starting, started, shutdown)
/// - `"info"` - Request records and listening addresses
/// - `"error"` - Only failures; request diagnostics stay mostly off
///
/// # Panics
///
/// This function will panic if called multiple times. Only call it once
/// at application startup.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize pretty-formatted logging (recommended for development).
///
/// Request scopes show up as nested spans, which makes it easy to follow
/// one request through the pipeline.
///
/// # Panics
///
/// This function will panic if called multiple times.
pub fn init_logging_pretty() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(true),
        )
        .init();
}

/// Initialize JSON-formatted logging (recommended for production).
///
/// Every record becomes one JSON object; the `event_id` field and the
/// request scope fields come out as plain keys.
///
/// # Panics
///
/// This function will panic if called multiple times.
pub fn init_logging_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
        .init();
}
