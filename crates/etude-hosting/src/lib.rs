//! Web host for axum applications.
//!
//! A [`WebHost`] owns a transport ([`Server`]), the request pipeline built by
//! a `configure` callback, background [`HostedService`]s and the
//! [`ApplicationLifetime`] signals. Every request passes through
//! [`HostingApplication`], which brackets it with diagnostics: a logging
//! scope, an activity joined to the caller's trace, diagnostic listener
//! events, event counters and `metrics` measurements.
//!
//! ```rust,no_run
//! use axum::routing::get;
//! use etude_hosting::{HyperServer, WebHostBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), etude_hosting::HostingError> {
//!     etude_hosting::logging::init_logging();
//!
//!     WebHostBuilder::new()
//!         .use_server(HyperServer::new())
//!         .configure(|app| {
//!             app.route("/", get(|| async { "Hello from etude!" }));
//!             Ok(())
//!         })
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```

pub mod application;
pub mod body;
pub mod builder;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod environment;
pub mod error;
pub mod error_page;
pub mod host;
pub mod hosted;
pub mod lifetime;
pub mod logging;
pub mod server;
pub mod testing;

pub use application::{ApplicationBuilder, ConfigureFn, ContextSlot, HostingApplication, StartupFilter};
pub use builder::{AsyncDisposable, HostingStartup, Services, StartupBuilder, WebHostBuilder};
pub use config::{Configuration, WebHostDefaults, WebHostOptions};
pub use context::{HostingContext, HttpContext, RequestIdentifier};
pub use diagnostics::HostingApplicationDiagnostics;
pub use environment::{Environments, HostingEnvironment};
pub use error::{BoxError, HostingError, RequestError};
pub use host::WebHost;
pub use hosted::HostedService;
pub use lifetime::{ApplicationLifetime, LifetimeSignal};
pub use server::{HyperServer, Server, ServerAddresses, ServerFeatures};
