//! Transports that feed requests into a [`HostingApplication`].

mod hyper_server;

pub use self::hyper_server::{DEFAULT_ADDRESS, HyperServer};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{Response, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::application::{ContextSlot, HostingApplication};
use crate::context::HostingContext;
use crate::error::{BoxError, RequestError};
use crate::logging::HOST_TARGET;

/// Addresses a server listens on.
///
/// Before start this holds the configured urls; after start the server
/// replaces them with the addresses it actually bound.
#[derive(Debug, Clone, Default)]
pub struct ServerAddresses {
    pub addresses: Vec<String>,
    /// Let configured urls win over endpoints set up in code.
    pub prefer_hosting_urls: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ServerFeatures {
    pub addresses: ServerAddresses,
}

/// A transport the web host can start and stop.
#[async_trait]
pub trait Server: Send + Sync {
    /// Begin serving `application`. Returns once the server accepts
    /// requests.
    async fn start(
        &mut self,
        application: Arc<HostingApplication>,
        token: CancellationToken,
    ) -> Result<(), BoxError>;

    /// Stop accepting and drain in-flight requests until `token` fires.
    async fn stop(&mut self, token: CancellationToken) -> Result<(), BoxError>;

    fn features(&self) -> &ServerFeatures;

    fn features_mut(&mut self) -> &mut ServerFeatures;

    async fn dispose(&mut self) {}
}

/// Run one request through `application`, reusing the context pooled in
/// `slot`.
///
/// A request that failed inside the application is answered with a bare
/// 500 once diagnostics have recorded it. If this future is dropped before
/// it completes, the request is ended as aborted and the context still goes
/// back into `slot`.
pub async fn serve_request(
    application: &HostingApplication,
    slot: &Mutex<ContextSlot>,
    request: Request,
) -> Response<Body> {
    let pooled = lock(slot).take();
    let (context, request) = application.create_context(request, pooled);
    let mut in_flight = InFlight {
        application,
        slot,
        context,
        finished: false,
    };
    let result = application
        .process_request(&mut in_flight.context, request)
        .await;
    in_flight.finish(result.as_ref().err());

    match result {
        Ok(response) => response,
        Err(error) => {
            tracing::error!(
                target: HOST_TARGET,
                error = %error,
                "Connection processing ended abnormally"
            );
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

/// A live request context; disposes and returns it to the slot exactly once.
struct InFlight<'a> {
    application: &'a HostingApplication,
    slot: &'a Mutex<ContextSlot>,
    context: HostingContext,
    finished: bool,
}

impl InFlight<'_> {
    fn finish(&mut self, error: Option<&RequestError>) {
        self.finished = true;
        let context = std::mem::take(&mut self.context);
        let context = self.application.dispose_context(context, error);
        lock(self.slot).put(context);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        tracing::debug!(
            target: HOST_TARGET,
            trace_identifier = %self.context.http_context.trace_identifier,
            "Request aborted before completion"
        );
        let context = std::mem::take(&mut self.context);
        let context = self.application.abort_context(context);
        lock(self.slot).put(context);
    }
}

fn lock(slot: &Mutex<ContextSlot>) -> MutexGuard<'_, ContextSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
