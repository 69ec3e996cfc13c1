//! HTTP/1.1 transport on hyper.
//!
//! ```text
//! socket2 listener per address
//!   → accept loop (watch shutdown)
//!     → TCP_NODELAY
//!       → hyper HTTP/1.1 (keep-alive, pipeline_flush)
//!         → serve_request(application, connection ContextSlot)
//! ```
//!
//! Stopping first drains gracefully. If the stop token fires first, every
//! connection is force-closed, which drops in-flight requests so they end
//! as aborted, and `stop` waits for that to finish.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{Server, ServerFeatures, serve_request};
use crate::application::{ContextSlot, HostingApplication};
use crate::error::{BoxError, HostingError};
use crate::logging::{HOST_TARGET, event_ids};

/// Address used when nothing else was configured.
pub const DEFAULT_ADDRESS: &str = "http://localhost:5000";

/// hyper-based [`Server`].
#[derive(Debug, Default)]
pub struct HyperServer {
    features: ServerFeatures,
    /// Endpoints configured in code through [`listen`](Self::listen).
    endpoints: Vec<SocketAddr>,
    running: Option<Running>,
}

#[derive(Debug)]
struct Running {
    shutdown: watch::Sender<bool>,
    force_close: CancellationToken,
    accept_loops: JoinSet<()>,
}

impl Running {
    /// Close every connection now and wait until their requests are dropped.
    async fn close(mut self) {
        let _ = self.shutdown.send(true);
        self.force_close.cancel();
        while self.accept_loops.join_next().await.is_some() {}
    }
}

impl HyperServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `addr` regardless of configured urls, unless the host
    /// prefers hosting urls.
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.endpoints.push(addr);
        self
    }

    /// Resolve the addresses to bind.
    fn binding_targets(&self) -> Result<Vec<SocketAddr>, HostingError> {
        let configured = &self.features.addresses;
        let urls = &configured.addresses;

        if !self.endpoints.is_empty() {
            if urls.is_empty() {
                return Ok(self.endpoints.clone());
            }
            if configured.prefer_hosting_urls {
                tracing::info!(
                    target: HOST_TARGET,
                    event_id = event_ids::PORTS_OVERRIDDEN_BY_URLS,
                    "Overriding endpoints defined in code with the configured addresses: {}",
                    urls.join(", ")
                );
                return urls.iter().map(|url| parse_address(url)).collect();
            }
            tracing::warn!(
                target: HOST_TARGET,
                "Overriding address(es) '{}'. Binding to endpoints defined in code instead.",
                urls.join(", ")
            );
            return Ok(self.endpoints.clone());
        }

        if urls.is_empty() {
            tracing::debug!(
                target: HOST_TARGET,
                "No listening endpoints were configured. Binding to {} by default.",
                DEFAULT_ADDRESS
            );
            return Ok(vec![parse_address(DEFAULT_ADDRESS)?]);
        }
        urls.iter().map(|url| parse_address(url)).collect()
    }
}

#[async_trait]
impl Server for HyperServer {
    async fn start(
        &mut self,
        application: Arc<HostingApplication>,
        token: CancellationToken,
    ) -> Result<(), BoxError> {
        if token.is_cancelled() {
            return Err(Box::new(HostingError::Canceled));
        }

        let targets = self.binding_targets()?;
        let mut listeners = Vec::with_capacity(targets.len());
        let mut bound = Vec::with_capacity(targets.len());
        for addr in targets {
            let listener = bind(addr)?;
            let local = listener.local_addr()?;
            let url = format!("http://{local}");
            tracing::info!(
                target: HOST_TARGET,
                event_id = event_ids::SERVER_LISTENING,
                address = %url,
                "Now listening on: {}",
                url
            );
            bound.push(url);
            listeners.push(listener);
        }
        self.features.addresses.addresses = bound;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let force_close = CancellationToken::new();
        let mut accept_loops = JoinSet::new();
        for listener in listeners {
            accept_loops.spawn(accept_loop(
                listener,
                application.clone(),
                shutdown_rx.clone(),
                force_close.clone(),
            ));
        }
        self.running = Some(Running {
            shutdown,
            force_close,
            accept_loops,
        });
        Ok(())
    }

    async fn stop(&mut self, token: CancellationToken) -> Result<(), BoxError> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(true);

        let drained = tokio::select! {
            _ = async { while running.accept_loops.join_next().await.is_some() {} } => true,
            _ = token.cancelled() => false,
        };
        if !drained {
            tracing::warn!(
                target: HOST_TARGET,
                "Some connections failed to close gracefully during server shutdown."
            );
            running.close().await;
        }
        Ok(())
    }

    fn features(&self) -> &ServerFeatures {
        &self.features
    }

    fn features_mut(&mut self) -> &mut ServerFeatures {
        &mut self.features
    }

    async fn dispose(&mut self) {
        if let Some(running) = self.running.take() {
            running.close().await;
        }
    }
}

/// Parse `http://host[:port][/path]` into a socket address.
///
/// `*`, `+`, other host names and an empty host bind every IPv4 interface,
/// `[::]` every IPv6 interface, `localhost` the IPv4 loopback. The port
/// defaults to 80 and any path is ignored.
pub(crate) fn parse_address(url: &str) -> Result<SocketAddr, HostingError> {
    let invalid = || HostingError::InvalidAddress(url.to_owned());
    let trimmed = url.trim();
    let scheme_end = trimmed.find("://").ok_or_else(invalid)?;
    if !trimmed[..scheme_end].eq_ignore_ascii_case("http") {
        return Err(invalid());
    }
    let rest = &trimmed[scheme_end + 3..];
    let authority = rest.split('/').next().unwrap_or_default();

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
        None => 80,
    };

    let ip = if host.eq_ignore_ascii_case("localhost") {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else if let Ok(ip) = host.parse::<IpAddr>() {
        ip
    } else if host == "::" {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    Ok(SocketAddr::new(ip, port))
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Shared hyper HTTP/1.1 builder, cloned per connection.
fn http1_builder() -> http1::Builder {
    let mut builder = http1::Builder::new();
    builder
        .keep_alive(true)
        .pipeline_flush(true)
        .half_close(false)
        .max_buf_size(16 * 1024);
    builder
}

/// Accept until shutdown, then wait for this listener's connections.
async fn accept_loop(
    listener: TcpListener,
    application: Arc<HostingApplication>,
    mut shutdown: watch::Receiver<bool>,
    force_close: CancellationToken,
) {
    let http_builder = http1_builder();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let _ = stream.set_nodelay(true);
                        connections.spawn(serve_connection(
                            http_builder.clone(),
                            TokioIo::new(stream),
                            application.clone(),
                            shutdown.clone(),
                            force_close.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::error!(target: HOST_TARGET, "TCP accept error: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    builder: http1::Builder,
    io: TokioIo<tokio::net::TcpStream>,
    application: Arc<HostingApplication>,
    mut shutdown: watch::Receiver<bool>,
    force_close: CancellationToken,
) {
    let slot = Arc::new(Mutex::new(ContextSlot::new()));
    let service = service_fn(move |request: Request<Incoming>| {
        let application = application.clone();
        let slot = slot.clone();
        async move {
            let request = request.map(Body::new);
            Ok::<_, Infallible>(serve_request(&application, &slot, request).await)
        }
    });

    let mut conn = std::pin::pin!(builder.serve_connection(io, service));
    let mut draining = false;
    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            _ = force_close.cancelled() => return,
            _ = shutdown.changed(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    };

    if let Err(e) = result {
        if !e.is_incomplete_message() && !e.is_canceled() && !e.is_closed() {
            tracing::debug!(target: HOST_TARGET, "connection error: {}", e);
        }
    }
}
