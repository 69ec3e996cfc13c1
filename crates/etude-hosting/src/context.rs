//! Per-request state kept by the host.
//!
//! A [`HostingContext`] is created for every request and may be pooled by
//! the transport: [`HostingContext::reset`] wipes everything except the
//! [`HttpContext`], whose buffers are reused by the next request on the same
//! connection.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, Method, Response, StatusCode, Version, header, request};
use http_body::Body as HttpBody;

use crate::diagnostics::activity::Activity;
use crate::diagnostics::log::HostingRequestStartingLog;
use crate::diagnostics::metrics::MetricsTagsFeature;

// ═══════════════════════════════════════════════════════════════════
// Trace identifiers
// ═══════════════════════════════════════════════════════════════════

const ENCODE_32_CHARS: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

static LAST_ID: LazyLock<AtomicU64> = LazyLock::new(|| {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64 / 100)
        .unwrap_or(0);
    AtomicU64::new(seed)
});

/// Next process-wide request id: 13 base32 characters of an incrementing
/// 64-bit counter seeded from the clock.
pub fn next_trace_identifier() -> String {
    let id = LAST_ID.fetch_add(1, Ordering::Relaxed) + 1;
    encode_id(id)
}

fn encode_id(id: u64) -> String {
    let mut buf = [0u8; 13];
    for (i, slot) in buf.iter_mut().enumerate() {
        let shift = 60 - 5 * i as u32;
        *slot = ENCODE_32_CHARS[((id >> shift) & 31) as usize];
    }
    buf.iter().map(|&b| b as char).collect()
}

/// The request's trace identifier, available to handlers as an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentifier(pub String);

/// Response extension set by the terminal fallback of the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ReachedPipelineEnd;

/// Response extension carrying the matched route template.
#[derive(Debug, Clone)]
pub struct RouteDiagnostics(pub String);

// ═══════════════════════════════════════════════════════════════════
// HttpContext
// ═══════════════════════════════════════════════════════════════════

/// Request line and headers as seen by the host.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub path_base: String,
    pub path: String,
    /// Including the leading `?`, or empty.
    pub query_string: String,
    pub protocol: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub headers: HeaderMap,
}

/// What the application answered.
#[derive(Debug, Clone, Default)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub route: Option<String>,
    pub reached_pipeline_end: bool,
}

/// The host's snapshot of one request/response exchange.
#[derive(Debug, Clone, Default)]
pub struct HttpContext {
    pub trace_identifier: String,
    pub request: RequestInfo,
    pub response: ResponseInfo,
}

impl HttpContext {
    /// Overwrite the snapshot with a new request, reusing buffers.
    pub fn initialize(&mut self, parts: &request::Parts, trace_identifier: &str) {
        self.trace_identifier.clear();
        self.trace_identifier.push_str(trace_identifier);

        let request = &mut self.request;
        request.method = parts.method.clone();

        request.scheme.clear();
        request
            .scheme
            .push_str(parts.uri.scheme_str().unwrap_or("http"));

        request.host.clear();
        if let Some(host) = parts
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
        {
            request.host.push_str(host);
        } else if let Some(authority) = parts.uri.authority() {
            request.host.push_str(authority.as_str());
        }

        request.path_base.clear();
        request.path.clear();
        request.path.push_str(parts.uri.path());
        request.query_string.clear();
        if let Some(query) = parts.uri.query() {
            request.query_string.push('?');
            request.query_string.push_str(query);
        }

        request.protocol.clear();
        request.protocol.push_str(protocol_name(parts.version));

        request.content_type = header_string(&parts.headers, header::CONTENT_TYPE);
        request.content_length = header_u64(&parts.headers, header::CONTENT_LENGTH);

        request.headers.clear();
        request
            .headers
            .extend(parts.headers.iter().map(|(name, value)| (name.clone(), value.clone())));

        self.response = ResponseInfo::default();
    }

    /// Record the response the application produced.
    pub fn set_response<B>(&mut self, response: &Response<B>)
    where
        B: HttpBody,
    {
        let headers = response.headers();
        self.response.status = response.status();
        self.response.content_type = header_string(headers, header::CONTENT_TYPE);
        self.response.content_length = header_u64(headers, header::CONTENT_LENGTH)
            .or_else(|| response.body().size_hint().exact());
        self.response.route = response
            .extensions()
            .get::<RouteDiagnostics>()
            .map(|route| route.0.clone());
        self.response.reached_pipeline_end =
            response.extensions().get::<ReachedPipelineEnd>().is_some();
    }

    /// Record a failed request that never produced a response.
    pub fn set_failed(&mut self) {
        self.response = ResponseInfo {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            ..ResponseInfo::default()
        };
    }

    /// Clear values but keep allocations.
    pub fn uninitialize(&mut self) {
        self.trace_identifier.clear();
        let request = &mut self.request;
        request.method = Method::GET;
        request.scheme.clear();
        request.host.clear();
        request.path_base.clear();
        request.path.clear();
        request.query_string.clear();
        request.protocol.clear();
        request.content_type = None;
        request.content_length = None;
        request.headers.clear();
        self.response = ResponseInfo::default();
    }
}

pub(crate) fn protocol_name(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "HTTP/1.1",
    }
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

fn header_u64(headers: &HeaderMap, name: header::HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

// ═══════════════════════════════════════════════════════════════════
// HostingContext
// ═══════════════════════════════════════════════════════════════════

/// Everything the diagnostics engine tracks for one request.
#[derive(Debug, Default)]
pub struct HostingContext {
    /// Survives [`reset`](Self::reset).
    pub http_context: HttpContext,
    pub activity: Option<Activity>,
    /// Logging scope; entered around the application and dropped at the end.
    pub scope: Option<tracing::Span>,
    /// Monotonic ticks from [`timestamp`](crate::diagnostics::timestamp),
    /// 0 when nothing needed timing.
    pub start_timestamp: u64,
    pub has_diagnostic_listener: bool,
    pub metrics_enabled: bool,
    pub event_log_enabled: bool,
    pub starting_log: Option<HostingRequestStartingLog>,
    pub metrics_tags: Option<MetricsTagsFeature>,
}

impl HostingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return every transient field to its zero value.
    pub fn reset(&mut self) {
        self.activity = None;
        self.scope = None;
        self.start_timestamp = 0;
        self.has_diagnostic_listener = false;
        self.metrics_enabled = false;
        self.event_log_enabled = false;
        self.starting_log = None;
        self.metrics_tags = None;
    }
}
