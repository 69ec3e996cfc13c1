//! Structured "request starting" and "request finished" records.
//!
//! Both records keep their values as typed fields so a sink can read them
//! by name, and render the classic one-line message through `Display`.
//! Absent values render as `-`.

use std::fmt;

use crate::context::HttpContext;

/// A field value of a hosting log record.
#[derive(Debug, Clone, PartialEq)]
pub enum LogValue<'a> {
    Str(&'a str),
    U64(u64),
    Float(f64),
    Missing,
}

impl fmt::Display for LogValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogValue::Str(value) => f.write_str(value),
            LogValue::U64(value) => write!(f, "{value}"),
            LogValue::Float(value) => write!(f, "{value:.4}"),
            LogValue::Missing => f.write_str("-"),
        }
    }
}

fn opt_str(value: &Option<String>) -> LogValue<'_> {
    value.as_deref().map_or(LogValue::Missing, LogValue::Str)
}

fn opt_u64(value: Option<u64>) -> LogValue<'static> {
    value.map_or(LogValue::Missing, LogValue::U64)
}

/// Captured once at the start of a request and reused by the finished
/// record.
#[derive(Debug, Clone, PartialEq)]
pub struct HostingRequestStartingLog {
    pub protocol: String,
    pub method: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub scheme: String,
    pub host: String,
    pub path_base: String,
    pub path: String,
    pub query_string: String,
}

impl HostingRequestStartingLog {
    pub const FIELDS: [&'static str; 9] = [
        "Protocol",
        "Method",
        "ContentType",
        "ContentLength",
        "Scheme",
        "Host",
        "PathBase",
        "Path",
        "QueryString",
    ];

    pub fn new(context: &HttpContext) -> Self {
        let request = &context.request;
        HostingRequestStartingLog {
            protocol: request.protocol.clone(),
            method: request.method.as_str().to_owned(),
            content_type: request.content_type.clone(),
            content_length: request.content_length,
            scheme: request.scheme.clone(),
            host: request.host.clone(),
            path_base: request.path_base.clone(),
            path: request.path.clone(),
            query_string: request.query_string.clone(),
        }
    }

    /// Look up a field by its structured name.
    pub fn field(&self, name: &str) -> Option<LogValue<'_>> {
        let value = match name {
            "Protocol" => LogValue::Str(&self.protocol),
            "Method" => LogValue::Str(&self.method),
            "ContentType" => opt_str(&self.content_type),
            "ContentLength" => opt_u64(self.content_length),
            "Scheme" => LogValue::Str(&self.scheme),
            "Host" => LogValue::Str(&self.host),
            "PathBase" => LogValue::Str(&self.path_base),
            "Path" => LogValue::Str(&self.path),
            "QueryString" => LogValue::Str(&self.query_string),
            _ => return None,
        };
        Some(value)
    }
}

impl fmt::Display for HostingRequestStartingLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Request starting {} {} {}://{}{}{}{} - {} {}",
            self.protocol,
            self.method,
            self.scheme,
            self.host,
            self.path_base,
            self.path,
            self.query_string,
            opt_str(&self.content_type),
            opt_u64(self.content_length),
        )
    }
}

/// Written when a request ends.
#[derive(Debug, Clone, PartialEq)]
pub struct HostingRequestFinishedLog {
    pub starting: HostingRequestStartingLog,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub elapsed_milliseconds: f64,
}

impl HostingRequestFinishedLog {
    /// `starting` is rebuilt from the context when the request did not
    /// cache one.
    pub fn new(
        context: &HttpContext,
        starting: Option<&HostingRequestStartingLog>,
        elapsed_milliseconds: f64,
    ) -> Self {
        let starting = starting
            .cloned()
            .unwrap_or_else(|| HostingRequestStartingLog::new(context));
        let response = &context.response;
        HostingRequestFinishedLog {
            starting,
            status_code: response.status.as_u16(),
            content_type: response.content_type.clone(),
            content_length: response.content_length,
            elapsed_milliseconds,
        }
    }

    pub fn field(&self, name: &str) -> Option<LogValue<'_>> {
        match name {
            "StatusCode" => Some(LogValue::U64(u64::from(self.status_code))),
            "ContentType" => Some(opt_str(&self.content_type)),
            "ContentLength" => Some(opt_u64(self.content_length)),
            "ElapsedMilliseconds" => Some(LogValue::Float(self.elapsed_milliseconds)),
            other => self.starting.field(other),
        }
    }
}

impl fmt::Display for HostingRequestFinishedLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let starting = &self.starting;
        write!(
            f,
            "Request finished {} {} {}://{}{}{}{} - {} {} {} {:.4}ms",
            starting.protocol,
            starting.method,
            starting.scheme,
            starting.host,
            starting.path_base,
            starting.path,
            starting.query_string,
            self.status_code,
            opt_u64(self.content_length),
            opt_str(&self.content_type),
            self.elapsed_milliseconds,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};

    fn context(request: Request<()>) -> HttpContext {
        let (parts, ()) = request.into_parts();
        let mut context = HttpContext::default();
        context.initialize(&parts, "0HLEACIU86PT6");
        context
    }

    #[test]
    fn test_missing_content_type_renders_as_dash() {
        let context = context(
            Request::post("http://localhost:5000/upload")
                .header("content-length", "42")
                .body(())
                .unwrap(),
        );
        let log = HostingRequestStartingLog::new(&context);

        assert_eq!(log.field("ContentLength"), Some(LogValue::U64(42)));
        assert_eq!(log.field("ContentType"), Some(LogValue::Missing));
        assert_eq!(log.field("ContentType").unwrap().to_string(), "-");
        assert_eq!(
            log.to_string(),
            "Request starting HTTP/1.1 POST http://localhost:5000/upload - - 42"
        );
        assert!(log.field("Unknown").is_none());
    }

    #[test]
    fn test_finished_log_formats_elapsed_with_four_decimals() {
        let mut context = context(Request::get("http://localhost/a?b=1").body(()).unwrap());
        context.response.status = StatusCode::NOT_FOUND;
        context.response.content_length = Some(0);

        let log = HostingRequestFinishedLog::new(&context, None, 1.5);
        assert_eq!(log.field("StatusCode"), Some(LogValue::U64(404)));
        assert_eq!(log.field("Path"), Some(LogValue::Str("/a")));
        assert_eq!(
            log.to_string(),
            "Request finished HTTP/1.1 GET http://localhost/a?b=1 - 404 0 - 1.5000ms"
        );
    }
}
