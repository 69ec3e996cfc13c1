use crate::context::HttpContext;
use crate::diagnostics::activity::Activity;
use crate::error::RequestError;

pub const BEGIN_REQUEST_KEY: &str = "etude.hosting.begin_request";
pub const END_REQUEST_KEY: &str = "etude.hosting.end_request";
pub const UNHANDLED_EXCEPTION_KEY: &str = "etude.hosting.unhandled_exception";
pub const ACTIVITY_NAME: &str = "etude.hosting.http_request_in";
pub const ACTIVITY_START_KEY: &str = "etude.hosting.http_request_in.start";
pub const ACTIVITY_STOP_KEY: &str = "etude.hosting.http_request_in.stop";

/// One named event written to a [`DiagnosticListener`].
#[derive(Debug)]
pub enum DiagnosticEvent<'a> {
    BeginRequest {
        context: &'a HttpContext,
        timestamp: u64,
    },
    EndRequest {
        context: &'a HttpContext,
        timestamp: u64,
    },
    UnhandledException {
        context: &'a HttpContext,
        timestamp: u64,
        error: &'a RequestError,
    },
    ActivityStart {
        context: &'a HttpContext,
        activity: &'a Activity,
    },
    ActivityStop {
        context: &'a HttpContext,
        activity: &'a Activity,
    },
}

impl DiagnosticEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            DiagnosticEvent::BeginRequest { .. } => BEGIN_REQUEST_KEY,
            DiagnosticEvent::EndRequest { .. } => END_REQUEST_KEY,
            DiagnosticEvent::UnhandledException { .. } => UNHANDLED_EXCEPTION_KEY,
            DiagnosticEvent::ActivityStart { .. } => ACTIVITY_START_KEY,
            DiagnosticEvent::ActivityStop { .. } => ACTIVITY_STOP_KEY,
        }
    }

    pub fn context(&self) -> &HttpContext {
        match self {
            DiagnosticEvent::BeginRequest { context, .. }
            | DiagnosticEvent::EndRequest { context, .. }
            | DiagnosticEvent::UnhandledException { context, .. }
            | DiagnosticEvent::ActivityStart { context, .. }
            | DiagnosticEvent::ActivityStop { context, .. } => context,
        }
    }
}

/// In-process subscriber to named hosting events.
pub trait DiagnosticListener: Send + Sync {
    /// Whether anyone listens at all.
    fn is_enabled(&self) -> bool;

    /// Whether the event or activity called `name` is wanted.
    fn is_enabled_for(&self, name: &str) -> bool;

    fn write(&self, event: &DiagnosticEvent<'_>);

    /// Called with a freshly created request activity before it starts.
    fn on_activity_import(&self, _activity: &mut Activity, _context: &HttpContext) {}
}

/// Listener that is never enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDiagnosticListener;

impl DiagnosticListener for NullDiagnosticListener {
    fn is_enabled(&self) -> bool {
        false
    }

    fn is_enabled_for(&self, _name: &str) -> bool {
        false
    }

    fn write(&self, _event: &DiagnosticEvent<'_>) {}
}
