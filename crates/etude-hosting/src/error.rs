use std::any::Any;
use std::fmt;

use thiserror::Error;

/// Failure reported by a collaborator: a hosted service, a configure
/// callback, a hosting startup or a server.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the web host.
#[derive(Debug, Error)]
pub enum HostingError {
    #[error("no server was registered; call use_server() on the builder")]
    NoServer,

    #[error("application startup failed: {0}")]
    Startup(#[source] BoxError),

    #[error("hosted service `{name}` failed to start: {source}")]
    HostedServiceStart {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("{} hosting startup(s) failed: {}", .0.len(), join_messages(.0))]
    HostingStartup(Vec<BoxError>),

    #[error("{} error(s) occurred: {}", .0.len(), join_messages(.0))]
    Aggregate(Vec<BoxError>),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("the operation was canceled")]
    Canceled,
}

impl HostingError {
    /// The individual failures behind an aggregate, or `self` alone.
    pub fn inner_errors(&self) -> Vec<String> {
        match self {
            HostingError::Aggregate(errors) | HostingError::HostingStartup(errors) => {
                errors.iter().map(ToString::to_string).collect()
            }
            other => vec![other.to_string()],
        }
    }
}

fn join_messages(errors: &[BoxError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A request that failed inside the application.
///
/// Handlers fail by panicking; the host catches the panic and carries its
/// message here so diagnostics can report it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{type_name}: {message}")]
pub struct RequestError {
    /// Reported as the `error.type` metric tag.
    pub type_name: String,
    pub message: String,
}

impl RequestError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        RequestError {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Build from a caught panic payload.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        RequestError::new("panic", panic_message(payload))
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

/// Wraps a plain message as a [`BoxError`].
#[derive(Debug)]
pub(crate) struct MessageError(pub String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MessageError {}
