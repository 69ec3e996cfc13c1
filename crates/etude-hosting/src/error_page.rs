//! HTML page served for every request when startup failed and startup
//! errors are captured.

use axum::Router;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::error::BoxError;

static NO_CACHE: HeaderValue = HeaderValue::from_static("no-cache,no-store");
static PRAGMA: HeaderValue = HeaderValue::from_static("no-cache");
static HTML: HeaderValue = HeaderValue::from_static("text/html; charset=utf-8");

/// Render the page. The detailed form lists the error chain and runtime
/// information; the generic form says nothing about the failure.
pub fn render(error: &(dyn std::error::Error + 'static), detailed: bool) -> String {
    let mut page = String::from(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\" />\n\
         <title>Internal Server Error</title>\n</head>\n<body>\n",
    );
    page.push_str("<h1>An error occurred while starting the application.</h1>\n");

    if detailed {
        page.push_str("<ol class=\"errors\">\n");
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
        while let Some(err) = current {
            page.push_str("<li>");
            page.push_str(&escape(&err.to_string()));
            page.push_str("</li>\n");
            current = err.source();
        }
        page.push_str("</ol>\n<footer>\n");
        page.push_str(&format!(
            "etude-hosting {} &middot; {} {}\n",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH,
        ));
        page.push_str("</footer>\n");
    } else {
        page.push_str(
            "<p>The application failed to start. \
             Check the server logs for details.</p>\n",
        );
    }

    page.push_str("</body>\n</html>\n");
    page
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// The error page as a 500 response.
pub fn response(page: Bytes) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [
            (header::CACHE_CONTROL, NO_CACHE.clone()),
            (header::PRAGMA, PRAGMA.clone()),
            (header::CONTENT_TYPE, HTML.clone()),
        ],
        page,
    )
        .into_response()
}

/// A pipeline that answers every request with the error page.
pub(crate) fn router(error: &BoxError, detailed: bool) -> Router {
    let page = Bytes::from(render(error.as_ref(), detailed));
    Router::new().fallback(move || {
        let page = page.clone();
        async move { response(page) }
    })
}
