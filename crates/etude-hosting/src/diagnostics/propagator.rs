use axum::http::HeaderMap;
use percent_encoding::percent_decode_str;

/// Read-only access to carrier fields (request headers).
pub trait HeaderCarrier {
    fn get(&self, field: &str) -> Option<&str>;
}

impl HeaderCarrier for HeaderMap {
    fn get(&self, field: &str) -> Option<&str> {
        HeaderMap::get(self, field).and_then(|value| value.to_str().ok())
    }
}

/// Extracts the remote parent and baggage of an incoming request.
pub trait Propagator: Send + Sync {
    /// Carrier fields this propagator reads.
    fn fields(&self) -> &'static [&'static str];

    /// The parent id and trace state, if the carrier has one.
    fn extract_trace_id_and_state(
        &self,
        carrier: &dyn HeaderCarrier,
    ) -> (Option<String>, Option<String>);

    /// Baggage in reverse wire order, so that adding each item in front of
    /// an activity's baggage restores the client's order.
    fn extract_baggage(&self, carrier: &dyn HeaderCarrier) -> Option<Vec<(String, String)>>;
}

pub const TRACE_PARENT: &str = "traceparent";
pub const REQUEST_ID: &str = "Request-Id";
pub const TRACE_STATE: &str = "tracestate";
pub const BAGGAGE: &str = "baggage";
pub const CORRELATION_CONTEXT: &str = "Correlation-Context";

/// W3C trace context with fallbacks to the older `Request-Id` and
/// `Correlation-Context` headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceContextPropagator;

impl Propagator for TraceContextPropagator {
    fn fields(&self) -> &'static [&'static str] {
        &[TRACE_PARENT, REQUEST_ID, TRACE_STATE, BAGGAGE, CORRELATION_CONTEXT]
    }

    fn extract_trace_id_and_state(
        &self,
        carrier: &dyn HeaderCarrier,
    ) -> (Option<String>, Option<String>) {
        let parent = carrier
            .get(TRACE_PARENT)
            .or_else(|| carrier.get(REQUEST_ID))
            .filter(|id| !id.is_empty());
        let Some(parent) = parent else {
            return (None, None);
        };
        let state = carrier
            .get(TRACE_STATE)
            .filter(|state| !state.is_empty())
            .map(str::to_owned);
        (Some(parent.to_owned()), state)
    }

    fn extract_baggage(&self, carrier: &dyn HeaderCarrier) -> Option<Vec<(String, String)>> {
        let header = carrier
            .get(BAGGAGE)
            .or_else(|| carrier.get(CORRELATION_CONTEXT))?;

        let mut items: Vec<(String, String)> = header
            .split(',')
            .filter_map(|item| {
                // Properties after `;` are not kept.
                let item = item.split(';').next()?.trim();
                let (key, value) = item.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((decode_component(key), decode_component(value.trim())))
            })
            .collect();
        if items.is_empty() {
            return None;
        }
        items.reverse();
        Some(items)
    }
}

/// Form-style decoding: `+` is a space, then `%XX` escapes.
fn decode_component(input: &str) -> String {
    let spaced = input.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|(name, value)| {
                (
                    HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    HeaderValue::from_str(value).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_traceparent_wins_over_request_id() {
        let headers = headers(&[
            ("Request-Id", "|legacy.1."),
            ("traceparent", "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
            ("tracestate", "congo=t61"),
        ]);
        let (parent, state) = TraceContextPropagator.extract_trace_id_and_state(&headers);
        assert_eq!(
            parent.as_deref(),
            Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
        );
        assert_eq!(state.as_deref(), Some("congo=t61"));
    }

    #[test]
    fn test_request_id_fallback() {
        let headers = headers(&[("request-id", "|legacy.1.")]);
        let (parent, state) = TraceContextPropagator.extract_trace_id_and_state(&headers);
        assert_eq!(parent.as_deref(), Some("|legacy.1."));
        assert!(state.is_none());
    }

    #[test]
    fn test_no_parent_means_no_state() {
        let headers = headers(&[("tracestate", "congo=t61")]);
        assert_eq!(
            TraceContextPropagator.extract_trace_id_and_state(&headers),
            (None, None)
        );
    }

    #[test]
    fn test_baggage_comes_back_reversed_and_decoded() {
        let headers = headers(&[("baggage", "user=alice, tier=gold;ttl=5 ,note=a%20b")]);
        let baggage = TraceContextPropagator.extract_baggage(&headers).unwrap();
        assert_eq!(
            baggage,
            vec![
                ("note".to_owned(), "a b".to_owned()),
                ("tier".to_owned(), "gold".to_owned()),
                ("user".to_owned(), "alice".to_owned()),
            ]
        );
    }

    #[test]
    fn test_baggage_escapes_and_plus_signs() {
        let headers = headers(&[(
            "baggage",
            "city=New+York,sum=1%2B1,tail=50%,emoji=%F0%9F%8E%89",
        )]);
        let baggage = TraceContextPropagator.extract_baggage(&headers).unwrap();
        assert_eq!(
            baggage,
            vec![
                ("emoji".to_owned(), "\u{1F389}".to_owned()),
                ("tail".to_owned(), "50%".to_owned()),
                ("sum".to_owned(), "1+1".to_owned()),
                ("city".to_owned(), "New York".to_owned()),
            ]
        );
    }

    #[test]
    fn test_correlation_context_fallback() {
        let headers = headers(&[("Correlation-Context", "k=v")]);
        let baggage = TraceContextPropagator.extract_baggage(&headers).unwrap();
        assert_eq!(baggage, vec![("k".to_owned(), "v".to_owned())]);
    }
}
