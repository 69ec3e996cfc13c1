//! Distributed-tracing spans ("activities") with W3C trace context ids.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Internal,
    Server,
    Client,
}

/// Parsed W3C `traceparent` plus `tracestate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityContext {
    pub trace_id: String,
    pub span_id: String,
    pub trace_flags: u8,
    pub trace_state: Option<String>,
    pub is_remote: bool,
}

impl ActivityContext {
    /// Parse `00-<32 hex trace id>-<16 hex span id>-<2 hex flags>`.
    ///
    /// All-zero ids and unknown versions are rejected.
    pub fn try_parse(traceparent: &str, trace_state: Option<&str>, is_remote: bool) -> Option<Self> {
        let mut parts = traceparent.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() || version != "00" {
            return None;
        }
        if !is_lower_hex(trace_id, 32) || !is_lower_hex(span_id, 16) || !is_lower_hex(flags, 2) {
            return None;
        }
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return None;
        }
        let trace_flags = u8::from_str_radix(flags, 16).ok()?;

        Some(ActivityContext {
            trace_id: trace_id.to_owned(),
            span_id: span_id.to_owned(),
            trace_flags,
            trace_state: trace_state.map(str::to_owned),
            is_remote,
        })
    }

    pub fn is_recorded(&self) -> bool {
        self.trace_flags & 1 == 1
    }
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// One timed operation in a distributed trace.
#[derive(Debug, Clone)]
pub struct Activity {
    operation_name: String,
    display_name: Option<String>,
    kind: ActivityKind,
    source: Option<String>,
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    /// Raw parent id when it was not a W3C traceparent (`Request-Id`).
    parent_id: Option<String>,
    trace_state: Option<String>,
    recorded: bool,
    all_data_requested: bool,
    baggage: Vec<(String, String)>,
    tags: Vec<(String, String)>,
    start_time: Option<SystemTime>,
    started_at: Option<Instant>,
    duration: Option<Duration>,
}

impl Activity {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Activity {
            operation_name: operation_name.into(),
            display_name: None,
            kind: ActivityKind::Internal,
            source: None,
            trace_id: String::new(),
            span_id: String::new(),
            parent_span_id: None,
            parent_id: None,
            trace_state: None,
            recorded: false,
            all_data_requested: true,
            baggage: Vec::new(),
            tags: Vec::new(),
            start_time: None,
            started_at: None,
            duration: None,
        }
    }

    pub(crate) fn with_kind(mut self, kind: ActivityKind) -> Self {
        self.kind = kind;
        self
    }

    pub(crate) fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_owned());
        self
    }

    pub(crate) fn with_parent_context(mut self, parent: &ActivityContext) -> Self {
        self.trace_id = parent.trace_id.clone();
        self.parent_span_id = Some(parent.span_id.clone());
        self.recorded = parent.is_recorded();
        self.trace_state = parent.trace_state.clone();
        self
    }

    pub(crate) fn set_sampling(&mut self, all_data_requested: bool, recorded: bool) {
        self.all_data_requested = all_data_requested;
        self.recorded = recorded;
    }

    /// Adopt a parent id from a request header.
    ///
    /// A W3C traceparent joins its trace; anything else (an old-style
    /// hierarchical `Request-Id`) is kept verbatim as the parent id.
    pub fn set_parent_id(&mut self, parent_id: &str) {
        match ActivityContext::try_parse(parent_id, None, true) {
            Some(parent) => {
                self.trace_id = parent.trace_id;
                self.parent_span_id = Some(parent.span_id);
                self.recorded = parent.trace_flags & 1 == 1;
            }
            None => self.parent_id = Some(parent_id.to_owned()),
        }
    }

    pub fn set_trace_state(&mut self, trace_state: Option<String>) {
        self.trace_state = trace_state;
    }

    /// Add a baggage item in front of the existing ones.
    pub fn add_baggage(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.baggage.insert(0, (key.into(), value.into()));
    }

    /// Set or replace a tag.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.tags.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.tags.push((key, value)),
        }
    }

    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.display_name = Some(name.into());
    }

    /// Assign ids (a fresh trace id if no parent supplied one) and start the
    /// clock.
    pub fn start(&mut self) {
        if self.started_at.is_some() {
            return;
        }
        if self.trace_id.is_empty() {
            self.trace_id = new_trace_id();
        }
        self.span_id = new_span_id();
        self.start_time = Some(SystemTime::now());
        self.started_at = Some(Instant::now());
    }

    /// Stop the clock. Stopping twice keeps the first duration.
    pub fn stop(&mut self) {
        if self.duration.is_some() {
            return;
        }
        if self.started_at.is_none() {
            self.start();
        }
        self.duration = self.started_at.map(|started| started.elapsed());
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.operation_name)
    }

    pub fn kind(&self) -> ActivityKind {
        self.kind
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn parent_span_id(&self) -> Option<&str> {
        self.parent_span_id.as_deref()
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn trace_state(&self) -> Option<&str> {
        self.trace_state.as_deref()
    }

    pub fn is_recorded(&self) -> bool {
        self.recorded
    }

    pub fn is_all_data_requested(&self) -> bool {
        self.all_data_requested
    }

    pub fn baggage(&self) -> &[(String, String)] {
        &self.baggage
    }

    pub fn baggage_item(&self, key: &str) -> Option<&str> {
        self.baggage
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn start_time(&self) -> Option<SystemTime> {
        self.start_time
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn is_stopped(&self) -> bool {
        self.duration.is_some()
    }

    /// W3C `traceparent` form of this activity, once started.
    pub fn id(&self) -> Option<String> {
        if self.span_id.is_empty() {
            return None;
        }
        Some(format!(
            "00-{}-{}-{:02x}",
            self.trace_id,
            self.span_id,
            u8::from(self.recorded)
        ))
    }
}

/// How much a listener wants to know about a new activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActivitySamplingResult {
    None,
    PropagationData,
    AllData,
    AllDataAndRecorded,
}

/// What a listener sees when asked to sample.
#[derive(Debug)]
pub struct ActivityCreationOptions<'a> {
    pub source: &'a str,
    pub name: &'a str,
    pub kind: ActivityKind,
    pub parent: Option<&'a ActivityContext>,
    pub parent_id: Option<&'a str>,
}

/// Subscriber to the activities of an [`ActivitySource`].
pub trait ActivityListener: Send + Sync {
    fn listens_to(&self, _source: &str) -> bool {
        true
    }

    fn sample(&self, options: &ActivityCreationOptions<'_>) -> ActivitySamplingResult;

    fn on_start(&self, _activity: &Activity) {}

    fn on_stop(&self, _activity: &Activity) {}
}

/// Named factory of activities. Creates nothing unless a listener asks.
#[derive(Clone, Default)]
pub struct ActivitySource {
    name: String,
    listeners: Vec<Arc<dyn ActivityListener>>,
}

impl ActivitySource {
    pub fn new(name: impl Into<String>) -> Self {
        ActivitySource {
            name: name.into(),
            listeners: Vec::new(),
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ActivityListener>) {
        if listener.listens_to(&self.name) {
            self.listeners.push(listener);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Create (but do not start) an activity if any listener samples it in.
    pub fn create_activity(
        &self,
        name: &str,
        kind: ActivityKind,
        parent: Option<&ActivityContext>,
        parent_id: Option<&str>,
    ) -> Option<Activity> {
        if self.listeners.is_empty() {
            return None;
        }
        let options = ActivityCreationOptions {
            source: &self.name,
            name,
            kind,
            parent,
            parent_id,
        };
        let sampling = self
            .listeners
            .iter()
            .map(|listener| listener.sample(&options))
            .max()
            .unwrap_or(ActivitySamplingResult::None);
        if sampling == ActivitySamplingResult::None {
            return None;
        }

        let mut activity = Activity::new(name).with_kind(kind).with_source(&self.name);
        match (parent, parent_id) {
            (Some(parent), _) => activity = activity.with_parent_context(parent),
            (None, Some(parent_id)) => activity.set_parent_id(parent_id),
            (None, None) => {}
        }
        activity.set_sampling(
            sampling >= ActivitySamplingResult::AllData,
            sampling == ActivitySamplingResult::AllDataAndRecorded,
        );
        Some(activity)
    }

    pub fn notify_start(&self, activity: &Activity) {
        for listener in &self.listeners {
            listener.on_start(activity);
        }
    }

    pub fn notify_stop(&self, activity: &Activity) {
        for listener in &self.listeners {
            listener.on_stop(activity);
        }
    }
}

impl std::fmt::Debug for ActivitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivitySource")
            .field("name", &self.name)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
