use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

const TARGET: &str = "etude_hosting::event_source";

/// Low-level hosting counters.
///
/// Disabled until [`enable`](Self::enable) is called; the diagnostics
/// engine checks [`is_enabled`](Self::is_enabled) once per request and
/// skips every counter when it is off.
#[derive(Debug, Default)]
pub struct HostingEventSource {
    enabled: AtomicBool,
    total_requests: AtomicU64,
    current_requests: AtomicI64,
    failed_requests: AtomicU64,
    unhandled_exceptions: AtomicU64,
}

impl HostingEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source that starts enabled.
    pub fn enabled() -> Self {
        let source = Self::default();
        source.enable();
        source
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn host_start(&self) {
        if self.is_enabled() {
            tracing::trace!(target: TARGET, "host start");
        }
    }

    pub fn host_stop(&self) {
        if self.is_enabled() {
            tracing::trace!(target: TARGET, "host stop");
        }
    }

    pub fn request_start(&self, method: &str, path: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.current_requests.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: TARGET, method, path, "request start");
    }

    pub fn request_stop(&self) {
        self.current_requests.fetch_sub(1, Ordering::Relaxed);
        tracing::trace!(target: TARGET, "request stop");
    }

    pub fn request_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unhandled_exception(&self) {
        self.unhandled_exceptions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: TARGET, "unhandled exception");
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn current_requests(&self) -> i64 {
        self.current_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn unhandled_exceptions(&self) -> u64 {
        self.unhandled_exceptions.load(Ordering::Relaxed)
    }
}
