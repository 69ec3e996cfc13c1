//! Started / stopping / stopped signals of a running application.
//!
//! Each signal fires at most once. Callbacks run in registration order on the
//! thread that fires the signal; a panicking callback is logged and does not
//! keep the rest from running. Async code waits on [`LifetimeSignal::token`]
//! instead of registering a callback.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::error::panic_message;
use crate::logging::{HOST_TARGET, event_ids};

type Callback = Box<dyn FnOnce() + Send>;

/// A one-shot broadcast with synchronous subscribers.
pub struct LifetimeSignal {
    name: &'static str,
    event_id: u32,
    token: CancellationToken,
    fired: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
    /// Held for the whole firing so racing callers wait for the callbacks.
    fire_lock: Mutex<()>,
}

impl LifetimeSignal {
    fn new(name: &'static str, event_id: u32) -> Self {
        LifetimeSignal {
            name,
            event_id,
            token: CancellationToken::new(),
            fired: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            fire_lock: Mutex::new(()),
        }
    }

    /// Run `callback` when the signal fires, or right away if it already has.
    pub fn register<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut callbacks = lock(&self.callbacks);
            if !self.fired.load(Ordering::Acquire) {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        self.run(vec![Box::new(callback)]);
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Cancelled once the signal has fired and its callbacks have run.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Fire the signal. Returns `false` when it had already fired.
    ///
    /// A caller that loses the race blocks until the winner's callbacks are
    /// done. A callback that fires its own signal again returns immediately.
    pub(crate) fn fire(&self) -> bool {
        if self.fired.load(Ordering::Acquire) {
            return false;
        }
        let _firing = lock(&self.fire_lock);
        let callbacks = {
            let mut callbacks = lock(&self.callbacks);
            if self.fired.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *callbacks)
        };
        self.run(callbacks);
        self.token.cancel();
        true
    }

    fn run(&self, callbacks: Vec<Callback>) {
        let mut failures = Vec::new();
        for callback in callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
                failures.push(panic_message(payload.as_ref()));
            }
        }
        if !failures.is_empty() {
            tracing::error!(
                target: HOST_TARGET,
                event_id = self.event_id,
                signal = self.name,
                failures = failures.len(),
                "An error occurred in an application {} callback: {}",
                self.name,
                failures.join("; ")
            );
        }
    }
}

impl std::fmt::Debug for LifetimeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifetimeSignal")
            .field("name", &self.name)
            .field("fired", &self.is_fired())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct LifetimeSignals {
    started: LifetimeSignal,
    stopping: LifetimeSignal,
    stopped: LifetimeSignal,
}

/// Lifetime of one web host. Cheap to clone; clones share the signals.
#[derive(Debug, Clone)]
pub struct ApplicationLifetime {
    signals: Arc<LifetimeSignals>,
}

impl Default for ApplicationLifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationLifetime {
    pub fn new() -> Self {
        ApplicationLifetime {
            signals: Arc::new(LifetimeSignals {
                started: LifetimeSignal::new(
                    "started",
                    event_ids::APPLICATION_STARTUP_EXCEPTION,
                ),
                stopping: LifetimeSignal::new(
                    "stopping",
                    event_ids::APPLICATION_STOPPING_EXCEPTION,
                ),
                stopped: LifetimeSignal::new(
                    "stopped",
                    event_ids::APPLICATION_STOPPED_EXCEPTION,
                ),
            }),
        }
    }

    /// Fires once the host has fully started.
    pub fn application_started(&self) -> &LifetimeSignal {
        &self.signals.started
    }

    /// Fires when shutdown begins. Requests may still be in flight.
    pub fn application_stopping(&self) -> &LifetimeSignal {
        &self.signals.stopping
    }

    /// Fires once shutdown has completed.
    pub fn application_stopped(&self) -> &LifetimeSignal {
        &self.signals.stopped
    }

    /// Request a graceful shutdown.
    pub fn stop_application(&self) {
        self.signals.stopping.fire();
    }

    pub fn notify_started(&self) {
        self.signals.started.fire();
    }

    pub fn notify_stopped(&self) {
        self.signals.stopped.fire();
    }
}
