//! Lifecycle signals for phased server shutdown.
//!
//! A [`Signal`] is a one-shot, broadcastable event. Firing it is idempotent and
//! every [`Signaled`] handle, whether taken before or after the fire, observes
//! the fired state. [`LifecycleSignals`] groups the four signals the shutdown
//! sequence moves through.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Name of the signal fired when an external stop has been requested.
pub const SHUTDOWN_INITIATED: &str = "ShutdownInitiated";
/// Name of the signal fired once the shutdown delay has elapsed.
pub const AFTER_SHUTDOWN_DELAY_DURATION: &str = "AfterShutdownDelayDuration";
/// Name of the signal fired when all pre-shutdown hooks have returned.
pub const PRE_SHUTDOWN_HOOKS_STOPPED: &str = "PreShutdownHooksStopped";
/// Name of the signal fired when the server stops accepting new requests.
pub const NOT_ACCEPTING_NEW_REQUEST: &str = "NotAcceptingNewRequest";

/// A named, one-shot event.
///
/// Clones share the same underlying state.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    name: String,
    tx: watch::Sender<bool>,
}

impl Signal {
    /// Create a new, unfired signal.
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SignalInner {
                name: name.into(),
                tx,
            }),
        }
    }

    /// Fire the signal. Firing an already fired signal does nothing.
    pub fn fire(&self) {
        let first = self.inner.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        });

        if first {
            info!(signal = %self.inner.name, "lifecycle signal fired");
        }
    }

    /// Get a handle that resolves once the signal has fired.
    pub fn signaled(&self) -> Signaled {
        Signaled {
            rx: self.inner.tx.subscribe(),
        }
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Diagnostic name of the signal.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Fire the signal when the returned guard is dropped, including on unwind.
    pub fn fire_on_drop(&self) -> FireGuard {
        FireGuard {
            signal: self.clone(),
        }
    }
}

/// Fires its signal on drop. See [`Signal::fire_on_drop`].
#[must_use = "the signal fires as soon as the guard is dropped"]
pub struct FireGuard {
    signal: Signal,
}

impl Drop for FireGuard {
    fn drop(&mut self) {
        self.signal.fire();
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.inner.name)
            .field("fired", &self.is_fired())
            .finish()
    }
}

/// Read-only wait handle for a [`Signal`].
#[derive(Clone, Debug)]
pub struct Signaled {
    rx: watch::Receiver<bool>,
}

impl Signaled {
    /// Whether the signal has fired, without waiting.
    pub fn is_signaled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the signal fires.
    ///
    /// Returns immediately if it already has. If the signal is dropped without
    /// ever firing, this never completes.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// The signals that drive a server through shutdown.
///
/// They fire in this order: `shutdown_initiated` first, then
/// `after_shutdown_delay_duration` and `pre_shutdown_hooks_stopped` in either
/// order, then `not_accepting_new_request` once both of those have fired.
#[derive(Clone, Debug)]
pub struct LifecycleSignals {
    /// An external stop has been requested.
    pub shutdown_initiated: Signal,
    /// The configured shutdown delay has elapsed since `shutdown_initiated`.
    pub after_shutdown_delay_duration: Signal,
    /// All pre-shutdown hooks have returned.
    pub pre_shutdown_hooks_stopped: Signal,
    /// The server no longer accepts new requests.
    pub not_accepting_new_request: Signal,
}

impl LifecycleSignals {
    /// Create a fresh set of unfired signals.
    pub fn new() -> Self {
        Self {
            shutdown_initiated: Signal::new(SHUTDOWN_INITIATED),
            after_shutdown_delay_duration: Signal::new(AFTER_SHUTDOWN_DELAY_DURATION),
            pre_shutdown_hooks_stopped: Signal::new(PRE_SHUTDOWN_HOOKS_STOPPED),
            not_accepting_new_request: Signal::new(NOT_ACCEPTING_NEW_REQUEST),
        }
    }

    /// The handle request-handling code consults to reject new work.
    pub fn shutting_down(&self) -> Signaled {
        self.not_accepting_new_request.signaled()
    }

    /// All four signals, in firing order.
    pub fn all(&self) -> [&Signal; 4] {
        [
            &self.shutdown_initiated,
            &self.after_shutdown_delay_duration,
            &self.pre_shutdown_hooks_stopped,
            &self.not_accepting_new_request,
        ]
    }
}

impl Default for LifecycleSignals {
    fn default() -> Self {
        Self::new()
    }
}
