//! Recurring poll scheduler
//!
//! A [`Poller`] fires a callback on a fixed period until stopped. The period
//! comes from an injected getter, else the shared [`IntervalStore`], else one
//! second; when the store's interval changes, running pollers restart with
//! the new period on their own.
//!
//! Lifecycle: `Idle --start--> Running --stop/cleanup--> Idle`. `pause` and
//! `resume` keep the timer running and only skip the callback, so ticks stay
//! aligned across a pause. `cleanup` is terminal.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::polling::interval_store::{IntervalStore, SubscriptionHandle, DEFAULT_POLL_INTERVAL};

/// Consecutive failures after which a poller reports a failure streak
pub const FAILURE_STREAK_THRESHOLD: u32 = 3;

/// Boxed poll callback
pub type PollCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Source of the poll period
pub type IntervalGetter = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Poller errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollerError {
    #[error("poller {label} has been cleaned up")]
    CleanedUp { label: String },

    #[error("poller {label} cannot start outside a tokio runtime")]
    NoRuntime { label: String },
}

/// Construction options
#[derive(Clone)]
pub struct PollerOptions {
    /// Name used in logs
    pub label: String,
    /// Overrides the store's interval when set
    pub get_interval: Option<IntervalGetter>,
    /// Shared interval source and change notifications
    pub interval_store: Option<Arc<IntervalStore>>,
    /// Whether the owner pauses this poller while its view is hidden
    pub pause_when_hidden: bool,
    /// Report failure streaks
    pub adaptive: bool,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            label: "poller".to_string(),
            get_interval: None,
            interval_store: None,
            pause_when_hidden: true,
            adaptive: false,
        }
    }
}

impl PollerOptions {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_interval_getter<F>(mut self, getter: F) -> Self
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        self.get_interval = Some(Arc::new(getter));
        self
    }

    pub fn with_interval_store(mut self, store: Arc<IntervalStore>) -> Self {
        self.interval_store = Some(store);
        self
    }

    pub fn with_pause_when_hidden(mut self, pause: bool) -> Self {
        self.pause_when_hidden = pause;
        self
    }

    pub fn with_adaptive(mut self, adaptive: bool) -> Self {
        self.adaptive = adaptive;
        self
    }
}

impl std::fmt::Debug for PollerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerOptions")
            .field("label", &self.label)
            .field("get_interval", &self.get_interval.is_some())
            .field("interval_store", &self.interval_store.is_some())
            .field("pause_when_hidden", &self.pause_when_hidden)
            .field("adaptive", &self.adaptive)
            .finish()
    }
}

/// Options for [`Poller::start`] and [`Poller::stop`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Log lifecycle changes at debug instead of info
    pub silent: bool,
}

impl StartOptions {
    pub fn silent() -> Self {
        Self { silent: true }
    }
}

struct Timer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Timer {
    fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

#[derive(Default)]
struct Lifecycle {
    timer: Option<Timer>,
    interval: Option<Duration>,
    subscription: Option<SubscriptionHandle>,
    runtime: Option<Handle>,
    cleaned_up: bool,
}

struct PollerShared {
    callback: PollCallback,
    options: PollerOptions,
    paused: AtomicBool,
    consecutive_failures: AtomicU32,
    last_success: Mutex<Option<DateTime<Utc>>>,
    lifecycle: Mutex<Lifecycle>,
}

/// Recurring callback driven by the shared poll interval
///
/// Dropping a poller cleans it up.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(IntervalStore::new(Arc::new(JsonFilePreferences::new(path))));
/// let client = client.clone();
///
/// let poller = Poller::new(
///     move || {
///         let client = client.clone();
///         async move {
///             client.fetch("/api/status", FetchOptions::default()).await?;
///             Ok::<(), anyhow::Error>(())
///         }
///     },
///     PollerOptions::new("status").with_interval_store(store.clone()),
/// );
///
/// poller.start(StartOptions::default())?;
/// store.set_interval(Duration::from_secs(5))?; // poller restarts at 5s
/// poller.cleanup();
/// ```
pub struct Poller {
    shared: Arc<PollerShared>,
}

impl Poller {
    pub fn new<F, Fut>(callback: F, options: PollerOptions) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: PollCallback = Arc::new(move || callback().boxed());
        Self::from_callback(callback, options)
    }

    /// Build from an already boxed callback
    pub fn from_callback(callback: PollCallback, options: PollerOptions) -> Self {
        Self {
            shared: Arc::new(PollerShared {
                callback,
                options,
                paused: AtomicBool::new(false),
                consecutive_failures: AtomicU32::new(0),
                last_success: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Start (or restart) the timer; returns the period in use
    pub fn start(&self, options: StartOptions) -> Result<Duration, PollerError> {
        self.shared.start(options)
    }

    /// Stop the timer, keeping the interval subscription
    pub fn stop(&self, options: StartOptions) {
        self.shared.stop(options);
    }

    /// Start again quietly with a freshly resolved period
    pub fn restart(&self) -> Result<Duration, PollerError> {
        self.shared.start(StartOptions::silent())
    }

    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            debug!(label = %self.shared.options.label, "Poller paused");
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            debug!(label = %self.shared.options.label, "Poller resumed");
        }
    }

    /// Stop and unsubscribe; the poller cannot be started again
    pub fn cleanup(&self) {
        self.shared.cleanup();
    }

    pub fn is_active(&self) -> bool {
        self.shared.lifecycle.lock().timer.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Consecutive callback failures since the last success
    pub fn failure_count(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.shared.last_success.lock()
    }

    /// Period of the running timer
    pub fn current_interval(&self) -> Option<Duration> {
        let lifecycle = self.shared.lifecycle.lock();
        lifecycle.timer.as_ref().and(lifecycle.interval)
    }

    pub fn label(&self) -> &str {
        &self.shared.options.label
    }

    pub fn options(&self) -> &PollerOptions {
        &self.shared.options
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shared.cleanup();
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("label", &self.label())
            .field("active", &self.is_active())
            .field("paused", &self.is_paused())
            .field("failures", &self.failure_count())
            .finish()
    }
}

impl PollerShared {
    fn label(&self) -> &str {
        &self.options.label
    }

    fn resolve_interval(&self) -> Duration {
        let interval = match (&self.options.get_interval, &self.options.interval_store) {
            (Some(getter), _) => getter(),
            (None, Some(store)) => store.get_interval(),
            (None, None) => DEFAULT_POLL_INTERVAL,
        };
        interval.max(Duration::from_millis(1))
    }

    fn start(self: &Arc<Self>, options: StartOptions) -> Result<Duration, PollerError> {
        let mut lifecycle = self.lifecycle.lock();
        self.start_locked(&mut lifecycle, options)
    }

    /// Restart quietly, but only if the timer is still running
    fn restart_if_active(self: &Arc<Self>) -> Option<Result<Duration, PollerError>> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.timer.is_none() {
            return None;
        }
        Some(self.start_locked(&mut lifecycle, StartOptions::silent()))
    }

    fn start_locked(
        self: &Arc<Self>,
        lifecycle: &mut Lifecycle,
        options: StartOptions,
    ) -> Result<Duration, PollerError> {
        if lifecycle.cleaned_up {
            return Err(PollerError::CleanedUp {
                label: self.label().to_string(),
            });
        }

        let runtime = Handle::try_current()
            .ok()
            .or_else(|| lifecycle.runtime.clone())
            .ok_or_else(|| PollerError::NoRuntime {
                label: self.label().to_string(),
            })?;

        if let Some(timer) = lifecycle.timer.take() {
            timer.stop();
        }

        let interval = self.resolve_interval();
        let cancel = CancellationToken::new();
        let task = runtime.spawn(run_timer(Arc::downgrade(self), interval, cancel.clone()));

        lifecycle.timer = Some(Timer { cancel, task });
        lifecycle.interval = Some(interval);
        lifecycle.runtime = Some(runtime);

        if lifecycle.subscription.is_none() {
            if let Some(store) = &self.options.interval_store {
                let weak = Arc::downgrade(self);
                lifecycle.subscription = Some(store.on_change(move |change| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_interval_change(change.new);
                    }
                }));
            }
        }

        let interval_ms = interval.as_millis() as u64;
        if options.silent {
            debug!(label = %self.label(), interval_ms, "Poller restarted");
        } else {
            info!(
                label = %self.label(),
                interval_ms,
                adaptive = self.options.adaptive,
                "Poller started"
            );
        }

        Ok(interval)
    }

    fn stop(&self, options: StartOptions) {
        let timer = self.lifecycle.lock().timer.take();
        if let Some(timer) = timer {
            timer.stop();
            if options.silent {
                debug!(label = %self.label(), "Poller stopped");
            } else {
                info!(label = %self.label(), "Poller stopped");
            }
        }
    }

    fn cleanup(&self) {
        let (timer, subscription) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.cleaned_up {
                return;
            }
            lifecycle.cleaned_up = true;
            lifecycle.runtime = None;
            (lifecycle.timer.take(), lifecycle.subscription.take())
        };

        if let Some(timer) = timer {
            timer.stop();
        }
        if let (Some(handle), Some(store)) = (subscription, &self.options.interval_store) {
            store.remove_listener(handle);
        }
        debug!(label = %self.label(), "Poller cleaned up");
    }

    fn on_interval_change(self: &Arc<Self>, new: Duration) {
        match self.restart_if_active() {
            None => {}
            Some(Ok(_)) => debug!(
                label = %self.label(),
                interval_ms = new.as_millis() as u64,
                "Poll interval changed, poller restarted"
            ),
            Some(Err(e)) => {
                warn!(label = %self.label(), error = %e, "Failed to restart poller")
            }
        }
    }

    fn tick(self: &Arc<Self>) {
        if self.paused.load(Ordering::SeqCst) {
            trace!(label = %self.label(), "Poller paused, skipping tick");
            return;
        }

        let callback = Arc::clone(&self.callback);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(fut) => AssertUnwindSafe(fut)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("poll callback panicked"))),
                Err(_) => Err(anyhow::anyhow!("poll callback panicked")),
            };

            if let Some(shared) = weak.upgrade() {
                match outcome {
                    Ok(()) => shared.record_success(),
                    Err(e) => shared.record_failure(&e),
                }
            }
        });
    }

    fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
        *self.last_success.lock() = Some(Utc::now());
        if previous > 0 {
            debug!(
                label = %self.label(),
                previous_failures = previous,
                "Poll callback recovered"
            );
        }
    }

    fn record_failure(&self, err: &anyhow::Error) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        error!(
            label = %self.label(),
            consecutive_failures = failures,
            error = %format!("{err:#}"),
            "Poll callback failed"
        );
        if failures >= FAILURE_STREAK_THRESHOLD {
            // Reported only; the period is left unchanged.
            warn!(
                label = %self.label(),
                consecutive_failures = failures,
                "Poller failing repeatedly"
            );
        }
    }
}

async fn run_timer(shared: Weak<PollerShared>, period: Duration, cancel: CancellationToken) {
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => {}
        }

        match shared.upgrade() {
            Some(shared) => shared.tick(),
            None => break,
        }
    }
}
