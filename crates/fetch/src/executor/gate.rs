//! Bounded-concurrency admission gate
//!
//! At most `max_concurrent` permits are outstanding at any time. Callers that
//! arrive while the gate is saturated wait in one of two FIFO queues; a freed
//! slot is handed directly to the oldest high-priority waiter, then the oldest
//! normal one.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Admission priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Admitted ahead of every queued normal request
    High,
    #[default]
    Normal,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
        }
    }
}

/// Point-in-time view of the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub active: usize,
    pub queued_high: usize,
    pub queued_normal: usize,
    pub max_concurrent: usize,
}

impl GateStats {
    pub fn queued(&self) -> usize {
        self.queued_high + self.queued_normal
    }
}

struct Waiter {
    enqueued_at: Instant,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct GateState {
    active: usize,
    high: VecDeque<Waiter>,
    normal: VecDeque<Waiter>,
}

impl GateState {
    fn pop_next(&mut self) -> Option<(Priority, Waiter)> {
        if let Some(waiter) = self.high.pop_front() {
            return Some((Priority::High, waiter));
        }
        self.normal.pop_front().map(|w| (Priority::Normal, w))
    }
}

/// Admission control shared by every request of a client
///
/// # Example
///
/// ```ignore
/// let gate = ConcurrencyGate::new(4);
///
/// let permit = gate.admit(Priority::High).await;
/// // ... perform the request ...
/// drop(permit); // hands the slot to the next waiter
/// ```
pub struct ConcurrencyGate {
    max_concurrent: usize,
    state: Mutex<GateState>,
}

impl ConcurrencyGate {
    /// Create a gate allowing `max_concurrent` holders (at least one)
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(GateState::default()),
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Take a slot immediately if one is free
    pub fn try_admit(self: &Arc<Self>) -> Option<GatePermit> {
        let mut state = self.state.lock();
        if state.active < self.max_concurrent {
            state.active += 1;
            Some(GatePermit::new(Arc::clone(self)))
        } else {
            None
        }
    }

    /// Wait for a slot
    ///
    /// Resolves immediately while the gate is below its limit; otherwise the
    /// caller is queued under `priority`. Dropping the returned future gives
    /// up the place in the queue (and any slot already handed over).
    pub fn admit(self: &Arc<Self>, priority: Priority) -> Admission {
        let mut state = self.state.lock();
        if state.active < self.max_concurrent {
            state.active += 1;
            trace!(active = state.active, "Slot granted immediately");
            return Admission::ready(GatePermit::new(Arc::clone(self)));
        }

        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            enqueued_at: Instant::now(),
            tx,
        };
        match priority {
            Priority::High => state.high.push_back(waiter),
            Priority::Normal => state.normal.push_back(waiter),
        }
        debug!(
            %priority,
            active = state.active,
            queued_high = state.high.len(),
            queued_normal = state.normal.len(),
            "Gate saturated, request queued"
        );

        Admission::waiting(Arc::clone(self), rx)
    }

    /// Current counters
    pub fn stats(&self) -> GateStats {
        let state = self.state.lock();
        GateStats {
            active: state.active,
            queued_high: state.high.len(),
            queued_normal: state.normal.len(),
            max_concurrent: self.max_concurrent,
        }
    }

    /// Return a slot, handing it to the next live waiter if there is one
    fn release(&self) {
        let mut state = self.state.lock();
        while let Some((priority, waiter)) = state.pop_next() {
            let waited = waiter.enqueued_at.elapsed();
            if waiter.tx.send(()).is_ok() {
                debug!(
                    %priority,
                    waited_ms = waited.as_millis() as u64,
                    "Queued request admitted"
                );
                return;
            }
            trace!(%priority, "Skipping abandoned waiter");
        }
        state.active = state.active.saturating_sub(1);
    }

    /// Drop queued waiters whose admission future is gone
    fn forget_abandoned(&self) {
        let mut state = self.state.lock();
        state.high.retain(|w| !w.tx.is_closed());
        state.normal.retain(|w| !w.tx.is_closed());
    }
}

/// Holder of one gate slot; the slot is released on drop
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
}

impl GatePermit {
    fn new(gate: Arc<ConcurrencyGate>) -> Self {
        Self { gate }
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl std::fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePermit").finish_non_exhaustive()
    }
}

/// Future returned by [`ConcurrencyGate::admit`]
pub struct Admission {
    gate: Arc<ConcurrencyGate>,
    ready: Option<GatePermit>,
    rx: Option<oneshot::Receiver<()>>,
}

impl Admission {
    fn ready(permit: GatePermit) -> Self {
        Self {
            gate: Arc::clone(&permit.gate),
            ready: Some(permit),
            rx: None,
        }
    }

    fn waiting(gate: Arc<ConcurrencyGate>, rx: oneshot::Receiver<()>) -> Self {
        Self {
            gate,
            ready: None,
            rx: Some(rx),
        }
    }
}

impl Future for Admission {
    type Output = GatePermit;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(permit) = self.ready.take() {
            return Poll::Ready(permit);
        }

        let Some(rx) = self.rx.as_mut() else {
            // Polled after completion; never resolves again.
            return Poll::Pending;
        };

        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(())) => {
                self.rx = None;
                Poll::Ready(GatePermit::new(Arc::clone(&self.gate)))
            }
            // The sender lives in the gate queue and is only dropped after a
            // successful send or when the gate itself goes away.
            Poll::Ready(Err(_)) => {
                self.rx = None;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            // A slot may have been handed over between the last poll and now.
            if rx.try_recv().is_ok() {
                self.gate.release();
            } else {
                self.gate.forget_abandoned();
            }
        }
    }
}
