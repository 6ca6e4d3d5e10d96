//! Bulkhead pattern for limiting concurrent operations
//!
//! At most `capacity` operations run at once. Further calls wait in a FIFO
//! queue of at most `queue_capacity` entries, and anything beyond that is
//! rejected immediately. A finishing call hands its execution slot straight
//! to the oldest waiter still interested in it, so slot counts stay exact
//! and queued calls start in submission order.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::BulkheadConfig;
use crate::error::{ConfigResult, ResilienceError, ResilienceResult};
use crate::events::{ListenerHandle, Listeners, SuccessEvent};

/// Emitted when a call is turned away because slots and queue are full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadRejectedEvent {
    /// Configured execution slots
    pub capacity: usize,
    /// Configured queue entries
    pub queue_capacity: usize,
}

/// Emitted when an admitted operation returned an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadFailureEvent {
    /// Time spent in the operation
    pub duration: Duration,
}

struct QueuedCall {
    ticket: u64,
    admit: oneshot::Sender<SlotPermit>,
}

#[derive(Default)]
struct Slots {
    active: usize,
    queue: VecDeque<QueuedCall>,
    next_ticket: u64,
}

struct BulkheadInner {
    capacity: usize,
    queue_capacity: usize,
    slots: Mutex<Slots>,
    on_reject: Listeners<BulkheadRejectedEvent>,
    on_success: Listeners<SuccessEvent>,
    on_failure: Listeners<BulkheadFailureEvent>,
}

impl BulkheadInner {
    /// Give a freed slot to the oldest live waiter, or return it
    fn release(self: &Arc<Self>) {
        loop {
            let waiter = {
                let mut slots = self.slots.lock();
                match slots.queue.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        slots.active = slots.active.saturating_sub(1);
                        return;
                    }
                }
            };

            // The slot moves to the waiter, so `active` is unchanged.
            match waiter.admit.send(SlotPermit::new(Arc::clone(self))) {
                Ok(()) => return,
                Err(permit) => permit.disarm(),
            }
        }
    }
}

/// An occupied execution slot, released on drop
struct SlotPermit {
    inner: Option<Arc<BulkheadInner>>,
}

impl SlotPermit {
    fn new(inner: Arc<BulkheadInner>) -> Self {
        Self { inner: Some(inner) }
    }

    /// Forget the slot without releasing it
    fn disarm(mut self) {
        self.inner = None;
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

/// Removes a waiter's queue entry if it stops waiting before being admitted
struct QueueGuard<'a> {
    inner: &'a BulkheadInner,
    ticket: u64,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.inner.slots.lock().queue.retain(|call| call.ticket != self.ticket);
    }
}

enum Admission {
    Run(SlotPermit),
    Queued(u64, oneshot::Receiver<SlotPermit>),
    Rejected,
}

/// Concurrency limiter with a bounded FIFO queue
///
/// Cloning is cheap and clones share slots and queue.
///
/// # Examples
///
/// ```rust
/// use keelson_policy::{Bulkhead, BulkheadConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bulkhead = Bulkhead::new(BulkheadConfig { capacity: 2, queue_capacity: 4 })?;
///
/// let value = bulkhead.execute(|_| async { Ok::<_, std::io::Error>(3) }).await?;
/// assert_eq!(value, 3);
/// assert_eq!(bulkhead.execution_slots(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Bulkhead {
    inner: Arc<BulkheadInner>,
}

impl Bulkhead {
    /// Create a bulkhead, validating its limits
    pub fn new(config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(BulkheadInner {
                capacity: config.capacity,
                queue_capacity: config.queue_capacity,
                slots: Mutex::new(Slots::default()),
                on_reject: Listeners::new(),
                on_success: Listeners::new(),
                on_failure: Listeners::new(),
            }),
        })
    }

    /// Maximum calls running at once
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Maximum calls waiting for a slot
    pub fn queue_capacity(&self) -> usize {
        self.inner.queue_capacity
    }

    /// Execution slots currently free
    pub fn execution_slots(&self) -> usize {
        self.inner.capacity.saturating_sub(self.inner.slots.lock().active)
    }

    /// Queue entries currently free
    pub fn queue_slots(&self) -> usize {
        self.inner.queue_capacity.saturating_sub(self.inner.slots.lock().queue.len())
    }

    /// Called with the configured limits whenever a call is rejected
    pub fn on_reject<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&BulkheadRejectedEvent) + Send + Sync + 'static,
    {
        self.inner.on_reject.add(listener)
    }

    /// Called after every successful call
    pub fn on_success<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&SuccessEvent) + Send + Sync + 'static,
    {
        self.inner.on_success.add(listener)
    }

    /// Called after every failed call
    pub fn on_failure<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&BulkheadFailureEvent) + Send + Sync + 'static,
    {
        self.inner.on_failure.add(listener)
    }

    /// Run `operation` once a slot is free
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.execute_with_cancellation(operation, &CancellationToken::new()).await
    }

    /// Run `operation` under a token derived from `parent`
    ///
    /// Cancellation is checked on submission, while queued and again when
    /// a queued call is handed its slot.
    #[instrument(skip_all, fields(capacity = self.inner.capacity))]
    pub async fn execute_with_cancellation<F, Fut, T, E>(
        &self,
        operation: F,
        parent: &CancellationToken,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let token = parent.child_token();
        if token.is_cancelled() {
            return Err(ResilienceError::TaskCancelled);
        }

        let permit = match self.admit() {
            Admission::Run(permit) => permit,
            Admission::Rejected => return Err(self.reject()),
            Admission::Queued(ticket, admitted) => {
                let _guard = QueueGuard { inner: &self.inner, ticket };
                let received = tokio::select! {
                    biased;
                    () = token.cancelled() => return Err(ResilienceError::TaskCancelled),
                    received = admitted => received,
                };
                let Ok(permit) = received else {
                    return Err(self.reject());
                };
                if token.is_cancelled() {
                    debug!("Queued call cancelled before it could start");
                    return Err(ResilienceError::TaskCancelled);
                }
                permit
            }
        };

        let started = tokio::time::Instant::now();
        let result = operation(token).await;
        let duration = started.elapsed();
        drop(permit);

        match result {
            Ok(value) => {
                self.inner.on_success.emit(&SuccessEvent { duration });
                Ok(value)
            }
            Err(source) => {
                self.inner.on_failure.emit(&BulkheadFailureEvent { duration });
                Err(ResilienceError::OperationFailed { source })
            }
        }
    }

    fn admit(&self) -> Admission {
        let mut slots = self.inner.slots.lock();
        if slots.active < self.inner.capacity {
            slots.active += 1;
            drop(slots);
            return Admission::Run(SlotPermit::new(Arc::clone(&self.inner)));
        }
        if slots.queue.len() < self.inner.queue_capacity {
            let (admit, admitted) = oneshot::channel();
            let ticket = slots.next_ticket;
            slots.next_ticket += 1;
            slots.queue.push_back(QueuedCall { ticket, admit });
            debug!("Bulkhead full, queued call (position {})", slots.queue.len());
            return Admission::Queued(ticket, admitted);
        }
        Admission::Rejected
    }

    fn reject<E>(&self) -> ResilienceError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let event = BulkheadRejectedEvent {
            capacity: self.inner.capacity,
            queue_capacity: self.inner.queue_capacity,
        };
        warn!(
            "Bulkhead rejected call: {} executions and {} queued in use",
            event.capacity, event.queue_capacity
        );
        self.inner.on_reject.emit(&event);
        ResilienceError::BulkheadRejected {
            capacity: event.capacity,
            queue_capacity: event.queue_capacity,
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.inner.slots.lock();
        f.debug_struct("Bulkhead")
            .field("capacity", &self.inner.capacity)
            .field("queue_capacity", &self.inner.queue_capacity)
            .field("active", &slots.active)
            .field("queued", &slots.queue.len())
            .finish()
    }
}
