//! Admission control: bounded concurrency with a bounded FIFO wait queue.
//!
//! `max_in_flight` permits live in a fair `tokio::sync::Semaphore`, so waiters are admitted in
//! arrival order. A request that cannot get a permit right away joins the queue if fewer than
//! `max_queue` requests are already waiting, otherwise it is rejected on the spot. A queued
//! request gives up after `enqueue_timeout`; dropping its acquire future removes it from the
//! semaphore's wait list without disturbing anybody else.
//!
//! The [`AdmissionSlot`] returned on success owns the permit and hands it back when dropped,
//! which covers success, failure, and cancellation alike.

use crate::error::GuardError;
use crate::events::{EventBus, GuardEvent, RequestRejected};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Ownership of one in-flight permit. Released exactly once, on drop.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}

/// Decrements the queued counter when a waiter leaves the queue, however it leaves.
struct QueuedGuard<'a>(&'a AtomicUsize);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    max_in_flight: usize,
    max_queue: usize,
    enqueue_timeout: Duration,
    events: EventBus,
}

impl AdmissionController {
    pub fn new(
        max_in_flight: usize,
        max_queue: usize,
        enqueue_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            queued: Arc::new(AtomicUsize::new(0)),
            max_in_flight,
            max_queue,
            enqueue_timeout,
            events,
        }
    }

    /// Requests currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight.saturating_sub(self.semaphore.available_permits())
    }

    /// Requests currently waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Wait for a slot on behalf of `request_id`.
    ///
    /// Emits `request:rejected` before returning an error.
    ///
    /// # Errors
    /// [`GuardError::Rejected`] when the queue is full, [`GuardError::QueueTimeout`] when the
    /// enqueue timeout elapses first.
    pub async fn admit(&self, request_id: u64) -> Result<AdmissionSlot, GuardError> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(AdmissionSlot { _permit: permit });
        }

        let Some(_queued) = self.enter_queue() else {
            let err =
                GuardError::Rejected { queued: self.queued(), max_queue: self.max_queue };
            return Err(self.rejected(request_id, err, Duration::ZERO));
        };

        let started = Instant::now();
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        match tokio::time::timeout(self.enqueue_timeout, acquire).await {
            Ok(Ok(permit)) => {
                tracing::trace!(request_id, waited = ?started.elapsed(), "admitted from queue");
                Ok(AdmissionSlot { _permit: permit })
            }
            Ok(Err(_closed)) => {
                let err =
                    GuardError::Rejected { queued: self.queued(), max_queue: self.max_queue };
                Err(self.rejected(request_id, err, started.elapsed()))
            }
            Err(_elapsed) => {
                let waited = started.elapsed();
                let err = GuardError::QueueTimeout { waited, limit: self.enqueue_timeout };
                Err(self.rejected(request_id, err, waited))
            }
        }
    }

    /// Wait for a slot with no queue bound and no enqueue timeout. Used by probes, which must
    /// get through while ordinary traffic is being shed.
    pub async fn admit_probe(&self) -> Option<AdmissionSlot> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .ok()
            .map(|permit| AdmissionSlot { _permit: permit })
    }

    fn enter_queue(&self) -> Option<QueuedGuard<'_>> {
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < self.max_queue).then_some(queued + 1)
            })
            .ok()
            .map(|_| QueuedGuard(&self.queued))
    }

    fn rejected(&self, request_id: u64, error: GuardError, waited: Duration) -> GuardError {
        tracing::debug!(request_id, kind = %error.kind(), ?waited, "admission refused");
        self.events.emit(GuardEvent::RequestRejected(RequestRejected {
            request_id,
            kind: error.kind(),
            error: error.clone(),
            waited,
        }));
        error
    }
}
