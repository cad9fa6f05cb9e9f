//! Per-key FIFO mailbox with lost-wakeup-free kicking.
//!
//! Enqueue is multi-producer; dequeue happens only inside the key's runner.
//! The kick discipline eliminates lost wakeups:
//!
//! 1. Producers set `kick_pending` *before* enqueueing, then try to claim
//!    the runner slot (an atomic false→true on `active`). Exactly one
//!    producer wins and spawns the runner.
//! 2. The runner clears `kick_pending` on entry, drains the queue, and on
//!    release re-checks both the queue and `kick_pending`. If either shows
//!    work it re-claims the slot and keeps draining instead of returning.
//!
//! Together this guarantees at most one consumer per key, a full drain
//! before release, and that empty→non-empty transitions always wake a
//! runner.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::job::Job;

/// FIFO job queue for one execution key.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: Mutex<VecDeque<Job>>,
    active: AtomicBool,
    kick_pending: AtomicBool,
}

impl Mailbox {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job. Returns `true` when the caller has claimed the runner
    /// slot and must start a runner for this key.
    pub fn enqueue_and_kick(&self, job: Job) -> bool {
        self.kick_pending.store(true, Ordering::Release);
        self.lock().push_back(job);
        self.try_claim()
    }

    /// Re-queue deferred jobs at the front, preserving their order.
    pub fn requeue_front(&self, jobs: VecDeque<Job>) {
        let mut queue = self.lock();
        for job in jobs.into_iter().rev() {
            queue.push_front(job);
        }
    }

    /// Runner entry: clear the pending kick.
    pub fn begin_drain(&self) {
        self.kick_pending.store(false, Ordering::Release);
    }

    /// Single-consumer dequeue (runner only).
    pub fn pop(&self) -> Option<Job> {
        self.lock().pop_front()
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no jobs are queued.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Release the runner slot. Returns `true` when the runner must continue
    /// draining because work arrived during release.
    pub fn release(&self) -> bool {
        self.active.store(false, Ordering::Release);
        let has_work = self.kick_pending.load(Ordering::Acquire) || !self.is_empty();
        has_work && self.try_claim()
    }

    fn try_claim(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Job>> {
        // A poisoned queue mutex only means a panic mid-push; the queue
        // itself is still structurally sound.
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
