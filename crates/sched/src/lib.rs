// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Single-threaded cooperative scheduling primitives.
//!
//! One [`JobQueue`] per runtime owns every timer: observe triggers, flush
//! jobs, download starts and deferred cleanups. Jobs never run concurrently;
//! the owner drains due jobs from its event loop, typically racing
//! [`JobQueue::next_expiry`] against inbound traffic with
//! `tokio::select! { biased; ... }`.
//!
//! Timers are kept in a binary heap of `(deadline, handle)` pairs; cancelled
//! entries stay in the heap as tombstones and are skipped on pop, so
//! cancellation is O(1).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use tokio::time::Instant;

/// Handle to a scheduled timer job, used for cancellation and deadline
/// queries. Handles are never reused within one queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobHandle(u64);

struct TimerEntry<J> {
    job: J,
    at: Instant,
}

/// A FIFO of immediately-runnable jobs plus a set of one-shot timers.
pub struct JobQueue<J> {
    timers: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, TimerEntry<J>>,
    ready: VecDeque<J>,
    next_handle: u64,
}

impl<J> Default for JobQueue<J> {
    fn default() -> Self {
        JobQueue::new()
    }
}

impl<J> JobQueue<J> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> JobQueue<J> {
        JobQueue {
            timers: BinaryHeap::new(),
            entries: HashMap::new(),
            ready: VecDeque::new(),
            next_handle: 0,
        }
    }

    /// Enqueues a job to run on the next drain, after already-queued
    /// immediate jobs.
    pub fn schedule_now(&mut self, job: J) {
        self.ready.push_back(job);
    }

    /// Schedules a one-shot job for `at`.
    pub fn schedule_at(&mut self, at: Instant, job: J) -> JobHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.timers.push(Reverse((at, handle)));
        let _ = self.entries.insert(handle, TimerEntry { job, at });
        JobHandle(handle)
    }

    /// Cancels a timer job. Returns `false` if it already ran or was
    /// cancelled before.
    pub fn cancel(&mut self, handle: JobHandle) -> bool {
        self.entries.remove(&handle.0).is_some()
    }

    /// The deadline of a still-pending timer job.
    #[must_use]
    pub fn scheduled_at(&self, handle: JobHandle) -> Option<Instant> {
        self.entries.get(&handle.0).map(|entry| entry.at)
    }

    /// True iff at least one immediate job is queued.
    #[must_use]
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// The earliest live timer deadline, if any. Tombstones left by
    /// [`cancel`](JobQueue::cancel) are pruned on the way.
    pub fn next_expiry(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, handle))) = self.timers.peek().copied() {
            if self.entries.contains_key(&handle) {
                return Some(at);
            }
            let _ = self.timers.pop();
        }
        None
    }

    /// Pops the next runnable job: immediate jobs first, then timers due at
    /// or before `now`, in deadline order.
    pub fn pop_due(&mut self, now: Instant) -> Option<J> {
        if let Some(job) = self.ready.pop_front() {
            return Some(job);
        }
        while let Some(Reverse((at, handle))) = self.timers.peek().copied() {
            if at > now {
                break;
            }
            let _ = self.timers.pop();
            if let Some(entry) = self.entries.remove(&handle) {
                return Some(entry.job);
            }
        }
        None
    }

    /// True iff no job is queued or scheduled.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.entries.is_empty()
    }
}

/// Earliest of two optional deadlines; used when one event loop drives
/// several queues.
#[must_use]
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
