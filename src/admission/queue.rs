//! Per-provider priority queue of requests waiting for admission.
//!
//! Ordered by descending priority, then by arrival. A new waiter is placed
//! behind every waiter of equal or higher priority, so equal priorities are
//! served first-in-first-out.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::AdmissionError;

/// Sender half used to hand a waiter its admission verdict.
pub(crate) type Verdict = oneshot::Sender<Result<(), AdmissionError>>;

/// A caller waiting for admission.
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub(crate) request_id: String,
    pub(crate) priority: i32,
    pub(crate) enqueued_at: Instant,
    /// Queue-wait deadline (`enqueued_at + request_timeout`).
    pub(crate) deadline: Instant,
    pub(crate) verdict: Verdict,
}

impl QueuedRequest {
    /// Resolve the waiter. Returns `false` if the caller is no longer listening.
    pub(crate) fn resolve(self, result: Result<(), AdmissionError>) -> bool {
        self.verdict.send(result).is_ok()
    }
}

#[derive(Debug, Default)]
pub(crate) struct AdmissionQueue {
    waiters: VecDeque<QueuedRequest>,
}

impl AdmissionQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn contains(&self, request_id: &str) -> bool {
        self.waiters.iter().any(|w| w.request_id == request_id)
    }

    /// Insert a waiter and return the receiver its verdict arrives on.
    pub(crate) fn push(
        &mut self,
        request_id: String,
        priority: i32,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<(), AdmissionError>> {
        let (verdict, rx) = oneshot::channel();
        let now = Instant::now();
        let position = self
            .waiters
            .iter()
            .position(|w| w.priority < priority)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(
            position,
            QueuedRequest {
                request_id,
                priority,
                enqueued_at: now,
                deadline: now + timeout,
                verdict,
            },
        );
        rx
    }

    /// Highest priority, oldest waiter.
    pub(crate) fn pop_front(&mut self) -> Option<QueuedRequest> {
        self.waiters.pop_front()
    }

    /// Lowest priority, newest waiter.
    pub(crate) fn pop_back(&mut self) -> Option<QueuedRequest> {
        self.waiters.pop_back()
    }

    pub(crate) fn remove(&mut self, request_id: &str) -> Option<QueuedRequest> {
        let index = self.waiters.iter().position(|w| w.request_id == request_id)?;
        self.waiters.remove(index)
    }

    /// Remove every waiter whose deadline has passed or that has waited
    /// longer than `max_wait`.
    pub(crate) fn take_expired(&mut self, now: Instant, max_wait: Duration) -> Vec<QueuedRequest> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.waiters.len());
        for waiter in self.waiters.drain(..) {
            if waiter.deadline <= now || now.duration_since(waiter.enqueued_at) > max_wait {
                expired.push(waiter);
            } else {
                kept.push_back(waiter);
            }
        }
        self.waiters = kept;
        expired
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = QueuedRequest> + '_ {
        self.waiters.drain(..)
    }

    /// Age of the oldest waiter, if any.
    pub(crate) fn oldest_wait(&self, now: Instant) -> Option<Duration> {
        self.waiters
            .iter()
            .map(|w| now.duration_since(w.enqueued_at))
            .max()
    }
}
