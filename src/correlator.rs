//! Matches inbound responses to outstanding requests.
//!
//! The pending map is the only state shared between callers and the
//! background reader. Every register/deliver/timeout/close runs under one
//! mutex, and each waiter is woken through its own oneshot channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::protocol::JsonRpcResponse;
use crate::quirk::QuirkCompensator;

/// Terminal outcome handed to a waiter. Timeouts never travel through the
/// channel; the waiter observes them itself.
#[derive(Debug)]
enum Resolution {
    Fulfilled(JsonRpcResponse),
    ConnectionClosed,
}

#[derive(Debug)]
struct PendingEntry {
    method: String,
    submitted_at: Instant,
    waker: oneshot::Sender<Resolution>,
}

#[derive(Debug)]
struct CorrelatorState {
    pending: HashMap<u64, PendingEntry>,
    quirks: QuirkCompensator,
    closed: bool,
}

/// What [`Correlator::deliver`] did with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered { id: u64 },
    /// An id-0 error was attributed to request `id` and delivered to it.
    Repaired { id: u64 },
    /// No pending request matched; the response was discarded.
    Dropped { id: i64 },
}

/// Handle returned by [`Correlator::register`], consumed by
/// [`Correlator::wait`].
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    method: String,
    rx: oneshot::Receiver<Resolution>,
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

#[derive(Debug)]
pub struct Correlator {
    next_id: AtomicU64,
    state: Mutex<CorrelatorState>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Correlator {
    pub fn new(quirk_compensation: bool) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(CorrelatorState {
                pending: HashMap::new(),
                quirks: QuirkCompensator::new(quirk_compensation),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CorrelatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next request identifier. Starts at 1, never repeats.
    pub fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Track request `id` as in flight. Call right before sending it.
    pub fn register(&self, id: u64, method: &str) -> Result<PendingRequest, ClientError> {
        let mut state = self.lock();
        if state.closed {
            return Err(ClientError::ConnectionClosed {
                method: method.to_string(),
                id,
            });
        }
        if state.pending.contains_key(&id) {
            return Err(ClientError::DuplicateRequestId { id });
        }

        let (waker, rx) = oneshot::channel();
        state.pending.insert(
            id,
            PendingEntry {
                method: method.to_string(),
                submitted_at: Instant::now(),
                waker,
            },
        );
        state.quirks.note_sent(id);

        Ok(PendingRequest {
            id,
            method: method.to_string(),
            rx,
        })
    }

    /// Forget request `id` without resolving it, e.g. when sending failed.
    pub fn abandon(&self, id: u64) -> bool {
        let mut state = self.lock();
        let removed = state.pending.remove(&id).is_some();
        let CorrelatorState {
            pending, quirks, ..
        } = &mut *state;
        quirks.note_resolved(id, pending.keys().copied());
        removed
    }

    /// Hand `response` to whoever waits for its id.
    pub fn deliver(&self, mut response: JsonRpcResponse) -> Delivery {
        let mut state = self.lock();

        let repaired = state.quirks.repair(&mut response);
        if let Some(id) = repaired {
            tracing::warn!(
                id,
                pending = state.pending.len(),
                "error response carried id 0, attributing it to the last unresolved request"
            );
        }

        let entry = u64::try_from(response.id)
            .ok()
            .and_then(|id| state.pending.remove(&id).map(|entry| (id, entry)));

        let Some((id, entry)) = entry else {
            let allocated = self.next_id.load(Ordering::Relaxed);
            if response.id > 0 && (response.id as u64) < allocated {
                tracing::debug!(id = response.id, "dropping late response for a request no longer pending");
            } else {
                tracing::debug!(id = response.id, "dropping response for unknown id");
            }
            return Delivery::Dropped { id: response.id };
        };

        let CorrelatorState {
            pending, quirks, ..
        } = &mut *state;
        quirks.note_resolved(id, pending.keys().copied());
        tracing::trace!(
            id,
            method = %entry.method,
            elapsed_ms = entry.submitted_at.elapsed().as_millis() as u64,
            "response matched"
        );
        if entry.waker.send(Resolution::Fulfilled(response)).is_err() {
            tracing::debug!(id, "waiter went away before its response arrived");
        }

        match repaired {
            Some(_) => Delivery::Repaired { id },
            None => Delivery::Delivered { id },
        }
    }

    /// Wait until `pending` is answered, the connection closes, or `timeout`
    /// elapses. On timeout the entry is removed, so a late answer is dropped.
    ///
    /// Dropping the returned future also removes the entry.
    pub async fn wait(
        &self,
        pending: PendingRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, ClientError> {
        let PendingRequest { id, method, mut rx } = pending;
        let mut guard = AbandonOnDrop {
            correlator: self,
            id,
            armed: true,
        };

        let outcome = tokio::time::timeout(timeout, &mut rx).await;
        guard.armed = false;

        let resolution = match outcome {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Resolution::ConnectionClosed,
            Err(_) => {
                if self.abandon(id) {
                    tracing::debug!(id, method = %method, "request timed out");
                    return Err(ClientError::Timeout {
                        method,
                        id,
                        timeout,
                    });
                }
                // Resolved between the deadline and taking the lock.
                match rx.try_recv() {
                    Ok(resolution) => resolution,
                    Err(_) => {
                        return Err(ClientError::Timeout {
                            method,
                            id,
                            timeout,
                        })
                    }
                }
            }
        };

        match resolution {
            Resolution::Fulfilled(response) => Ok(response),
            Resolution::ConnectionClosed => Err(ClientError::ConnectionClosed { method, id }),
        }
    }

    /// Fail every outstanding request with `ConnectionClosed` and refuse new
    /// ones. Returns how many were outstanding.
    pub fn close_all(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        state.quirks = QuirkCompensator::new(state.quirks.is_enabled());

        let drained: Vec<(u64, PendingEntry)> = state.pending.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            tracing::debug!(id, method = %entry.method, "failing request: connection closed");
            let _ = entry.waker.send(Resolution::ConnectionClosed);
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.lock().pending.contains_key(&id)
    }

    /// The request an id-0 error would currently be attributed to.
    pub fn last_unresolved(&self) -> Option<u64> {
        self.lock().quirks.last_unresolved()
    }
}

struct AbandonOnDrop<'a> {
    correlator: &'a Correlator,
    id: u64,
    armed: bool,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.correlator.abandon(self.id);
        }
    }
}
