//! Repair for peers that answer failed requests with `"id": 0`.
//!
//! Some servers emit every error response with identifier `0` instead of the
//! id of the request that failed. Such a response is attributed to the most
//! recently sent request that is still unanswered. With several requests in
//! flight this can pick the wrong one; there is nothing in the message to do
//! better, so the guess is logged every time it is made.

use crate::protocol::JsonRpcResponse;

/// Identifier the defective peer puts on its error responses.
pub const DEFECT_ID: i64 = 0;

#[derive(Debug, Clone)]
pub struct QuirkCompensator {
    enabled: bool,
    last_unresolved: Option<u64>,
}

impl Default for QuirkCompensator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl QuirkCompensator {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last_unresolved: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn last_unresolved(&self) -> Option<u64> {
        self.last_unresolved
    }

    /// Record that request `id` has just been sent.
    pub fn note_sent(&mut self, id: u64) {
        self.last_unresolved = Some(id);
    }

    /// Record that request `id` reached a terminal outcome by other means.
    ///
    /// If it was the target, the target moves to the most recent request in
    /// `still_pending`. Ids are allocated in send order, so that is the
    /// highest one.
    pub fn note_resolved<I>(&mut self, id: u64, still_pending: I)
    where
        I: IntoIterator<Item = u64>,
    {
        if self.last_unresolved == Some(id) {
            self.last_unresolved = still_pending.into_iter().filter(|p| *p != id).max();
        }
    }

    /// Rewrite an id-0 error response to the last unresolved request.
    ///
    /// Returns the id it was attributed to. Results with id 0 and anything
    /// with another id pass through untouched.
    pub fn repair(&mut self, response: &mut JsonRpcResponse) -> Option<u64> {
        if !self.enabled || response.id != DEFECT_ID || !response.is_error() {
            return None;
        }
        let target = self.last_unresolved.take()?;
        response.id = target as i64;
        Some(target)
    }
}
