// src/rabbitmq/pending.rs
// Outstanding RPC calls keyed by correlation id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::errors::{MessagingError, Result};

pub(crate) type ReplySlot = oneshot::Sender<Result<Vec<u8>>>;

struct PendingCall {
    reply: ReplySlot,
    created_at: Instant,
}

#[derive(Default)]
struct State {
    calls: HashMap<String, PendingCall>,
    // Set once the dispatcher has stopped; no new call may register after that.
    closed: Option<String>,
}

#[derive(Default)]
pub(crate) struct PendingCalls {
    state: Mutex<State>,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, correlation_id: &str) -> Result<oneshot::Receiver<Result<Vec<u8>>>> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(MessagingError::unavailable(reason.clone()));
        }
        let (reply, receiver) = oneshot::channel();
        state.calls.insert(
            correlation_id.to_string(),
            PendingCall {
                reply,
                created_at: Instant::now(),
            },
        );
        Ok(receiver)
    }

    /// Hands `body` to the call waiting on `correlation_id`. Returns the
    /// call's age, or `None` when nobody is waiting for that id.
    pub(crate) fn resolve(&self, correlation_id: &str, body: Vec<u8>) -> Option<Duration> {
        let call = self.lock().calls.remove(correlation_id)?;
        // The caller may have given up between our lookup and this send.
        let _ = call.reply.send(Ok(body));
        Some(call.created_at.elapsed())
    }

    pub(crate) fn forget(&self, correlation_id: &str) {
        self.lock().calls.remove(correlation_id);
    }

    /// Fails every outstanding call and refuses new ones.
    pub(crate) fn close(&self, reason: &str) -> usize {
        let calls: Vec<PendingCall> = {
            let mut state = self.lock();
            state.closed = Some(reason.to_string());
            state.calls.drain().map(|(_, call)| call).collect()
        };
        let failed = calls.len();
        for call in calls {
            let _ = call.reply.send(Err(MessagingError::unavailable(reason)));
        }
        failed
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().calls.len()
    }
}

/// Removes its call from the map when the waiting caller goes away, whether
/// it returned, timed out, or had its future dropped.
pub(crate) struct PendingGuard<'a> {
    calls: &'a PendingCalls,
    correlation_id: String,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(calls: &'a PendingCalls, correlation_id: String) -> Self {
        Self {
            calls,
            correlation_id,
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.calls.forget(&self.correlation_id);
    }
}
