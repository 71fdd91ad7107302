//! Outstanding outbound calls, keyed by message id.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Error half of a CallError frame, handed to the error continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct CallErrorInfo {
    pub code: String,
    pub description: String,
    pub details: Value,
}

// `Sync` keeps `PendingCalls` shareable across the transport tasks.
type SuccessFn = Box<dyn FnOnce(Value) + Send + Sync>;
type ErrorFn = Box<dyn FnOnce(CallErrorInfo) + Send + Sync>;

/// Success and error handlers for one call. Consumed by whichever fires;
/// an evicted call drops both without running either.
pub struct Continuation {
    on_success: SuccessFn,
    on_error: ErrorFn,
}

impl Continuation {
    pub fn new(
        on_success: impl FnOnce(Value) + Send + Sync + 'static,
        on_error: impl FnOnce(CallErrorInfo) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        }
    }

    /// Fire-and-forget: the result is discarded.
    pub fn ignore() -> Self {
        Self::new(|_| {}, |_| {})
    }

    /// Continuation that forwards the outcome to a oneshot receiver. The
    /// receiver sees `RecvError` if the call is evicted.
    pub fn channel() -> (Self, oneshot::Receiver<Result<Value, CallErrorInfo>>) {
        let (tx, rx) = oneshot::channel();
        // Both halves need the sender; whichever runs takes it.
        let shared = Arc::new(Mutex::new(Some(tx)));
        let on_err_sender = shared.clone();

        let continuation = Self::new(
            move |payload| {
                if let Some(tx) = shared.lock().ok().and_then(|mut s| s.take()) {
                    let _ = tx.send(Ok(payload));
                }
            },
            move |error| {
                if let Some(tx) = on_err_sender.lock().ok().and_then(|mut s| s.take()) {
                    let _ = tx.send(Err(error));
                }
            },
        );
        (continuation, rx)
    }

    pub fn succeed(self, payload: Value) {
        (self.on_success)(payload)
    }

    pub fn fail(self, error: CallErrorInfo) {
        (self.on_error)(error)
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Continuation")
    }
}

#[derive(Debug)]
pub struct PendingCall {
    pub action: String,
    pub payload: Value,
    pub sent_at: Instant,
    pub continuation: Continuation,
}

/// Registry shared by the writer (insert), reader (take) and sweeper
/// (evict). Removal is atomic per key, so each entry is taken by exactly
/// one of them.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: DashMap<String, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call. Returns the call back if the id is already pending.
    pub fn insert(&self, message_id: String, call: PendingCall) -> Result<(), PendingCall> {
        match self.calls.entry(message_id) {
            Entry::Occupied(_) => Err(call),
            Entry::Vacant(slot) => {
                slot.insert(call);
                Ok(())
            }
        }
    }

    pub fn take(&self, message_id: &str) -> Option<PendingCall> {
        self.calls.remove(message_id).map(|(_, call)| call)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.calls.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Drop every pending call without running any continuation.
    pub fn clear(&self) {
        self.calls.clear();
    }

    /// Remove every call older than `timeout` at `now`, dropping its
    /// continuation unrun. Returns `(message_id, action)` of each.
    pub fn evict_expired(&self, now: Instant, timeout: Duration) -> Vec<(String, String)> {
        let expired: Vec<String> = self
            .calls
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.sent_at) > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                // Re-check under the shard lock; a result may have raced us.
                self.calls
                    .remove_if(&id, |_, call| {
                        now.saturating_duration_since(call.sent_at) > timeout
                    })
                    .map(|(id, call)| (id, call.action))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn call(action: &str, sent_at: Instant, continuation: Continuation) -> PendingCall {
        PendingCall {
            action: action.into(),
            payload: json!({}),
            sent_at,
            continuation,
        }
    }

    #[test]
    fn duplicate_id_is_refused() {
        let pending = PendingCalls::new();
        let now = Instant::now();
        assert!(pending
            .insert("a".into(), call("Heartbeat", now, Continuation::ignore()))
            .is_ok());
        assert!(pending
            .insert("a".into(), call("Heartbeat", now, Continuation::ignore()))
            .is_err());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn take_removes_entry_exactly_once() {
        let pending = PendingCalls::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        pending
            .insert(
                "a".into(),
                call(
                    "Authorize",
                    Instant::now(),
                    Continuation::new(
                        move |_| {
                            h.fetch_add(1, Ordering::SeqCst);
                        },
                        |_| panic!("error continuation must not run"),
                    ),
                ),
            )
            .unwrap();

        pending.take("a").unwrap().continuation.succeed(json!({}));
        assert!(pending.take("a").is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn eviction_only_removes_expired_calls() {
        let pending = PendingCalls::new();
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        pending
            .insert("old".into(), call("Heartbeat", start, Continuation::ignore()))
            .unwrap();
        pending
            .insert(
                "new".into(),
                call("Heartbeat", start + Duration::from_secs(8), Continuation::ignore()),
            )
            .unwrap();

        let evicted = pending.evict_expired(start + Duration::from_secs(11), timeout);
        assert_eq!(evicted, vec![("old".to_string(), "Heartbeat".to_string())]);
        assert!(!pending.contains("old"));
        assert!(pending.contains("new"));
    }

    #[tokio::test]
    async fn evicted_channel_continuation_closes_receiver() {
        let pending = PendingCalls::new();
        let (continuation, rx) = Continuation::channel();
        let start = Instant::now();
        pending
            .insert("a".into(), call("Authorize", start, continuation))
            .unwrap();

        pending.evict_expired(start + Duration::from_secs(2), Duration::from_secs(1));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn channel_continuation_forwards_error() {
        let (continuation, rx) = Continuation::channel();
        continuation.fail(CallErrorInfo {
            code: "InternalError".into(),
            description: "boom".into(),
            details: json!({}),
        });
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.unwrap_err().code, "InternalError");
    }
}
