//! Correlation registry matching inbound replies to pending calls.
//!
//! Every outgoing call registers its correlation id here together with the
//! callback that should observe the replies. The reply listener routes each
//! inbound [`Response`] through [`RequestMatcher::complete`]; a timeout
//! watchdog races it through [`RequestMatcher::expire`]. Removal from the map
//! is the single point of mutual exclusion: whichever of the two wins the
//! removal is the only one permitted to invoke the callback with a terminal
//! result, so a late reply and a timeout can never both fire.

use crate::error::RpcError;
use chrono::{DateTime, Utc};
use devicemesh_core::Response;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

/// Callback observing the responses of one pending call.
///
/// Invoked once for a single-reply call, repeatedly for a streaming call.
/// Always invoked from a bus-listener or watchdog task, never from the
/// caller's own task.
pub type ResponseCallback = Arc<dyn Fn(Response) + Send + Sync>;

/// One pending call. Owned exclusively by the matcher for its lifetime.
struct Entry {
    callback: ResponseCallback,
    single_reply: bool,
    created_at: DateTime<Utc>,
}

/// Thread-safe store of pending calls keyed by correlation id.
///
/// Safe for concurrent use without external locking. Callbacks are always
/// invoked *outside* the internal lock, so a callback may itself issue new
/// calls without deadlocking.
#[derive(Default)]
pub struct RequestMatcher {
    entries: Mutex<HashMap<String, Entry>>,
}

impl RequestMatcher {
    /// Create an empty matcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panicking callback can never poison this lock (callbacks run
        // outside it); recover the map rather than propagate the poison.
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a pending call.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::DuplicateCorrelationId`] if the id is already
    /// tracked. Ids are uuid-generated, so this only fires on caller misuse.
    pub fn register(
        &self,
        correlation_id: &str,
        callback: ResponseCallback,
        single_reply: bool,
    ) -> Result<(), RpcError> {
        let mut entries = self.lock();
        if entries.contains_key(correlation_id) {
            return Err(RpcError::DuplicateCorrelationId(correlation_id.to_owned()));
        }
        let previous = entries.insert(
            correlation_id.to_owned(),
            Entry {
                callback,
                single_reply,
                created_at: Utc::now(),
            },
        );
        debug_assert!(previous.is_none());
        Ok(())
    }

    /// Deliver an inbound response to its pending call.
    ///
    /// Returns `false` when no entry matches — the caller treats that as an
    /// orphan reply and drops it. When the response is terminal (the entry
    /// expects a single reply, or `response.last` is set) the entry is removed
    /// before the callback runs; otherwise it stays registered for further
    /// parts.
    pub fn complete(&self, response: Response) -> bool {
        let callback = {
            let mut entries = self.lock();
            let Some(entry) = entries.get(&response.correlation_id) else {
                return false;
            };
            if entry.single_reply || response.last {
                entries
                    .remove(&response.correlation_id)
                    .map(|entry| entry.callback)
            } else {
                Some(Arc::clone(&entry.callback))
            }
        };
        match callback {
            Some(callback) => {
                callback(response);
                true
            }
            None => false,
        }
    }

    /// Expire a pending call, delivering a synthetic timeout failure.
    ///
    /// Returns `false` when the entry is already gone — the call completed or
    /// was cancelled first, and no callback is invoked.
    pub fn expire(&self, correlation_id: &str) -> bool {
        let entry = self.lock().remove(correlation_id);
        match entry {
            Some(entry) => {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    pending_ms = (Utc::now() - entry.created_at).num_milliseconds(),
                    "expiring pending call"
                );
                (entry.callback)(Response::timeout(correlation_id));
                true
            }
            None => false,
        }
    }

    /// Remove a pending call without invoking its callback.
    ///
    /// Caller-initiated cancellation, and cleanup when the publish that should
    /// have produced replies failed. Returns whether an entry was removed.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.lock().remove(correlation_id).is_some()
    }

    /// Number of calls currently awaiting replies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no calls are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Adapt a `oneshot` channel into a [`ResponseCallback`].
///
/// The first response is sent into the returned receiver; any further
/// responses are dropped. Convenient for awaiting single-reply calls.
#[must_use]
pub fn oneshot_callback() -> (ResponseCallback, oneshot::Receiver<Response>) {
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    let callback: ResponseCallback = Arc::new(move |response| {
        let sender = match slot.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            // A dropped receiver just means the caller stopped waiting.
            sender.send(response).ok();
        }
    });
    (callback, rx)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback() -> (ResponseCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let callback: ResponseCallback = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[test]
    fn register_rejects_duplicate_ids() {
        let matcher = RequestMatcher::new();
        let (callback, _) = counting_callback();
        matcher.register("c1", Arc::clone(&callback), true).unwrap();
        let err = matcher.register("c1", callback, true).unwrap_err();
        assert!(matches!(err, RpcError::DuplicateCorrelationId(id) if id == "c1"));
    }

    #[test]
    fn complete_removes_single_reply_entry() {
        let matcher = RequestMatcher::new();
        let (callback, count) = counting_callback();
        matcher.register("c1", callback, true).unwrap();

        assert!(matcher.complete(Response::success("c1", vec![], true)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matcher.is_empty());

        // Second reply for the same id is an orphan.
        assert!(!matcher.complete(Response::success("c1", vec![], true)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn streaming_entry_survives_until_last_part() {
        let matcher = RequestMatcher::new();
        let (callback, count) = counting_callback();
        matcher.register("c1", callback, false).unwrap();

        assert!(matcher.complete(Response::success("c1", vec![1], false)));
        assert!(matcher.complete(Response::success("c1", vec![2], false)));
        assert_eq!(matcher.len(), 1);

        assert!(matcher.complete(Response::success("c1", vec![3], true)));
        assert!(matcher.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // Stray fourth part is dropped.
        assert!(!matcher.complete(Response::success("c1", vec![4], false)));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn expire_delivers_timeout_failure_once() {
        let matcher = RequestMatcher::new();
        let responses = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&responses);
        let callback: ResponseCallback = Arc::new(move |response| {
            seen.lock().unwrap().push(response);
        });
        matcher.register("c1", callback, true).unwrap();

        assert!(matcher.expire("c1"));
        assert!(!matcher.expire("c1"));

        let responses = responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].failed);
        assert!(responses[0].last);
        assert_eq!(responses[0].correlation_id, "c1");
    }

    #[test]
    fn expire_loses_race_against_completion() {
        let matcher = RequestMatcher::new();
        let (callback, count) = counting_callback();
        matcher.register("c1", callback, true).unwrap();

        assert!(matcher.complete(Response::success("c1", vec![], true)));
        assert!(!matcher.expire("c1"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_suppresses_the_callback() {
        let matcher = RequestMatcher::new();
        let (callback, count) = counting_callback();
        matcher.register("c1", callback, true).unwrap();

        assert!(matcher.cancel("c1"));
        assert!(!matcher.cancel("c1"));
        assert!(!matcher.complete(Response::success("c1", vec![], true)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_complete_and_expire_fire_exactly_once() {
        // The removal race under real thread interleaving: for each round,
        // exactly one of complete/expire must observe the entry.
        for _ in 0..200 {
            let matcher = Arc::new(RequestMatcher::new());
            let (callback, count) = counting_callback();
            matcher.register("c1", callback, true).unwrap();

            let completer = {
                let matcher = Arc::clone(&matcher);
                std::thread::spawn(move || matcher.complete(Response::success("c1", vec![], true)))
            };
            let expirer = {
                let matcher = Arc::clone(&matcher);
                std::thread::spawn(move || matcher.expire("c1"))
            };

            let completed = completer.join().unwrap();
            let expired = expirer.join().unwrap();
            assert!(completed ^ expired, "exactly one side must win the removal");
            assert_eq!(count.load(Ordering::SeqCst), 1);
            assert!(matcher.is_empty());
        }
    }

    #[tokio::test]
    async fn oneshot_callback_delivers_first_response_only() {
        let (callback, rx) = oneshot_callback();
        callback(Response::success("c1", b"first".to_vec(), true));
        callback(Response::success("c1", b"second".to_vec(), true));

        let response = rx.await.unwrap();
        assert_eq!(response.body, b"first");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// However many non-terminal parts a stream produces, the entry
            /// survives them all, fires once per part, and is removed exactly
            /// by the terminal part.
            #[test]
            fn streaming_delivers_every_part(parts in 0usize..20) {
                let matcher = RequestMatcher::new();
                let (callback, count) = counting_callback();
                matcher.register("c1", callback, false).unwrap();

                for _ in 0..parts {
                    prop_assert!(matcher.complete(Response::success("c1", vec![], false)));
                }
                prop_assert_eq!(matcher.len(), 1);

                prop_assert!(matcher.complete(Response::success("c1", vec![], true)));
                prop_assert!(matcher.is_empty());
                prop_assert_eq!(count.load(Ordering::SeqCst), parts + 1);
            }
        }
    }
}
