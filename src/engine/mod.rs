//! The cache engine: serialized mutation and live publication.
//!
//! This module turns concurrently submitted mutations into one ordered
//! stream of change sets:
//! - mutations are applied one at a time, in submission order, on a
//!   dedicated worker thread
//! - each subscriber first receives an image, then every change set
//! - image requests are ordered with the submissions made before them
//! - bounded backlogs with slow-subscriber dropping
//!
//! # Example
//!
//! ```ignore
//! let engine = CacheEngine::new(EngineConfig::new("orders", 100))?;
//! let handle = SubscriptionHandle::unbounded();
//! engine.subscribe(handle.subscriber())?;
//!
//! engine.submit(ApplyChangeSet::from_parts(vec![order], vec![])?)?;
//!
//! loop {
//!     match handle.recv() {
//!         Ok(StreamEvent::Item(change_set)) => println!("Got {:?}", change_set),
//!         Ok(StreamEvent::Error(e)) => break,
//!         Ok(StreamEvent::Completed) | Err(_) => break,
//!     }
//! }
//! ```

mod cache;
mod types;
mod worker;

pub use cache::CacheEngine;
pub use types::{EngineConfig, Termination, DEFAULT_BACKLOG_LIMIT};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::flow::{ImageSource, Publisher, StreamEvent, SubscriptionHandle};
    use crate::mutation::{ApplyChangeSet, CacheFunction, MutationResult};
    use crate::types::{CacheObject, ChangeSet, RemoveMarker};
    use crate::flow::{Subscriber, Subscription};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(500);

    fn obj(id: &str) -> CacheObject {
        CacheObject::new(id, "test", json!({ "id": id })).unwrap()
    }

    fn put(id: &str) -> ApplyChangeSet {
        ApplyChangeSet::from_parts(vec![obj(id)], vec![]).unwrap()
    }

    fn next_change_set(handle: &SubscriptionHandle<ChangeSet>) -> ChangeSet {
        match handle.recv_timeout(WAIT).unwrap() {
            StreamEvent::Item(change_set) => change_set,
            other => panic!("Expected change set, got {:?}", other),
        }
    }

    fn engine(limit: usize) -> CacheEngine {
        CacheEngine::new(EngineConfig::new("test", limit)).unwrap()
    }

    #[test]
    fn test_image_then_changes_in_order() {
        let engine = engine(100);
        let handle = SubscriptionHandle::unbounded();
        engine.subscribe(handle.subscriber()).unwrap();

        let image = next_change_set(&handle);
        assert!(image.is_image());
        assert!(image.puts().is_empty());

        let mutations: Vec<ApplyChangeSet> = ["a", "b", "c"].iter().map(|id| put(id)).collect();
        let ids: Vec<String> = mutations.iter().map(|m| m.changes().id().to_string()).collect();
        for mutation in mutations {
            engine.submit(mutation).unwrap();
        }

        for id in ids {
            let change_set = next_change_set(&handle);
            assert!(!change_set.is_image());
            assert_eq!(change_set.id(), id);
        }
    }

    #[test]
    fn test_no_publication_without_change() {
        let engine = engine(100);
        let handle = SubscriptionHandle::unbounded();
        engine.subscribe(handle.subscriber()).unwrap();
        next_change_set(&handle);

        let noop = ApplyChangeSet::from_parts(vec![], vec![RemoveMarker::new("x").unwrap()]).unwrap();
        engine.submit(noop).unwrap();
        let marker = put("a");
        let marker_id = marker.changes().id().to_string();
        engine.submit(marker).unwrap();

        assert_eq!(next_change_set(&handle).id(), marker_id);
    }

    #[test]
    fn test_no_delivery_without_demand() {
        let engine = engine(100);
        let handle = SubscriptionHandle::new();
        engine.subscribe(handle.subscriber()).unwrap();
        engine.submit(put("a")).unwrap();

        assert!(handle.recv_timeout(Duration::from_millis(50)).is_err());

        handle.request(1);
        assert!(next_change_set(&handle).is_image());
        assert!(handle.recv_timeout(Duration::from_millis(50)).is_err());

        handle.request(1);
        assert_eq!(next_change_set(&handle).puts()[0].id(), "a");
    }

    #[test]
    fn test_image_reflects_earlier_submission() {
        let engine = engine(100);
        let handle = SubscriptionHandle::unbounded();
        engine.subscribe(handle.subscriber()).unwrap();
        next_change_set(&handle);

        engine.submit(put("x")).unwrap();
        engine.request_image(&handle.subscriber()).unwrap();
        engine.submit(put("y")).unwrap();

        let delta = next_change_set(&handle);
        assert_eq!(delta.puts()[0].id(), "x");

        let image = next_change_set(&handle);
        assert!(image.is_image());
        assert!(image.puts().iter().any(|o| o.id() == "x"));
        assert!(!image.puts().iter().any(|o| o.id() == "y"));

        assert_eq!(next_change_set(&handle).puts()[0].id(), "y");
    }

    #[test]
    fn test_double_subscribe_rejected() {
        let engine = engine(100);
        let handle = SubscriptionHandle::<ChangeSet>::unbounded();
        engine.subscribe(handle.subscriber()).unwrap();
        assert!(matches!(
            engine.subscribe(handle.subscriber()),
            Err(CacheError::InvalidState(_))
        ));
    }

    #[test]
    fn test_image_request_for_stranger_rejected() {
        let engine = engine(100);
        let stranger = SubscriptionHandle::<ChangeSet>::unbounded();
        assert!(matches!(
            engine.request_image(&stranger.subscriber()),
            Err(CacheError::InvalidState(_))
        ));
    }

    #[test]
    fn test_slow_subscriber_dropped() {
        let engine = engine(2);
        let slow = SubscriptionHandle::new();
        let fast = SubscriptionHandle::unbounded();
        engine.subscribe(slow.subscriber()).unwrap();
        engine.subscribe(fast.subscriber()).unwrap();

        for id in ["a", "b", "c"] {
            engine.submit(put(id)).unwrap();
        }

        assert_eq!(
            slow.recv_timeout(WAIT).unwrap(),
            StreamEvent::Error(CacheError::SlowConsumer { limit: 2 })
        );
        slow.request(10);
        assert!(slow.recv_timeout(Duration::from_millis(50)).is_err());

        for _ in 0..4 {
            next_change_set(&fast);
        }
        assert_eq!(engine.subscriber_count(), 1);
    }

    #[test]
    fn test_cancel_completes_only_that_subscriber() {
        let engine = engine(100);
        let leaving = SubscriptionHandle::unbounded();
        let staying = SubscriptionHandle::unbounded();
        engine.subscribe(leaving.subscriber()).unwrap();
        engine.subscribe(staying.subscriber()).unwrap();
        next_change_set(&leaving);
        next_change_set(&staying);

        leaving.cancel();
        leaving.cancel();
        assert_eq!(leaving.recv_timeout(WAIT).unwrap(), StreamEvent::Completed);

        engine.submit(put("a")).unwrap();
        assert_eq!(next_change_set(&staying).puts()[0].id(), "a");
        assert!(leaving.recv_timeout(Duration::from_millis(50)).is_err());
    }

    /// Cancels from inside `on_next` once it has seen `cancel_at` items.
    struct CancellingSubscriber {
        cancel_at: usize,
        subscription: parking_lot::Mutex<Option<Arc<dyn Subscription>>>,
        seen: AtomicUsize,
        after_cancel: AtomicUsize,
        completed: crossbeam_channel::Sender<()>,
    }

    impl Subscriber<ChangeSet> for CancellingSubscriber {
        fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
            *self.subscription.lock() = Some(Arc::clone(&subscription));
            subscription.request(u64::MAX);
        }

        fn on_next(&self, _change_set: ChangeSet) {
            let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            if seen > self.cancel_at {
                self.after_cancel.fetch_add(1, Ordering::SeqCst);
            } else if seen == self.cancel_at {
                let subscription = self.subscription.lock().clone();
                if let Some(subscription) = subscription {
                    subscription.cancel();
                }
            }
        }

        fn on_error(&self, error: CacheError) {
            panic!("Unexpected error {error}");
        }

        fn on_complete(&self) {
            let _ = self.completed.send(());
        }
    }

    #[test]
    fn test_cancel_inside_on_next_stops_queued_deliveries() {
        let engine = engine(10_000);
        let (completed, completion) = crossbeam_channel::unbounded();
        let subscriber = Arc::new(CancellingSubscriber {
            cancel_at: 6,
            subscription: parking_lot::Mutex::new(None),
            seen: AtomicUsize::new(0),
            after_cancel: AtomicUsize::new(0),
            completed,
        });
        engine.subscribe(subscriber.clone()).unwrap();

        // Hold the worker so every put is queued before delivery starts.
        let (release, gate) = crossbeam_channel::bounded::<()>(1);
        engine
            .submit(CacheFunction::new(move |id, snapshot| {
                let _ = gate.recv_timeout(Duration::from_secs(5));
                Ok(MutationResult {
                    snapshot: snapshot.clone(),
                    change_set: ChangeSet::delta(id, vec![], vec![])?,
                })
            }))
            .unwrap();
        for i in 0..2000 {
            engine.submit(put(&format!("obj-{i}"))).unwrap();
        }
        release.send(()).unwrap();

        completion.recv_timeout(Duration::from_secs(5)).unwrap();
        engine.close();
        engine.join();

        assert_eq!(subscriber.seen.load(Ordering::SeqCst), 6);
        assert_eq!(subscriber.after_cancel.load(Ordering::SeqCst), 0);
        assert!(completion.try_recv().is_err());
        assert_eq!(engine.snapshot().len(), 2000);
    }

    #[test]
    fn test_failed_mutation_retires_engine() {
        let engine = engine(100);
        let first = SubscriptionHandle::unbounded();
        let second = SubscriptionHandle::unbounded();
        engine.subscribe(first.subscriber()).unwrap();
        engine.subscribe(second.subscriber()).unwrap();

        engine
            .submit(CacheFunction::new(|_, _| {
                Err(CacheError::InvalidArgument("bad input".to_string()))
            }))
            .unwrap();

        for handle in [&first, &second] {
            assert!(next_change_set(handle).is_image());
            assert!(matches!(
                handle.recv_timeout(WAIT).unwrap(),
                StreamEvent::Error(CacheError::MutationFailed { .. })
            ));
        }

        engine.join();
        assert!(engine.is_retired());
        assert!(engine.submit(put("a")).is_err());
        assert!(engine
            .subscribe(SubscriptionHandle::unbounded().subscriber())
            .is_err());
    }

    #[test]
    fn test_contract_violation_is_a_failure() {
        let engine = engine(100);
        let handle = SubscriptionHandle::unbounded();
        engine.subscribe(handle.subscriber()).unwrap();
        next_change_set(&handle);

        engine
            .submit(CacheFunction::new(|_, snapshot| {
                let (snapshot, _) = snapshot.put(obj("a"));
                Ok(MutationResult {
                    snapshot,
                    change_set: ChangeSet::delta("not-my-id", vec![obj("a")], vec![])?,
                })
            }))
            .unwrap();

        assert!(matches!(
            handle.recv_timeout(WAIT).unwrap(),
            StreamEvent::Error(CacheError::MutationFailed { .. })
        ));
    }

    #[test]
    fn test_close_completes_subscribers() {
        let engine = engine(100);
        let handle = SubscriptionHandle::unbounded();
        engine.subscribe(handle.subscriber()).unwrap();
        engine.submit(put("a")).unwrap();
        engine.close();

        assert!(next_change_set(&handle).is_image());
        assert_eq!(next_change_set(&handle).puts()[0].id(), "a");
        assert_eq!(handle.recv_timeout(WAIT).unwrap(), StreamEvent::Completed);

        engine.join();
        assert_eq!(engine.termination(), Some(Termination::Completed));
        assert!(engine.snapshot().contains("a"));
    }

    #[test]
    fn test_close_and_fail_after_retirement_are_ignored() {
        let engine = engine(100);
        engine.close();
        engine.join();

        engine.close();
        engine.fail(CacheError::Transport("late".to_string()));
        assert_eq!(engine.termination(), Some(Termination::Completed));
        assert!(matches!(
            engine.submit(put("a")),
            Err(CacheError::InvalidState(_))
        ));
    }
}
