//! A downstream replica maintained from received change sets.

use crate::engine::Termination;
use crate::error::CacheError;
use crate::flow::{Subscriber, Subscription};
use crate::frame::FrameReceiver;
use crate::snapshot::CacheSnapshot;
use crate::types::{CacheObject, ChangeSet};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct MirrorState {
    snapshot: CacheSnapshot,
    applied: u64,
    last_change_set_id: Option<String>,
    termination: Option<Termination>,
}

/// A client-side copy of a cache or view.
///
/// Feed it change sets directly, from a [`FrameDisassembler`] (it is a
/// [`FrameReceiver`]) or by subscribing it to a publisher. An image
/// replaces the whole content before its removes apply; a delta applies
/// its puts and then its removes. Clones share the same replica.
///
/// [`FrameDisassembler`]: crate::frame::FrameDisassembler
#[derive(Clone, Default)]
pub struct CacheMirror {
    state: Arc<RwLock<MirrorState>>,
}

impl CacheMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, change_set: &ChangeSet) {
        let mut state = self.state.write();
        let mut snapshot = if change_set.is_image() {
            CacheSnapshot::from_objects(change_set.puts().iter().cloned())
        } else {
            change_set
                .puts()
                .iter()
                .fold(state.snapshot.clone(), |snapshot, object| {
                    snapshot.put(object.clone()).0
                })
        };
        for remove in change_set.removes() {
            snapshot = snapshot.remove(remove.id()).0;
        }

        state.snapshot = snapshot;
        state.applied += 1;
        state.last_change_set_id = Some(change_set.id().to_string());
        debug!(
            change_set_id = change_set.id(),
            is_image = change_set.is_image(),
            objects = state.snapshot.len(),
            "Mirror updated"
        );
    }

    /// The replica as it stands.
    pub fn snapshot(&self) -> CacheSnapshot {
        self.state.read().snapshot.clone()
    }

    pub fn get(&self, id: &str) -> Option<CacheObject> {
        self.state.read().snapshot.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().snapshot.contains(id)
    }

    pub fn len(&self) -> usize {
        self.state.read().snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().snapshot.is_empty()
    }

    /// Ids held, in order.
    pub fn ids(&self) -> Vec<String> {
        self.state
            .read()
            .snapshot
            .iter()
            .map(|object| object.id().to_string())
            .collect()
    }

    /// Number of change sets applied so far.
    pub fn change_sets_applied(&self) -> u64 {
        self.state.read().applied
    }

    pub fn last_change_set_id(&self) -> Option<String> {
        self.state.read().last_change_set_id.clone()
    }

    /// How the feeding stream ended, once it has.
    pub fn termination(&self) -> Option<Termination> {
        self.state.read().termination.clone()
    }

    fn terminate(&self, termination: Termination) {
        let mut state = self.state.write();
        if state.termination.is_none() {
            state.termination = Some(termination);
        }
    }
}

impl FrameReceiver for CacheMirror {
    fn on_change_set(&mut self, change_set: ChangeSet) {
        self.apply(&change_set);
    }

    fn on_protocol_error(&mut self, error: &CacheError) {
        self.terminate(Termination::Failed(error.clone()));
    }
}

impl Subscriber<ChangeSet> for CacheMirror {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(u64::MAX);
    }

    fn on_next(&self, change_set: ChangeSet) {
        self.apply(&change_set);
    }

    fn on_error(&self, error: CacheError) {
        self.terminate(Termination::Failed(error));
    }

    fn on_complete(&self) {
        self.terminate(Termination::Completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RemoveMarker;
    use serde_json::json;

    fn obj(id: &str) -> CacheObject {
        CacheObject::new(id, "t", json!({ "id": id })).unwrap()
    }

    #[test]
    fn test_delta_puts_then_removes() {
        let mirror = CacheMirror::new();
        mirror.apply(&ChangeSet::delta("1", vec![obj("a"), obj("b")], vec![]).unwrap());
        mirror.apply(
            &ChangeSet::delta("2", vec![obj("c")], vec![RemoveMarker::new("a").unwrap()]).unwrap(),
        );

        assert_eq!(mirror.ids(), vec!["b", "c"]);
        assert_eq!(mirror.change_sets_applied(), 2);
        assert_eq!(mirror.last_change_set_id().as_deref(), Some("2"));
    }

    #[test]
    fn test_image_replaces_content() {
        let mirror = CacheMirror::new();
        mirror.apply(&ChangeSet::delta("1", vec![obj("old")], vec![]).unwrap());

        // Filtered images carry removes for unselected objects.
        let image = ChangeSet::new(
            "2",
            vec![obj("a"), obj("b")],
            vec![RemoveMarker::new("b").unwrap()],
            true,
        )
        .unwrap();
        mirror.apply(&image);

        assert_eq!(mirror.ids(), vec!["a"]);
        assert!(!mirror.contains("old"));
    }

    #[test]
    fn test_records_termination_once() {
        let mirror = CacheMirror::new();
        Subscriber::<ChangeSet>::on_complete(&mirror);
        Subscriber::<ChangeSet>::on_error(&mirror, CacheError::SlowConsumer { limit: 1 });
        assert_eq!(mirror.termination(), Some(Termination::Completed));
    }
}
