//! Immutable, structurally shared cache contents.

use crate::types::{CacheObject, ChangeSet};
use imbl::OrdMap;

/// What a [`CacheSnapshot::put`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Added,
    Replaced,
}

/// What a [`CacheSnapshot::remove`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NoChange,
}

/// An immutable mapping from object id to [`CacheObject`].
///
/// `put` and `remove` return a new snapshot and never touch `self`; the
/// two share structure, so old snapshots stay cheap to keep around.
#[derive(Clone, Default)]
pub struct CacheSnapshot {
    objects: OrdMap<String, CacheObject>,
}

impl CacheSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from objects. Later objects replace earlier ones with the same id.
    pub fn from_objects(objects: impl IntoIterator<Item = CacheObject>) -> Self {
        Self {
            objects: objects
                .into_iter()
                .map(|obj| (obj.id().to_string(), obj))
                .collect(),
        }
    }

    pub fn put(&self, object: CacheObject) -> (CacheSnapshot, PutOutcome) {
        let outcome = if self.objects.contains_key(object.id()) {
            PutOutcome::Replaced
        } else {
            PutOutcome::Added
        };
        let objects = self.objects.update(object.id().to_string(), object);
        (CacheSnapshot { objects }, outcome)
    }

    /// Remove the object at `id`. An absent id returns this snapshot unchanged.
    pub fn remove(&self, id: &str) -> (CacheSnapshot, RemoveOutcome) {
        if !self.objects.contains_key(id) {
            return (self.clone(), RemoveOutcome::NoChange);
        }
        let objects = self.objects.without(id);
        (CacheSnapshot { objects }, RemoveOutcome::Removed)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.objects.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&CacheObject> {
        self.objects.get(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Objects in id order.
    pub fn iter(&self) -> impl Iterator<Item = &CacheObject> {
        self.objects.values()
    }

    /// True if `other` is this very snapshot (or both are empty).
    ///
    /// This is how the engine tells a mutation that changed nothing.
    pub fn same_as(&self, other: &CacheSnapshot) -> bool {
        self.objects.ptr_eq(&other.objects) || (self.is_empty() && other.is_empty())
    }

    /// The whole content as an image change set with a fresh tracking id.
    pub fn to_image_change_set(&self) -> ChangeSet {
        ChangeSet::from_parts(
            crate::types::new_tracking_id(),
            self.objects.values().cloned().collect(),
            Vec::new(),
            true,
        )
    }
}

impl PartialEq for CacheSnapshot {
    /// Value equality: same ids with the same type and content.
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
            || (self.len() == other.len()
                && self
                    .iter()
                    .zip(other.iter())
                    .all(|(a, b)| a.same_content(b)))
    }
}

impl std::fmt::Debug for CacheSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.objects.values()).finish()
    }
}
