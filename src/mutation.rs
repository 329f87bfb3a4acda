//! Units of work applied to the cache by the engine.
//!
//! A [`Mutation`] turns the current snapshot into a new snapshot plus the
//! change set describing the difference. The change set carries the
//! mutation's id so a change can be traced end to end.

use crate::error::{CacheError, Result};
use crate::snapshot::{CacheSnapshot, RemoveOutcome};
use crate::types::{new_tracking_id, CacheObject, ChangeSet, RemoveMarker};
use std::fmt;

/// The outcome of executing a mutation.
#[derive(Clone, Debug)]
pub struct MutationResult {
    pub snapshot: CacheSnapshot,
    pub change_set: ChangeSet,
}

/// A unit of work applied to the cache, one at a time, in submission order.
pub trait Mutation: Send {
    /// Id assigned at creation; the produced change set must carry it.
    fn id(&self) -> &str;

    /// Produce the next snapshot. Returning the input snapshot unchanged
    /// means nothing is published.
    fn execute(&self, snapshot: &CacheSnapshot) -> Result<MutationResult>;
}

impl fmt::Debug for dyn Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mutation({})", self.id())
    }
}

/// Check the result contract: a delta change set carrying the mutation id.
pub(crate) fn check_result(mutation: &dyn Mutation, result: &MutationResult) -> Result<()> {
    if result.change_set.is_image() {
        return Err(CacheError::MutationFailed {
            id: mutation.id().to_string(),
            reason: "produced an image change set".to_string(),
        });
    }
    if result.change_set.id() != mutation.id() {
        return Err(CacheError::MutationFailed {
            id: mutation.id().to_string(),
            reason: format!("produced change set with id {}", result.change_set.id()),
        });
    }
    Ok(())
}

type MutationCode = dyn Fn(&str, &CacheSnapshot) -> Result<MutationResult> + Send;

/// A mutation backed by a closure.
///
/// The closure receives the mutation id (to stamp on its change set) and
/// the current snapshot.
pub struct CacheFunction {
    id: String,
    code: Box<MutationCode>,
}

impl CacheFunction {
    /// Wrap `code` with a freshly generated id.
    pub fn new<F>(code: F) -> Self
    where
        F: Fn(&str, &CacheSnapshot) -> Result<MutationResult> + Send + 'static,
    {
        Self::with_id(new_tracking_id(), code)
    }

    pub fn with_id<F>(id: impl Into<String>, code: F) -> Self
    where
        F: Fn(&str, &CacheSnapshot) -> Result<MutationResult> + Send + 'static,
    {
        Self {
            id: id.into(),
            code: Box::new(code),
        }
    }
}

impl Mutation for CacheFunction {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute(&self, snapshot: &CacheSnapshot) -> Result<MutationResult> {
        (self.code)(&self.id, snapshot)
    }
}

/// Applies a delta change set, reporting only the changes actually made.
///
/// Removes of absent ids and puts identical to the existing object are
/// dropped from the published change set. The published change set takes
/// the id of the requested one.
#[derive(Clone, Debug)]
pub struct ApplyChangeSet {
    changes: ChangeSet,
}

impl ApplyChangeSet {
    pub fn new(changes: ChangeSet) -> Result<Self> {
        if changes.is_image() {
            return Err(CacheError::InvalidArgument(
                "cannot apply an image change set as a mutation".to_string(),
            ));
        }
        Ok(Self { changes })
    }

    /// Convenience for building the requested change set in one go.
    pub fn from_parts(puts: Vec<CacheObject>, removes: Vec<RemoveMarker>) -> Result<Self> {
        Self::new(ChangeSet::delta(new_tracking_id(), puts, removes)?)
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }
}

impl Mutation for ApplyChangeSet {
    fn id(&self) -> &str {
        self.changes.id()
    }

    fn execute(&self, snapshot: &CacheSnapshot) -> Result<MutationResult> {
        let mut next = snapshot.clone();
        let mut puts = Vec::new();
        let mut removes = Vec::new();

        for put in self.changes.puts() {
            if next.get(put.id()).is_some_and(|old| old.same_content(put)) {
                continue;
            }
            next = next.put(put.clone()).0;
            puts.push(put.clone());
        }

        for remove in self.changes.removes() {
            let (after, outcome) = next.remove(remove.id());
            if outcome == RemoveOutcome::Removed {
                next = after;
                removes.push(remove.clone());
            }
        }

        let snapshot = if puts.is_empty() && removes.is_empty() {
            snapshot.clone()
        } else {
            next
        };

        Ok(MutationResult {
            snapshot,
            change_set: ChangeSet::from_parts(self.changes.id().to_string(), puts, removes, false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(id: &str, n: i64) -> CacheObject {
        CacheObject::new(id, "counter", json!({ "n": n })).unwrap()
    }

    #[test]
    fn test_apply_reports_actual_changes() {
        let start = CacheSnapshot::from_objects(vec![obj("a", 1), obj("b", 1)]);
        let mutation = ApplyChangeSet::from_parts(
            vec![obj("a", 1), obj("b", 2), obj("c", 3)],
            vec![RemoveMarker::new("missing").unwrap(), RemoveMarker::new("a").unwrap()],
        )
        .unwrap();

        let result = mutation.execute(&start).unwrap();
        assert_eq!(result.change_set.id(), mutation.id());

        let puts: Vec<&str> = result.change_set.puts().iter().map(|o| o.id()).collect();
        let removes: Vec<&str> = result.change_set.removes().iter().map(|r| r.id()).collect();
        assert_eq!(puts, vec!["b", "c"]);
        assert_eq!(removes, vec!["a"]);

        assert!(!result.snapshot.contains("a"));
        assert_eq!(result.snapshot.get("b").unwrap().content(), &json!({"n": 2}));
        assert!(start.contains("a"));
    }

    #[test]
    fn test_apply_without_effect_returns_same_snapshot() {
        let start = CacheSnapshot::from_objects(vec![obj("a", 1)]);
        let mutation =
            ApplyChangeSet::from_parts(vec![obj("a", 1)], vec![RemoveMarker::new("zz").unwrap()])
                .unwrap();

        let result = mutation.execute(&start).unwrap();
        assert!(result.snapshot.same_as(&start));
        assert!(result.change_set.is_empty());
    }

    #[test]
    fn test_image_cannot_be_applied() {
        let image = CacheSnapshot::new().to_image_change_set();
        assert!(matches!(
            ApplyChangeSet::new(image),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_check_result_enforces_id_and_delta() {
        let mutation = CacheFunction::with_id("m-1", |_, snapshot| {
            Ok(MutationResult {
                snapshot: snapshot.clone(),
                change_set: ChangeSet::delta("other", vec![], vec![])?,
            })
        });
        let result = mutation.execute(&CacheSnapshot::new()).unwrap();
        assert!(matches!(
            check_result(&mutation, &result),
            Err(CacheError::MutationFailed { .. })
        ));

        let image = MutationResult {
            snapshot: CacheSnapshot::new(),
            change_set: ChangeSet::new("m-1", vec![], vec![], true).unwrap(),
        };
        assert!(check_result(&mutation, &image).is_err());
    }
}
