//! Core types for the cache: objects, removes and change sets.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

/// Generate a fresh tracking id for a change set or mutation.
pub fn new_tracking_id() -> String {
    Uuid::new_v4().to_string()
}

/// A JSON entity held in the cache.
///
/// Identity is the `id` alone: two objects with the same id are equal
/// regardless of type or content. Use [`CacheObject::same_content`] to
/// compare the full value.
#[derive(Clone, Serialize, Deserialize)]
pub struct CacheObject {
    id: String,
    #[serde(rename = "type")]
    object_type: String,
    content: Arc<Value>,
}

impl CacheObject {
    /// Create a new cache object. The id must not be empty.
    pub fn new(id: impl Into<String>, object_type: impl Into<String>, content: Value) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(CacheError::InvalidArgument(
                "cache object id must not be empty".to_string(),
            ));
        }
        Ok(Self {
            id,
            object_type: object_type.into(),
            content: Arc::new(content),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    /// True if `other` has the same id, type and content.
    pub fn same_content(&self, other: &CacheObject) -> bool {
        self.id == other.id
            && self.object_type == other.object_type
            && (Arc::ptr_eq(&self.content, &other.content) || self.content == other.content)
    }

    /// A remove marker for this object, carrying no content.
    pub fn to_remove(&self) -> RemoveMarker {
        RemoveMarker {
            id: self.id.clone(),
            content: Arc::new(Value::Null),
        }
    }
}

impl PartialEq for CacheObject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CacheObject {}

impl Hash for CacheObject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for CacheObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheObject({}: {})", self.id, self.object_type)
    }
}

/// Describes the removal of the object at `id`.
///
/// The optional content lets remove strategies compare against the
/// existing object; it is `null` for a plain remove.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoveMarker {
    id: String,
    #[serde(default, skip_serializing_if = "is_null")]
    content: Arc<Value>,
}

fn is_null(value: &Arc<Value>) -> bool {
    value.is_null()
}

impl RemoveMarker {
    /// A remove with no content.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        Self::with_content(id, Value::Null)
    }

    /// A remove carrying content for comparison strategies.
    pub fn with_content(id: impl Into<String>, content: Value) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(CacheError::InvalidArgument(
                "remove id must not be empty".to_string(),
            ));
        }
        Ok(Self {
            id,
            content: Arc::new(content),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &Value {
        &self.content
    }
}

impl PartialEq for RemoveMarker {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RemoveMarker {}

impl Hash for RemoveMarker {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for RemoveMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoveMarker({})", self.id)
    }
}

struct ChangeSetInner {
    id: String,
    puts: Vec<CacheObject>,
    removes: Vec<RemoveMarker>,
    is_image: bool,
}

/// An immutable batch of puts and removes.
///
/// Cloning is cheap; the same change set is handed to every subscriber.
/// Equality compares puts and removes as id sets plus the image flag; the
/// tracking id is not part of equality.
#[derive(Clone)]
pub struct ChangeSet(Arc<ChangeSetInner>);

impl ChangeSet {
    /// Create a change set. Ids must be unique within puts and within removes.
    pub fn new(
        id: impl Into<String>,
        puts: Vec<CacheObject>,
        removes: Vec<RemoveMarker>,
        is_image: bool,
    ) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(CacheError::InvalidArgument(
                "change set id must not be empty".to_string(),
            ));
        }
        if let Some(dup) = first_duplicate(puts.iter().map(CacheObject::id)) {
            return Err(CacheError::InvalidArgument(format!(
                "duplicate put for id {dup}"
            )));
        }
        if let Some(dup) = first_duplicate(removes.iter().map(RemoveMarker::id)) {
            return Err(CacheError::InvalidArgument(format!(
                "duplicate remove for id {dup}"
            )));
        }
        Ok(Self::from_parts(id, puts, removes, is_image))
    }

    /// A delta change set.
    pub fn delta(
        id: impl Into<String>,
        puts: Vec<CacheObject>,
        removes: Vec<RemoveMarker>,
    ) -> Result<Self> {
        Self::new(id, puts, removes, false)
    }

    /// A full image with a fresh tracking id.
    pub fn image(puts: Vec<CacheObject>) -> Result<Self> {
        Self::new(new_tracking_id(), puts, Vec::new(), true)
    }

    /// Build without validation; callers guarantee id uniqueness.
    pub(crate) fn from_parts(
        id: String,
        puts: Vec<CacheObject>,
        removes: Vec<RemoveMarker>,
        is_image: bool,
    ) -> Self {
        ChangeSet(Arc::new(ChangeSetInner {
            id,
            puts,
            removes,
            is_image,
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn puts(&self) -> &[CacheObject] {
        &self.0.puts
    }

    pub fn removes(&self) -> &[RemoveMarker] {
        &self.0.removes
    }

    pub fn is_image(&self) -> bool {
        self.0.is_image
    }

    /// True if there are neither puts nor removes.
    pub fn is_empty(&self) -> bool {
        self.0.puts.is_empty() && self.0.removes.is_empty()
    }
}

fn first_duplicate<'a>(ids: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let mut seen = HashSet::new();
    ids.into_iter().find(|id| !seen.insert(*id))
}

fn id_set<'a>(ids: impl Iterator<Item = &'a str>) -> HashSet<&'a str> {
    ids.collect()
}

impl PartialEq for ChangeSet {
    fn eq(&self, other: &Self) -> bool {
        self.is_image() == other.is_image()
            && self.puts().len() == other.puts().len()
            && self.removes().len() == other.removes().len()
            && id_set(self.puts().iter().map(CacheObject::id))
                == id_set(other.puts().iter().map(CacheObject::id))
            && id_set(self.removes().iter().map(RemoveMarker::id))
                == id_set(other.removes().iter().map(RemoveMarker::id))
    }
}

impl Eq for ChangeSet {}

impl fmt::Debug for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSet")
            .field("id", &self.0.id)
            .field("is_image", &self.0.is_image)
            .field("puts", &self.0.puts)
            .field("removes", &self.0.removes)
            .finish()
    }
}
