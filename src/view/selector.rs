//! Object predicates used by selectors and authorisors.

use crate::types::CacheObject;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A named predicate over cache objects.
///
/// Cloning shares the underlying closure.
#[derive(Clone)]
pub struct Selector {
    description: Arc<str>,
    predicate: Arc<dyn Fn(&CacheObject) -> bool + Send + Sync>,
}

impl Selector {
    pub fn new<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&CacheObject) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into().into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Selects every object.
    pub fn all() -> Self {
        Self::new("all", |_| true)
    }

    /// Selects nothing.
    pub fn none() -> Self {
        Self::new("none", |_| false)
    }

    /// Selects objects of one type.
    pub fn by_type(object_type: impl Into<String>) -> Self {
        let object_type = object_type.into();
        Self::new(format!("type = {object_type}"), move |object| {
            object.object_type() == object_type
        })
    }

    /// Selects objects whose id is in `ids`.
    pub fn by_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: HashSet<String> = ids.into_iter().map(Into::into).collect();
        Self::new(format!("{} ids", ids.len()), move |object| {
            ids.contains(object.id())
        })
    }

    pub fn matches(&self, object: &CacheObject) -> bool {
        (self.predicate)(object)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({})", self.description)
    }
}
