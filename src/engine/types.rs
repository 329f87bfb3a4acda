//! Engine configuration and internal command types.

use crate::error::{CacheError, Result};
use crate::flow::{Subscriber, SubscriberKey};
use crate::mutation::Mutation;
use crate::types::ChangeSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default backlog limit per subscriber.
pub const DEFAULT_BACKLOG_LIMIT: usize = 1000;

/// Configuration for a cache engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity of the engine (used in logs and the worker thread name).
    pub id: String,

    /// Max undelivered change sets per subscriber before it is dropped.
    /// Default: 1000
    pub backlog_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            id: "cache".to_string(),
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
        }
    }
}

impl EngineConfig {
    pub fn new(id: impl Into<String>, backlog_limit: usize) -> Self {
        Self {
            id: id.into(),
            backlog_limit,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(CacheError::InvalidArgument(
                "engine id must not be empty".to_string(),
            ));
        }
        if self.backlog_limit == 0 {
            return Err(CacheError::InvalidArgument(
                "backlog limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// How an engine ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The mutation source completed.
    Completed,
    /// A mutation failed or the mutation source errored.
    Failed(CacheError),
}

/// Work items for the engine worker, processed strictly in order.
pub(crate) enum Command {
    Apply(Box<dyn Mutation>),
    Subscribe {
        key: SubscriberKey,
        subscriber: Arc<dyn Subscriber<ChangeSet>>,
    },
    SendImage(SubscriberKey),
    /// Demand was signalled; the amount is held by the subscription.
    Demand(SubscriberKey),
    Cancel(SubscriberKey),
    Close,
    Fail(CacheError),
}
