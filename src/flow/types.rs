//! Push protocol with demand signalling.

use crate::error::{CacheError, Result};
use crate::types::ChangeSet;
use std::sync::Arc;

/// The link between a publisher and one subscriber.
///
/// Both calls are non-blocking and may be made from any thread, including
/// from inside a subscriber callback.
pub trait Subscription: Send + Sync {
    /// Signal that `n` more items can be accepted. `n` must be positive;
    /// `u64::MAX` means unbounded.
    fn request(&self, n: u64);

    /// Stop delivery. Idempotent.
    fn cancel(&self);
}

/// Receives items pushed by a [`Publisher`].
///
/// `on_subscribe` is called exactly once before anything else. After
/// `on_error` or `on_complete` nothing more is delivered.
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);
    fn on_next(&self, item: T);
    fn on_error(&self, error: CacheError);
    fn on_complete(&self);
}

/// A source of items for subscribers.
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) -> Result<()>;
}

/// A change-set publisher that can be asked for a fresh image.
pub trait ImageSource: Publisher<ChangeSet> {
    /// Ask that `subscriber`, already subscribed here, receives a new image.
    fn request_image(&self, subscriber: &Arc<dyn Subscriber<ChangeSet>>) -> Result<()>;
}

/// Identity of a subscriber object, used to reject double registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberKey(usize);

impl SubscriberKey {
    pub fn of<T: ?Sized>(subscriber: &Arc<T>) -> Self {
        SubscriberKey(Arc::as_ptr(subscriber) as *const () as usize)
    }
}

/// Lifecycle tag for objects that accept a single subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    NotSubscribed,
    Active,
    Terminal,
}

/// Add demand, saturating at unbounded.
pub(crate) fn add_demand(current: u64, n: u64) -> u64 {
    current.saturating_add(n)
}
