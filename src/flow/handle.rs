//! A channel-backed subscriber for blocking consumers.

use super::types::{Subscriber, Subscription};
use crate::error::CacheError;
use crossbeam_channel::{unbounded, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Signals received by a [`SubscriptionHandle`].
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent<T> {
    Item(T),
    Error(CacheError),
    Completed,
}

impl<T> StreamEvent<T> {
    pub fn into_item(self) -> Option<T> {
        match self {
            StreamEvent::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Item(_))
    }
}

enum Link {
    /// Not subscribed yet; demand requested so far.
    Pending(u64),
    /// Cancelled before the subscription started.
    Cancelled,
    Live(Arc<dyn Subscription>),
}

struct HandleSubscriber<T> {
    sender: Sender<StreamEvent<T>>,
    link: Mutex<Link>,
}

impl<T: Send> Subscriber<T> for HandleSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let pending = {
            let mut link = self.link.lock();
            let pending = match &*link {
                Link::Pending(n) => Some(*n),
                Link::Cancelled => None,
                Link::Live(_) => Some(0),
            };
            *link = Link::Live(Arc::clone(&subscription));
            pending
        };
        match pending {
            None => subscription.cancel(),
            Some(0) => {}
            Some(n) => subscription.request(n),
        }
    }

    fn on_next(&self, item: T) {
        let _ = self.sender.send(StreamEvent::Item(item));
    }

    fn on_error(&self, error: CacheError) {
        let _ = self.sender.send(StreamEvent::Error(error));
    }

    fn on_complete(&self) {
        let _ = self.sender.send(StreamEvent::Completed);
    }
}

/// Receives a stream through a channel, with demand managed by the caller.
///
/// Pass [`SubscriptionHandle::subscriber`] to a publisher, then call
/// [`SubscriptionHandle::request`] as items are consumed. Demand requested
/// before the subscription starts is handed over when it does.
pub struct SubscriptionHandle<T> {
    subscriber: Arc<HandleSubscriber<T>>,
    receiver: Receiver<StreamEvent<T>>,
}

impl<T: Send + 'static> SubscriptionHandle<T> {
    /// A handle with no initial demand.
    pub fn new() -> Self {
        Self::with_demand(0)
    }

    /// A handle that requests `n` items as soon as it is subscribed.
    pub fn with_demand(n: u64) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            subscriber: Arc::new(HandleSubscriber {
                sender,
                link: Mutex::new(Link::Pending(n)),
            }),
            receiver,
        }
    }

    /// A handle that never limits delivery.
    pub fn unbounded() -> Self {
        Self::with_demand(u64::MAX)
    }

    /// The subscriber to register with a publisher. Always the same object.
    pub fn subscriber(&self) -> Arc<dyn Subscriber<T>> {
        self.subscriber.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        matches!(&*self.subscriber.link.lock(), Link::Live(_))
    }

    pub fn request(&self, n: u64) {
        let live = {
            let mut link = self.subscriber.link.lock();
            match &mut *link {
                Link::Pending(pending) => {
                    *pending = pending.saturating_add(n);
                    None
                }
                Link::Cancelled => None,
                Link::Live(subscription) => Some(Arc::clone(subscription)),
            }
        };
        if let Some(subscription) = live {
            subscription.request(n);
        }
    }

    /// Stop delivery. Before the subscription starts, the cancel is held
    /// and applied as soon as it does.
    pub fn cancel(&self) {
        let live = {
            let mut link = self.subscriber.link.lock();
            match &*link {
                Link::Live(subscription) => Some(Arc::clone(subscription)),
                Link::Pending(_) | Link::Cancelled => {
                    *link = Link::Cancelled;
                    None
                }
            }
        };
        if let Some(subscription) = live {
            subscription.cancel();
        }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<StreamEvent<T>, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<StreamEvent<T>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<StreamEvent<T>, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything received so far, without blocking.
    pub fn drain(&self) -> Vec<StreamEvent<T>> {
        self.receiver.try_iter().collect()
    }
}

impl<T: Send + 'static> Default for SubscriptionHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}
