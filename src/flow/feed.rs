//! A buffered, single-subscriber publisher fed by application code.

use super::types::{add_demand, Phase, Publisher, Subscriber, Subscription};
use crate::error::{CacheError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::debug;

enum Closing {
    Open,
    Completed,
    Failed(CacheError),
}

struct FeedState<T> {
    phase: Phase,
    subscriber: Option<Arc<dyn Subscriber<T>>>,
    buffer: VecDeque<T>,
    demand: u64,
    closing: Closing,
    /// Set while one thread is delivering; others just leave work behind.
    draining: bool,
}

struct FeedInner<T> {
    name: String,
    state: Mutex<FeedState<T>>,
}

/// An ordered source of items that honours subscriber demand.
///
/// Items pushed before there is demand are buffered. `complete` delivers
/// what is buffered first; `fail` is delivered at once. Used as the stock
/// source of selectors for a view and of mutations for an engine.
pub struct Feed<T> {
    inner: Arc<FeedInner<T>>,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum Signal<T> {
    Next(T),
    Complete,
    Error(CacheError),
}

impl<T: Send + 'static> Feed<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                name: name.into(),
                state: Mutex::new(FeedState {
                    phase: Phase::NotSubscribed,
                    subscriber: None,
                    buffer: VecDeque::new(),
                    demand: 0,
                    closing: Closing::Open,
                    draining: false,
                }),
            }),
        }
    }

    /// Queue an item for delivery.
    pub fn push(&self, item: T) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if !matches!(state.closing, Closing::Open) || state.phase == Phase::Terminal {
                return Err(CacheError::InvalidState(format!(
                    "feed {} is closed",
                    self.inner.name
                )));
            }
            state.buffer.push_back(item);
        }
        FeedInner::drain(&self.inner);
        Ok(())
    }

    /// Complete once buffered items have been delivered.
    pub fn complete(&self) {
        self.close(Closing::Completed);
    }

    /// Terminate with an error, discarding anything buffered.
    pub fn fail(&self, error: CacheError) {
        self.close(Closing::Failed(error));
    }

    fn close(&self, closing: Closing) {
        {
            let mut state = self.inner.state.lock();
            if !matches!(state.closing, Closing::Open) {
                return;
            }
            if matches!(closing, Closing::Failed(_)) {
                state.buffer.clear();
            }
            state.closing = closing;
        }
        FeedInner::drain(&self.inner);
    }

    /// Number of items waiting for demand.
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }
}

impl<T: Send + 'static> Publisher<T> for Feed<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::NotSubscribed {
                return Err(CacheError::already_subscribed(&format!(
                    "feed {}",
                    self.inner.name
                )));
            }
            state.phase = Phase::Active;
            state.subscriber = Some(Arc::clone(&subscriber));
            // Hold back delivery until on_subscribe has returned.
            state.draining = true;
        }

        let subscription: Arc<dyn Subscription> = Arc::new(FeedSubscription {
            inner: Arc::downgrade(&self.inner),
        });
        subscriber.on_subscribe(subscription);

        self.inner.state.lock().draining = false;
        FeedInner::drain(&self.inner);
        Ok(())
    }
}

impl<T: Send + 'static> FeedInner<T> {
    /// Deliver whatever demand and buffer allow. Only one thread delivers at a time.
    fn drain(inner: &Arc<FeedInner<T>>) {
        let mut state = inner.state.lock();
        if state.draining {
            return;
        }
        state.draining = true;

        loop {
            let Some(subscriber) = state.subscriber.clone() else {
                break;
            };

            let signal = if let Closing::Failed(error) = &state.closing {
                Some(Signal::Error(error.clone()))
            } else if state.demand > 0 && !state.buffer.is_empty() {
                if state.demand != u64::MAX {
                    state.demand -= 1;
                }
                state.buffer.pop_front().map(Signal::Next)
            } else if state.buffer.is_empty() && matches!(state.closing, Closing::Completed) {
                Some(Signal::Complete)
            } else {
                None
            };

            let Some(signal) = signal else {
                break;
            };

            if !matches!(signal, Signal::Next(_)) {
                state.phase = Phase::Terminal;
                state.subscriber = None;
            }

            drop(state);
            match signal {
                Signal::Next(item) => subscriber.on_next(item),
                Signal::Complete => {
                    debug!(feed = %inner.name, "Feed completed");
                    subscriber.on_complete();
                }
                Signal::Error(error) => {
                    debug!(feed = %inner.name, error = %error, "Feed failed");
                    subscriber.on_error(error);
                }
            }
            state = inner.state.lock();
        }

        state.draining = false;
    }
}

struct FeedSubscription<T> {
    inner: Weak<FeedInner<T>>,
}

impl<T: Send + 'static> Subscription for FeedSubscription<T> {
    fn request(&self, n: u64) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if n == 0 {
            let mut state = inner.state.lock();
            if state.phase == Phase::Active {
                state.buffer.clear();
                state.closing = Closing::Failed(CacheError::InvalidArgument(
                    "demand must be positive".to_string(),
                ));
            }
        } else {
            let mut state = inner.state.lock();
            state.demand = add_demand(state.demand, n);
        }
        FeedInner::drain(&inner);
    }

    fn cancel(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock();
        if state.phase == Phase::Active {
            debug!(feed = %inner.name, "Feed subscription cancelled");
        }
        state.phase = Phase::Terminal;
        state.subscriber = None;
        state.buffer.clear();
    }
}
