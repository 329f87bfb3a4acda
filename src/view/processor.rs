//! A change-set stage that filters puts through a swappable selector.

use super::selector::Selector;
use crate::error::{CacheError, Result};
use crate::flow::{add_demand, ImageSource, Phase, Publisher, Subscriber, SubscriberKey, Subscription};
use crate::types::{ChangeSet, RemoveMarker};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Rewrite a change set through `selector`.
///
/// Removes pass through. Selected puts stay puts; every other put becomes a
/// remove, as does every put when there is no selector yet. The tracking id
/// and image flag are kept.
pub fn rewrite(change_set: &ChangeSet, selector: Option<&Selector>) -> ChangeSet {
    let mut puts = Vec::new();
    let mut removes: Vec<RemoveMarker> = change_set.removes().to_vec();
    let mut removed: HashSet<&str> = change_set.removes().iter().map(RemoveMarker::id).collect();

    for object in change_set.puts() {
        if selector.is_some_and(|s| s.matches(object)) {
            puts.push(object.clone());
        } else if removed.insert(object.id()) {
            removes.push(object.to_remove());
        }
    }

    ChangeSet::from_parts(
        change_set.id().to_string(),
        puts,
        removes,
        change_set.is_image(),
    )
}

struct Upstream {
    images: Arc<dyn ImageSource>,
    change_sets: Arc<dyn Publisher<ChangeSet>>,
}

enum Signal {
    Next(ChangeSet),
    Error(CacheError),
    Complete,
}

struct ProcessorState {
    phase: Phase,
    upstream: Option<Upstream>,
    downstream: Option<Arc<dyn Subscriber<ChangeSet>>>,
    change_set_subscription: Option<Arc<dyn Subscription>>,
    selector_subscription: Option<Arc<dyn Subscription>>,
    /// Demand signalled before the upstream subscription arrived.
    deferred_demand: u64,
    current: Option<Selector>,
    pending: Option<Selector>,
    image_requested: bool,
    /// Downstream signals awaiting delivery, in order.
    outbox: VecDeque<Signal>,
    emitting: bool,
}

/// Filters an upstream change-set stream with the latest selector from a
/// selector stream.
///
/// A new selector only takes effect at an image boundary. On receiving one
/// the processor asks its upstream for a fresh image and holds the selector
/// as pending; the next image promotes it. Selectors arriving in the
/// meantime replace the pending one without asking for another image.
///
/// The processor accepts one `connect` and one subscriber. Termination of
/// either input cancels the other and ends the output the same way.
pub struct ChangeSetProcessor {
    name: String,
    selectors: Arc<dyn Publisher<Selector>>,
    /// Our identity towards the upstream; fixed so image requests match.
    change_set_side: Arc<dyn Subscriber<ChangeSet>>,
    selector_side: Arc<dyn Subscriber<Selector>>,
    this: Weak<ChangeSetProcessor>,
    state: Mutex<ProcessorState>,
}

impl ChangeSetProcessor {
    pub fn new(name: impl Into<String>, selectors: Arc<dyn Publisher<Selector>>) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<ChangeSetProcessor>| Self {
            name: name.into(),
            selectors,
            change_set_side: Arc::new(ChangeSetSide {
                processor: this.clone(),
            }),
            selector_side: Arc::new(SelectorSide {
                processor: this.clone(),
            }),
            this: this.clone(),
            state: Mutex::new(ProcessorState {
                phase: Phase::NotSubscribed,
                upstream: None,
                downstream: None,
                change_set_subscription: None,
                selector_subscription: None,
                deferred_demand: 0,
                current: None,
                pending: None,
                image_requested: false,
                outbox: VecDeque::new(),
                emitting: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire the input. `images` must serve image requests for subscribers
    /// of `change_sets`.
    pub fn connect(
        &self,
        images: Arc<dyn ImageSource>,
        change_sets: Arc<dyn Publisher<ChangeSet>>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.upstream.is_some() {
            return Err(CacheError::InvalidState(format!(
                "processor {} is already connected",
                self.name
            )));
        }
        state.upstream = Some(Upstream {
            images,
            change_sets,
        });
        debug!(processor = %self.name, "Processor connected");
        Ok(())
    }

    /// Connect to a source that is both the image source and the publisher.
    pub fn connect_to<S: ImageSource + 'static>(&self, source: Arc<S>) -> Result<()> {
        let images: Arc<dyn ImageSource> = source.clone();
        let change_sets: Arc<dyn Publisher<ChangeSet>> = source;
        self.connect(images, change_sets)
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// The selector currently applied to puts.
    pub fn current_selector(&self) -> Option<Selector> {
        self.state.lock().current.clone()
    }

    fn on_change_set_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let demand = {
            let mut state = self.state.lock();
            if state.phase == Phase::Terminal {
                None
            } else {
                state.change_set_subscription = Some(Arc::clone(&subscription));
                Some(std::mem::take(&mut state.deferred_demand))
            }
        };
        match demand {
            None => subscription.cancel(),
            Some(0) => {}
            Some(n) => subscription.request(n),
        }
    }

    fn on_change_set(&self, change_set: ChangeSet) {
        let output = {
            let mut state = self.state.lock();
            if state.phase != Phase::Active {
                return;
            }
            if change_set.is_image() && state.pending.is_some() {
                state.current = state.pending.take();
                state.image_requested = false;
                debug!(
                    processor = %self.name,
                    change_set_id = change_set.id(),
                    selector = ?state.current,
                    "Selector promoted at image"
                );
            }
            rewrite(&change_set, state.current.as_ref())
        };
        self.emit(Signal::Next(output));
    }

    fn on_selector_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let live = {
            let mut state = self.state.lock();
            if state.phase == Phase::Terminal {
                false
            } else {
                state.selector_subscription = Some(Arc::clone(&subscription));
                true
            }
        };
        if live {
            subscription.request(1);
        } else {
            subscription.cancel();
        }
    }

    fn on_selector(&self, selector: Selector) {
        let (images, subscription) = {
            let mut state = self.state.lock();
            if state.phase != Phase::Active {
                return;
            }
            debug!(processor = %self.name, selector = ?selector, "Selector pending");
            state.pending = Some(selector);
            let images = if state.image_requested {
                None
            } else {
                state.image_requested = true;
                state.upstream.as_ref().map(|u| Arc::clone(&u.images))
            };
            (images, state.selector_subscription.clone())
        };

        if let Some(images) = images {
            if let Err(error) = images.request_image(&self.change_set_side) {
                self.shut_down(Some(Signal::Error(error)));
                return;
            }
        }
        if let Some(subscription) = subscription {
            subscription.request(1);
        }
    }

    fn request(&self, n: u64) {
        if n == 0 {
            self.shut_down(Some(Signal::Error(CacheError::InvalidArgument(
                "demand must be positive".to_string(),
            ))));
            return;
        }
        let subscription = {
            let mut state = self.state.lock();
            if state.phase != Phase::Active {
                return;
            }
            match &state.change_set_subscription {
                Some(subscription) => Arc::clone(subscription),
                None => {
                    state.deferred_demand = add_demand(state.deferred_demand, n);
                    return;
                }
            }
        };
        subscription.request(n);
    }

    fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Active {
                state.outbox.retain(|signal| !matches!(signal, Signal::Next(_)));
            }
        }
        self.shut_down(Some(Signal::Complete));
    }

    /// Stop both inputs and end the output with `signal`. Only the first
    /// call has any effect.
    fn shut_down(&self, signal: Option<Signal>) {
        let (change_sets, selectors) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Terminal {
                return;
            }
            state.phase = Phase::Terminal;
            (
                state.change_set_subscription.take(),
                state.selector_subscription.take(),
            )
        };

        match &signal {
            Some(Signal::Error(error)) => {
                info!(processor = %self.name, error = %error, "Processor terminated")
            }
            _ => info!(processor = %self.name, "Processor completed"),
        }

        if let Some(subscription) = change_sets {
            subscription.cancel();
        }
        if let Some(subscription) = selectors {
            subscription.cancel();
        }
        if let Some(signal) = signal {
            self.emit(signal);
        }
    }

    /// Queue a downstream signal and deliver the queue unless another
    /// thread is already delivering it.
    fn emit(&self, signal: Signal) {
        let downstream = {
            let mut state = self.state.lock();
            if matches!(signal, Signal::Next(_)) && state.phase != Phase::Active {
                return;
            }
            state.outbox.push_back(signal);
            if state.emitting {
                return;
            }
            match state.downstream.clone() {
                Some(downstream) => {
                    state.emitting = true;
                    downstream
                }
                None => {
                    state.outbox.clear();
                    return;
                }
            }
        };

        loop {
            let signal = {
                let mut state = self.state.lock();
                match state.outbox.pop_front() {
                    Some(signal) => signal,
                    None => {
                        state.emitting = false;
                        return;
                    }
                }
            };
            match signal {
                Signal::Next(change_set) => downstream.on_next(change_set),
                Signal::Error(error) => downstream.on_error(error),
                Signal::Complete => downstream.on_complete(),
            }
        }
    }
}

impl Publisher<ChangeSet> for ChangeSetProcessor {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<ChangeSet>>) -> Result<()> {
        let change_sets = {
            let mut state = self.state.lock();
            let Some(upstream) = &state.upstream else {
                return Err(CacheError::InvalidState(format!(
                    "processor {} is not connected",
                    self.name
                )));
            };
            let change_sets = Arc::clone(&upstream.change_sets);
            if state.phase != Phase::NotSubscribed {
                return Err(CacheError::already_subscribed(&format!(
                    "processor {}",
                    self.name
                )));
            }
            state.phase = Phase::Active;
            state.downstream = Some(Arc::clone(&subscriber));
            change_sets
        };
        debug!(processor = %self.name, "Processor subscribed");

        subscriber.on_subscribe(Arc::new(ProcessorSubscription {
            processor: self.this.clone(),
        }));

        if self.phase() != Phase::Active {
            return Ok(());
        }
        if let Err(error) = change_sets.subscribe(Arc::clone(&self.change_set_side)) {
            self.shut_down(Some(Signal::Error(error)));
            return Ok(());
        }
        if let Err(error) = self.selectors.subscribe(Arc::clone(&self.selector_side)) {
            self.shut_down(Some(Signal::Error(error)));
        }
        Ok(())
    }
}

impl ImageSource for ChangeSetProcessor {
    fn request_image(&self, subscriber: &Arc<dyn Subscriber<ChangeSet>>) -> Result<()> {
        let images = {
            let state = self.state.lock();
            let registered = state
                .downstream
                .as_ref()
                .is_some_and(|d| SubscriberKey::of(d) == SubscriberKey::of(subscriber));
            if !registered {
                return Err(CacheError::InvalidState(format!(
                    "subscriber is not subscribed to processor {}",
                    self.name
                )));
            }
            if state.phase != Phase::Active {
                return Err(CacheError::InvalidState(format!(
                    "processor {} has terminated",
                    self.name
                )));
            }
            match &state.upstream {
                Some(upstream) => Arc::clone(&upstream.images),
                None => {
                    return Err(CacheError::InvalidState(format!(
                        "processor {} is not connected",
                        self.name
                    )))
                }
            }
        };
        images.request_image(&self.change_set_side)
    }
}

impl Drop for ChangeSetProcessor {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(subscription) = state.change_set_subscription.take() {
            subscription.cancel();
        }
        if let Some(subscription) = state.selector_subscription.take() {
            subscription.cancel();
        }
    }
}

struct ProcessorSubscription {
    processor: Weak<ChangeSetProcessor>,
}

impl Subscription for ProcessorSubscription {
    fn request(&self, n: u64) {
        if let Some(processor) = self.processor.upgrade() {
            processor.request(n);
        }
    }

    fn cancel(&self) {
        if let Some(processor) = self.processor.upgrade() {
            processor.cancel();
        }
    }
}

struct ChangeSetSide {
    processor: Weak<ChangeSetProcessor>,
}

impl Subscriber<ChangeSet> for ChangeSetSide {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        match self.processor.upgrade() {
            Some(processor) => processor.on_change_set_subscribe(subscription),
            None => subscription.cancel(),
        }
    }

    fn on_next(&self, change_set: ChangeSet) {
        if let Some(processor) = self.processor.upgrade() {
            processor.on_change_set(change_set);
        }
    }

    fn on_error(&self, error: CacheError) {
        if let Some(processor) = self.processor.upgrade() {
            processor.shut_down(Some(Signal::Error(error)));
        }
    }

    fn on_complete(&self) {
        if let Some(processor) = self.processor.upgrade() {
            processor.shut_down(Some(Signal::Complete));
        }
    }
}

struct SelectorSide {
    processor: Weak<ChangeSetProcessor>,
}

impl Subscriber<Selector> for SelectorSide {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        match self.processor.upgrade() {
            Some(processor) => processor.on_selector_subscribe(subscription),
            None => subscription.cancel(),
        }
    }

    fn on_next(&self, selector: Selector) {
        if let Some(processor) = self.processor.upgrade() {
            processor.on_selector(selector);
        }
    }

    fn on_error(&self, error: CacheError) {
        if let Some(processor) = self.processor.upgrade() {
            processor.shut_down(Some(Signal::Error(error)));
        }
    }

    fn on_complete(&self) {
        if let Some(processor) = self.processor.upgrade() {
            processor.shut_down(Some(Signal::Complete));
        }
    }
}
