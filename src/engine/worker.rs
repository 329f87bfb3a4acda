//! The engine's single execution context.
//!
//! One worker thread per engine owns the current snapshot and every
//! subscriber slot. Commands arrive on one FIFO channel, so mutations,
//! subscriptions and image requests are serviced in the order they were
//! made.

use super::cache::Shared;
use super::types::{Command, Termination};
use crate::error::CacheError;
use crate::flow::{add_demand, Subscriber, SubscriberKey, Subscription};
use crate::mutation::{check_result, Mutation, MutationResult};
use crate::snapshot::CacheSnapshot;
use crate::types::ChangeSet;
use crossbeam_channel::{Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Subscription to an engine.
///
/// Demand is recorded here straight away and absorbed by the worker the
/// next time it looks at the slot; the command only wakes the worker.
pub(crate) struct EngineSubscription {
    key: SubscriberKey,
    commands: Sender<Command>,
    pending: AtomicU64,
    invalid: AtomicBool,
    cancelled: AtomicBool,
}

impl Subscription for EngineSubscription {
    fn request(&self, n: u64) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        if n == 0 {
            self.invalid.store(true, Ordering::SeqCst);
        } else {
            let _ = self
                .pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| Some(add_demand(p, n)));
        }
        let _ = self.commands.send(Command::Demand(self.key));
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Cancel(self.key));
        }
    }
}

/// Per-subscriber delivery state.
struct Slot {
    subscriber: Arc<dyn Subscriber<ChangeSet>>,
    subscription: Arc<EngineSubscription>,
    demand: u64,
    /// Change sets published but not yet delivered.
    backlog: VecDeque<ChangeSet>,
}

impl Slot {
    fn is_cancelled(&self) -> bool {
        self.subscription.cancelled.load(Ordering::SeqCst)
    }

    /// Move demand recorded by the subscription into the slot.
    fn absorb(&mut self) -> Result<(), CacheError> {
        if self.subscription.invalid.load(Ordering::SeqCst) {
            return Err(CacheError::InvalidArgument(
                "demand must be positive".to_string(),
            ));
        }
        let pending = self.subscription.pending.swap(0, Ordering::SeqCst);
        self.demand = add_demand(self.demand, pending);
        Ok(())
    }

    /// Deliver as much of the backlog as demand allows, including demand
    /// signalled from inside `on_next`.
    fn flush(&mut self) -> Result<(), CacheError> {
        loop {
            // Cancellation may come from inside `on_next`.
            if self.is_cancelled() {
                self.backlog.clear();
                return Ok(());
            }
            self.absorb()?;
            if self.demand == 0 {
                return Ok(());
            }
            let Some(change_set) = self.backlog.pop_front() else {
                return Ok(());
            };
            if self.demand != u64::MAX {
                self.demand -= 1;
            }
            self.subscriber.on_next(change_set);
        }
    }
}

/// Subscription handed to subscribers of a retired engine.
struct ClosedSubscription;

impl Subscription for ClosedSubscription {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    snapshot: CacheSnapshot,
    slots: HashMap<SubscriberKey, Slot>,
}

impl Worker {
    pub(crate) fn new(shared: Arc<Shared>, snapshot: CacheSnapshot) -> Self {
        Self {
            shared,
            snapshot,
            slots: HashMap::new(),
        }
    }

    pub(crate) fn run(mut self, commands: Receiver<Command>) {
        info!(engine_id = %self.shared.id, objects = self.snapshot.len(), "Cache engine started");

        let termination = loop {
            let Ok(command) = commands.recv() else {
                break Termination::Completed;
            };
            match command {
                Command::Apply(mutation) => {
                    if let Err(error) = self.apply(mutation) {
                        break Termination::Failed(error);
                    }
                }
                Command::Subscribe { key, subscriber } => self.add(key, subscriber),
                Command::SendImage(key) => self.send_image(key),
                Command::Demand(key) => self.flush(key),
                Command::Cancel(key) => self.cancel(key),
                Command::Close => break Termination::Completed,
                Command::Fail(error) => break Termination::Failed(error),
            }
        };

        self.retire(termination, &commands);
    }

    fn apply(&mut self, mutation: Box<dyn Mutation>) -> Result<(), CacheError> {
        let result = mutation
            .execute(&self.snapshot)
            .and_then(|result| check_result(mutation.as_ref(), &result).map(|_| result))
            .map_err(|error| match error {
                CacheError::MutationFailed { .. } => error,
                other => CacheError::MutationFailed {
                    id: mutation.id().to_string(),
                    reason: other.to_string(),
                },
            });

        let MutationResult {
            snapshot,
            change_set,
        } = match result {
            Ok(result) => result,
            Err(error) => {
                warn!(engine_id = %self.shared.id, error = %error, "Mutation failed, retiring engine");
                return Err(error);
            }
        };

        if snapshot.same_as(&self.snapshot) {
            debug!(engine_id = %self.shared.id, mutation_id = mutation.id(), "Mutation made no change");
            return Ok(());
        }

        self.snapshot = snapshot;
        *self.shared.snapshot.write() = self.snapshot.clone();
        self.publish(change_set);
        Ok(())
    }

    /// Queue a change set for every subscriber, dropping those over the limit.
    fn publish(&mut self, change_set: ChangeSet) {
        debug!(
            engine_id = %self.shared.id,
            change_set_id = change_set.id(),
            puts = change_set.puts().len(),
            removes = change_set.removes().len(),
            subscribers = self.slots.len(),
            "Publishing change set"
        );

        let keys: Vec<SubscriberKey> = self.slots.keys().copied().collect();
        for key in keys {
            self.enqueue(key, change_set.clone());
        }
    }

    fn enqueue(&mut self, key: SubscriberKey, change_set: ChangeSet) {
        let limit = self.shared.backlog_limit;
        let Some(slot) = self.slots.get_mut(&key) else {
            return;
        };
        // The queued cancel command completes it.
        if slot.is_cancelled() {
            return;
        }
        slot.backlog.push_back(change_set);
        if let Err(error) = slot.flush() {
            self.terminate(key, Some(error));
            return;
        }

        if slot.backlog.len() > limit {
            warn!(
                engine_id = %self.shared.id,
                subscriber = ?key,
                backlog = slot.backlog.len(),
                limit,
                "Dropping slow subscriber"
            );
            self.terminate(key, Some(CacheError::SlowConsumer { limit }));
        }
    }

    fn add(&mut self, key: SubscriberKey, subscriber: Arc<dyn Subscriber<ChangeSet>>) {
        let subscription = Arc::new(EngineSubscription {
            key,
            commands: self.shared.commands.clone(),
            pending: AtomicU64::new(0),
            invalid: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });
        self.slots.insert(
            key,
            Slot {
                subscriber: Arc::clone(&subscriber),
                subscription: Arc::clone(&subscription),
                demand: 0,
                backlog: VecDeque::new(),
            },
        );
        self.update_count();
        debug!(engine_id = %self.shared.id, subscriber = ?key, "Subscriber added");

        subscriber.on_subscribe(subscription);
        self.send_image(key);
    }

    fn send_image(&mut self, key: SubscriberKey) {
        if !self.slots.contains_key(&key) {
            return;
        }
        let image = self.snapshot.to_image_change_set();
        debug!(
            engine_id = %self.shared.id,
            subscriber = ?key,
            change_set_id = image.id(),
            objects = image.puts().len(),
            "Sending image"
        );
        self.enqueue(key, image);
    }

    fn flush(&mut self, key: SubscriberKey) {
        let Some(slot) = self.slots.get_mut(&key) else {
            return;
        };
        if let Err(error) = slot.flush() {
            self.terminate(key, Some(error));
        }
    }

    fn cancel(&mut self, key: SubscriberKey) {
        if self.slots.contains_key(&key) {
            debug!(engine_id = %self.shared.id, subscriber = ?key, "Subscriber cancelled");
            self.terminate(key, None);
        }
    }

    /// Remove a slot and send its terminal signal.
    fn terminate(&mut self, key: SubscriberKey, error: Option<CacheError>) {
        let Some(slot) = self.slots.remove(&key) else {
            return;
        };
        self.update_count();
        match error {
            Some(error) => slot.subscriber.on_error(error),
            None => slot.subscriber.on_complete(),
        }
    }

    fn update_count(&self) {
        self.shared
            .subscriber_count
            .store(self.slots.len(), Ordering::SeqCst);
    }

    fn retire(mut self, termination: Termination, commands: &Receiver<Command>) {
        // After this no new command can be accepted.
        self.shared.lifecycle.write().retired = Some(termination.clone());

        match &termination {
            Termination::Completed => {
                info!(engine_id = %self.shared.id, "Cache engine completed")
            }
            Termination::Failed(error) => {
                warn!(engine_id = %self.shared.id, error = %error, "Cache engine failed")
            }
        }

        let error = match termination {
            Termination::Completed => None,
            Termination::Failed(error) => Some(error),
        };

        // Subscriptions that were accepted but not yet serviced.
        for command in commands.try_iter() {
            if let Command::Subscribe { subscriber, .. } = command {
                subscriber.on_subscribe(Arc::new(ClosedSubscription));
                match &error {
                    Some(error) => subscriber.on_error(error.clone()),
                    None => subscriber.on_complete(),
                }
            }
        }

        let keys: Vec<SubscriberKey> = self.slots.keys().copied().collect();
        for key in keys {
            let cancelled = self.slots.get(&key).is_some_and(Slot::is_cancelled);
            if cancelled {
                self.terminate(key, None);
                continue;
            }
            if error.is_none() {
                // A clean close hands over what demand already allows.
                self.flush(key);
            }
            self.terminate(key, error.clone());
        }
    }
}
