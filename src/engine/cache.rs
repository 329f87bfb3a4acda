//! The public engine handle.

use super::types::{Command, EngineConfig, Termination};
use super::worker::Worker;
use crate::error::{CacheError, Result};
use crate::flow::{ImageSource, Publisher, Subscriber, SubscriberKey, Subscription};
use crate::mutation::Mutation;
use crate::snapshot::CacheSnapshot;
use crate::types::ChangeSet;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::debug;

pub(crate) struct Lifecycle {
    pub(crate) retired: Option<Termination>,
    /// Every subscriber ever registered and still alive.
    registered: HashMap<SubscriberKey, Weak<dyn Subscriber<ChangeSet>>>,
}

/// State shared between the handle and the worker thread.
pub(crate) struct Shared {
    pub(crate) id: String,
    pub(crate) backlog_limit: usize,
    pub(crate) commands: Sender<Command>,
    pub(crate) lifecycle: RwLock<Lifecycle>,
    /// Latest applied snapshot, for readers outside the worker.
    pub(crate) snapshot: RwLock<CacheSnapshot>,
    pub(crate) subscriber_count: AtomicUsize,
}

impl Shared {
    /// Send a command unless the engine has retired.
    ///
    /// The read lock is held across the send so retirement (a write lock)
    /// cannot slip in between the check and the send.
    fn send_live(&self, command: Command) -> Result<()> {
        let lifecycle = self.lifecycle.read();
        if lifecycle.retired.is_some() {
            return Err(self.retired_error());
        }
        self.commands
            .send(command)
            .map_err(|_| self.retired_error())
    }

    fn retired_error(&self) -> CacheError {
        CacheError::InvalidState(format!("cache engine {} has retired", self.id))
    }
}

/// A live cache that applies mutations one at a time and streams the
/// resulting change sets to its subscribers.
///
/// Every subscriber first receives an image of the cache, then each
/// published change set in order. Delivery honours demand; a subscriber
/// whose undelivered backlog exceeds the configured limit is dropped with
/// [`CacheError::SlowConsumer`].
///
/// Once the mutation source completes ([`CacheEngine::close`]) or fails
/// ([`CacheEngine::fail`], or a failing mutation) every subscriber is
/// terminated and the engine is retired for good.
pub struct CacheEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CacheEngine {
    /// Start an empty engine.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_snapshot(config, CacheSnapshot::new())
    }

    /// Start an engine holding `snapshot`.
    pub fn with_snapshot(config: EngineConfig, snapshot: CacheSnapshot) -> Result<Self> {
        config.validate()?;

        let (commands, receiver) = unbounded();
        let shared = Arc::new(Shared {
            id: config.id.clone(),
            backlog_limit: config.backlog_limit,
            commands,
            lifecycle: RwLock::new(Lifecycle {
                retired: None,
                registered: HashMap::new(),
            }),
            snapshot: RwLock::new(snapshot.clone()),
            subscriber_count: AtomicUsize::new(0),
        });

        let worker = Worker::new(Arc::clone(&shared), snapshot);
        let handle = thread::Builder::new()
            .name(format!("cache-engine-{}", config.id))
            .spawn(move || worker.run(receiver))
            .map_err(|e| {
                CacheError::InvalidState(format!("failed to start engine worker: {e}"))
            })?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn backlog_limit(&self) -> usize {
        self.shared.backlog_limit
    }

    /// Queue a mutation. Returns at once; the worker applies it in turn.
    pub fn submit(&self, mutation: impl Mutation + 'static) -> Result<()> {
        self.submit_boxed(Box::new(mutation))
    }

    pub fn submit_boxed(&self, mutation: Box<dyn Mutation>) -> Result<()> {
        debug!(engine_id = %self.shared.id, mutation_id = mutation.id(), "Mutation submitted");
        self.shared.send_live(Command::Apply(mutation))
    }

    /// Signal that no more mutations will come. Queued work is applied
    /// first, then every subscriber completes.
    /// Does nothing once the engine has retired.
    pub fn close(&self) {
        if let Err(error) = self.shared.send_live(Command::Close) {
            debug!(engine_id = %self.shared.id, error = %error, "Close ignored");
        }
    }

    /// Signal that the mutation source failed. Every subscriber gets `error`.
    /// Does nothing once the engine has retired.
    pub fn fail(&self, error: CacheError) {
        if let Err(refused) = self.shared.send_live(Command::Fail(error)) {
            debug!(engine_id = %self.shared.id, error = %refused, "Fail ignored");
        }
    }

    pub fn is_retired(&self) -> bool {
        self.shared.lifecycle.read().retired.is_some()
    }

    /// How the engine ended, once it has.
    pub fn termination(&self) -> Option<Termination> {
        self.shared.lifecycle.read().retired.clone()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscriber_count.load(Ordering::SeqCst)
    }

    /// The latest applied snapshot.
    pub fn snapshot(&self) -> CacheSnapshot {
        self.shared.snapshot.read().clone()
    }

    /// A subscriber that feeds mutations from any publisher into this
    /// engine. Completion or error of that publisher retires the engine.
    pub fn mutation_subscriber(&self) -> Arc<dyn Subscriber<Box<dyn Mutation>>> {
        Arc::new(MutationIntake {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Wait for the worker thread to finish. Call after `close` or `fail`.
    pub fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Publisher<ChangeSet> for CacheEngine {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<ChangeSet>>) -> Result<()> {
        let key = SubscriberKey::of(&subscriber);
        let mut lifecycle = self.shared.lifecycle.write();
        if lifecycle.retired.is_some() {
            return Err(self.shared.retired_error());
        }

        lifecycle.registered.retain(|_, weak| weak.strong_count() > 0);
        if lifecycle.registered.contains_key(&key) {
            return Err(CacheError::InvalidState(format!(
                "subscriber is already registered with cache engine {}",
                self.shared.id
            )));
        }
        lifecycle.registered.insert(key, Arc::downgrade(&subscriber));

        self.shared
            .commands
            .send(Command::Subscribe { key, subscriber })
            .map_err(|_| self.shared.retired_error())
    }
}

impl ImageSource for CacheEngine {
    fn request_image(&self, subscriber: &Arc<dyn Subscriber<ChangeSet>>) -> Result<()> {
        let key = SubscriberKey::of(subscriber);
        if !self.shared.lifecycle.read().registered.contains_key(&key) {
            return Err(CacheError::InvalidState(format!(
                "subscriber is not registered with cache engine {}",
                self.shared.id
            )));
        }
        self.shared.send_live(Command::SendImage(key))
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        let _ = self.shared.send_live(Command::Close);
    }
}

/// Forwards a stream of mutations into the engine's command queue.
struct MutationIntake {
    shared: Arc<Shared>,
}

impl Subscriber<Box<dyn Mutation>> for MutationIntake {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(u64::MAX);
    }

    fn on_next(&self, mutation: Box<dyn Mutation>) {
        let _ = self.shared.send_live(Command::Apply(mutation));
    }

    fn on_error(&self, error: CacheError) {
        let _ = self
            .shared
            .send_live(Command::Fail(CacheError::UpstreamTerminated(error.to_string())));
    }

    fn on_complete(&self) {
        let _ = self.shared.send_live(Command::Close);
    }
}
