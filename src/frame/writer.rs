//! Streams change sets onto an ordered message sink.

use super::assembler::FrameAssembler;
use super::message::FrameMessage;
use crate::error::{CacheError, Result};
use crate::flow::{Subscriber, Subscription};
use crate::types::ChangeSet;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// An ordered, reliable destination for frame messages.
pub trait MessageSink: Send + Sync {
    fn send(&self, message: FrameMessage) -> Result<()>;

    /// The stream ended normally.
    fn close(&self) {}

    /// The stream ended with `error`.
    fn fail(&self, _error: &CacheError) {}
}

impl MessageSink for Sender<FrameMessage> {
    fn send(&self, message: FrameMessage) -> Result<()> {
        Sender::send(self, message)
            .map_err(|_| CacheError::Transport("message receiver disconnected".to_string()))
    }
}

/// A change-set subscriber that writes each change set as a frame.
///
/// Requests one change set at a time, so a slow sink slows the stream
/// instead of buffering inside the writer. If the sink refuses a message
/// the upstream subscription is cancelled.
pub struct FrameWriter {
    assembler: FrameAssembler,
    sink: Box<dyn MessageSink>,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    stopped: AtomicBool,
    frames_written: AtomicU64,
}

impl FrameWriter {
    pub fn new(sink: impl MessageSink + 'static) -> Arc<Self> {
        Arc::new(Self {
            assembler: FrameAssembler::new(),
            sink: Box::new(sink),
            subscription: Mutex::new(None),
            stopped: AtomicBool::new(false),
            frames_written: AtomicU64::new(0),
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::SeqCst)
    }

    /// True once the stream ended or the sink failed.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn write(&self, change_set: &ChangeSet) -> Result<()> {
        for message in self.assembler.assemble(change_set) {
            self.sink.send(message)?;
        }
        Ok(())
    }
}

impl Subscriber<ChangeSet> for FrameWriter {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.subscription.lock() = Some(Arc::clone(&subscription));
        subscription.request(1);
    }

    fn on_next(&self, change_set: ChangeSet) {
        if self.is_stopped() {
            return;
        }
        let subscription = self.subscription.lock().clone();

        if let Err(error) = self.write(&change_set) {
            warn!(change_set_id = change_set.id(), error = %error, "Frame write failed, cancelling");
            self.stopped.store(true, Ordering::SeqCst);
            if let Some(subscription) = subscription {
                subscription.cancel();
            }
            self.sink.fail(&error);
            return;
        }

        self.frames_written.fetch_add(1, Ordering::SeqCst);
        debug!(change_set_id = change_set.id(), "Frame written");
        if let Some(subscription) = subscription {
            subscription.request(1);
        }
    }

    fn on_error(&self, error: CacheError) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.sink.fail(&error);
        }
    }

    fn on_complete(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.sink.close();
        }
    }
}
