//! Selector and authorisor composed over an image source.

use super::processor::ChangeSetProcessor;
use super::selector::Selector;
use crate::error::{CacheError, Result};
use crate::flow::{ImageSource, Phase, Publisher, Subscriber};
use crate::types::ChangeSet;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// A filtered, access-controlled live view of a cache.
///
/// Change sets flow source -> selector -> authorisor -> subscriber. The
/// selector picks what the client asked to see, the authorisor removes what
/// it may not see. Demand and cancellation from the subscriber travel the
/// same chain back to the source, so cancelling a view releases its
/// subscription to the engine and nothing else.
pub struct View {
    selector: Arc<ChangeSetProcessor>,
    authorisor: Arc<ChangeSetProcessor>,
    phase: Mutex<Phase>,
}

impl View {
    pub fn new<S: ImageSource + 'static>(
        source: Arc<S>,
        selectors: Arc<dyn Publisher<Selector>>,
        authorisations: Arc<dyn Publisher<Selector>>,
    ) -> Result<Self> {
        let selector = ChangeSetProcessor::new("selector", selectors);
        selector.connect_to(source)?;

        let authorisor = ChangeSetProcessor::new("authorisor", authorisations);
        authorisor.connect_to(Arc::clone(&selector))?;

        Ok(Self {
            selector,
            authorisor,
            phase: Mutex::new(Phase::NotSubscribed),
        })
    }

    pub fn selector(&self) -> &Arc<ChangeSetProcessor> {
        &self.selector
    }

    pub fn authorisor(&self) -> &Arc<ChangeSetProcessor> {
        &self.authorisor
    }

    /// `NotSubscribed` until subscribed, `Terminal` once the chain has ended.
    pub fn phase(&self) -> Phase {
        match *self.phase.lock() {
            Phase::NotSubscribed => Phase::NotSubscribed,
            _ => self.authorisor.phase(),
        }
    }
}

impl Publisher<ChangeSet> for View {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<ChangeSet>>) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            if *phase != Phase::NotSubscribed {
                return Err(CacheError::already_subscribed("view"));
            }
            *phase = Phase::Active;
        }
        debug!("View subscribed");
        self.authorisor.subscribe(subscriber)
    }
}

impl ImageSource for View {
    fn request_image(&self, subscriber: &Arc<dyn Subscriber<ChangeSet>>) -> Result<()> {
        self.authorisor.request_image(subscriber)
    }
}
