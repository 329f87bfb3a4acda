//! Filtered views over a change-set stream.
//!
//! A [`ChangeSetProcessor`] rewrites every change set through the current
//! [`Selector`]: removes pass through, selected puts stay puts, all other
//! puts become removes. Selectors arrive on their own stream and only take
//! effect at the next image, so a client never sees half an image under
//! one selector and half under another.
//!
//! A [`View`] chains two processors, a selector and an authorisor, between
//! an engine and one subscriber.
//!
//! # Example
//!
//! ```ignore
//! let selectors = Feed::new("selectors");
//! let authorisations = Feed::new("authorisations");
//! let view = View::new(engine, Arc::new(selectors.clone()), Arc::new(authorisations.clone()))?;
//!
//! let handle = SubscriptionHandle::unbounded();
//! view.subscribe(handle.subscriber())?;
//! selectors.push(Selector::by_type("order"))?;
//! authorisations.push(Selector::all())?;
//! ```

mod processor;
mod selector;
#[allow(clippy::module_inception)]
mod view;

pub use processor::{rewrite, ChangeSetProcessor};
pub use selector::Selector;
pub use view::View;
