//! Demand-driven streams.
//!
//! Every stream in the crate (engine output, view output, selector input)
//! speaks the same small protocol:
//! - a [`Publisher`] accepts a [`Subscriber`] and hands it a [`Subscription`]
//! - the subscriber signals demand with [`Subscription::request`]
//! - the publisher never delivers beyond outstanding demand
//! - a stream ends with exactly one `on_complete` or `on_error`
//!
//! [`Feed`] is a buffered source driven by application code and
//! [`SubscriptionHandle`] a channel-backed sink for blocking consumers.
//!
//! # Example
//!
//! ```ignore
//! let selectors = Feed::new("selectors");
//! let handle = SubscriptionHandle::with_demand(16);
//! selectors.subscribe(handle.subscriber())?;
//!
//! selectors.push(Selector::by_type("order"))?;
//! match handle.recv()? {
//!     StreamEvent::Item(selector) => println!("Got {:?}", selector),
//!     StreamEvent::Completed | StreamEvent::Error(_) => {}
//! }
//! ```

mod feed;
mod handle;
mod types;

pub use feed::Feed;
pub use handle::{StreamEvent, SubscriptionHandle};
pub(crate) use types::add_demand;
pub use types::{ImageSource, Phase, Publisher, Subscriber, SubscriberKey, Subscription};
