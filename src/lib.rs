//! # JSON Cache
//!
//! A live, in-process cache of JSON objects that streams every change to
//! filtered, flow-controlled subscribers.
//!
//! ## Core Concepts
//!
//! - **Snapshots**: Immutable id -> object maps with cheap structural sharing
//! - **Mutations**: Functions from a snapshot to a new snapshot plus the change set describing it
//! - **Engine**: Applies mutations one at a time and publishes change sets, image first
//! - **Views**: Selector and authorisor stages that filter a change-set stream
//! - **Frames**: The ordered wire form of a change set (start, puts, removes, end)
//!
//! ## Example
//!
//! ```ignore
//! use jsoncache::{ApplyChangeSet, CacheEngine, CacheObject, EngineConfig, Publisher, SubscriptionHandle};
//!
//! let engine = CacheEngine::new(EngineConfig::new("orders", 1000))?;
//!
//! let handle = SubscriptionHandle::unbounded();
//! engine.subscribe(handle.subscriber())?;
//!
//! // Put an object
//! let order = CacheObject::new("order-1", "order", json!({ "qty": 10 }))?;
//! engine.submit(ApplyChangeSet::from_parts(vec![order], vec![])?)?;
//!
//! // First the image, then the change
//! let image = handle.recv()?;
//! let change = handle.recv()?;
//! ```

pub mod engine;
pub mod error;
pub mod flow;
pub mod frame;
pub mod mirror;
pub mod mutation;
pub mod snapshot;
pub mod types;
pub mod view;

// Re-exports
pub use engine::{CacheEngine, EngineConfig, Termination, DEFAULT_BACKLOG_LIMIT};
pub use error::{CacheError, Result};
pub use flow::{
    Feed, ImageSource, Phase, Publisher, StreamEvent, Subscriber, SubscriberKey, Subscription,
    SubscriptionHandle,
};
pub use frame::{
    DisassemblerPhase, FrameAssembler, FrameDisassembler, FrameEnd, FrameMessage, FrameReceiver,
    FrameStart, FrameWriter, MessageSink,
};
pub use mirror::CacheMirror;
pub use mutation::{ApplyChangeSet, CacheFunction, Mutation, MutationResult};
pub use snapshot::{CacheSnapshot, PutOutcome, RemoveOutcome};
pub use types::*;
pub use view::{ChangeSetProcessor, Selector, View};
