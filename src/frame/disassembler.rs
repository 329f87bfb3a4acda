//! Frame to change set.

use super::message::{FrameMessage, FrameStart};
use crate::error::{CacheError, Result};
use crate::types::{CacheObject, ChangeSet, RemoveMarker};
use std::fmt;
use tracing::{debug, warn};

/// Receives the change sets rebuilt by a [`FrameDisassembler`].
pub trait FrameReceiver: Send {
    fn on_change_set(&mut self, change_set: ChangeSet);

    /// Called once when the disassembler fails. Nothing follows it.
    fn on_protocol_error(&mut self, _error: &CacheError) {}
}

impl<F> FrameReceiver for F
where
    F: FnMut(ChangeSet) + Send,
{
    fn on_change_set(&mut self, change_set: ChangeSet) {
        self(change_set)
    }
}

/// Where a disassembler is within the current frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisassemblerPhase {
    AwaitingStart,
    CollectingPuts,
    CollectingRemoves,
    AwaitingEnd,
    Failed,
}

impl fmt::Display for DisassemblerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisassemblerPhase::AwaitingStart => "awaiting start",
            DisassemblerPhase::CollectingPuts => "collecting puts",
            DisassemblerPhase::CollectingRemoves => "collecting removes",
            DisassemblerPhase::AwaitingEnd => "awaiting end",
            DisassemblerPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

const PREALLOCATE_LIMIT: usize = 1024;

/// The frame being collected.
struct Partial {
    start: FrameStart,
    puts: Vec<CacheObject>,
    removes: Vec<RemoveMarker>,
}

impl Partial {
    fn phase(&self) -> DisassemblerPhase {
        if self.puts.len() < self.start.num_puts {
            DisassemblerPhase::CollectingPuts
        } else if self.removes.len() < self.start.num_removes {
            DisassemblerPhase::CollectingRemoves
        } else {
            DisassemblerPhase::AwaitingEnd
        }
    }
}

enum State {
    AwaitingStart,
    InFrame(Partial),
    Failed(CacheError),
}

/// Rebuilds change sets from an ordered stream of frame messages.
///
/// Expects exactly the declared number of puts, then removes, then an end
/// with the start's id. Any deviation fails the disassembler for good; it
/// never tries to find the next frame. Meant for a single ordered caller.
pub struct FrameDisassembler {
    state: State,
    receiver: Option<Box<dyn FrameReceiver>>,
}

impl FrameDisassembler {
    pub fn new() -> Self {
        Self {
            state: State::AwaitingStart,
            receiver: None,
        }
    }

    /// Register the receiver of completed change sets. Allowed once.
    pub fn connect(&mut self, receiver: impl FrameReceiver + 'static) -> Result<()> {
        if self.receiver.is_some() {
            return Err(CacheError::InvalidState(
                "frame disassembler is already connected".to_string(),
            ));
        }
        self.receiver = Some(Box::new(receiver));
        Ok(())
    }

    pub fn phase(&self) -> DisassemblerPhase {
        match &self.state {
            State::AwaitingStart => DisassemblerPhase::AwaitingStart,
            State::InFrame(partial) => partial.phase(),
            State::Failed(_) => DisassemblerPhase::Failed,
        }
    }

    /// Process the next message. A completed frame is handed to the
    /// receiver before this returns.
    pub fn on_message(&mut self, message: FrameMessage) -> Result<()> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(CacheError::InvalidState(
                "frame disassembler is not connected".to_string(),
            ));
        };

        let was_failed = matches!(self.state, State::Failed(_));
        let state = std::mem::replace(&mut self.state, State::AwaitingStart);
        let (next, outcome) = match (state, message) {
            (State::Failed(error), _) => (State::Failed(error.clone()), Err(error)),

            (State::AwaitingStart, FrameMessage::Start(start)) => {
                let partial = Partial {
                    // Counts come off the wire.
                    puts: Vec::with_capacity(start.num_puts.min(PREALLOCATE_LIMIT)),
                    removes: Vec::with_capacity(start.num_removes.min(PREALLOCATE_LIMIT)),
                    start,
                };
                (State::InFrame(partial), Ok(()))
            }

            (State::InFrame(mut partial), FrameMessage::Put(object))
                if partial.phase() == DisassemblerPhase::CollectingPuts =>
            {
                partial.puts.push(object);
                (State::InFrame(partial), Ok(()))
            }

            (State::InFrame(mut partial), FrameMessage::Remove(remove))
                if partial.phase() == DisassemblerPhase::CollectingRemoves =>
            {
                partial.removes.push(remove);
                (State::InFrame(partial), Ok(()))
            }

            (State::InFrame(partial), FrameMessage::End(end))
                if partial.phase() == DisassemblerPhase::AwaitingEnd =>
            {
                if end.id != partial.start.id {
                    let error = CacheError::ProtocolViolation(format!(
                        "end id {} does not match start id {}",
                        end.id, partial.start.id
                    ));
                    (State::Failed(error.clone()), Err(error))
                } else {
                    match ChangeSet::new(
                        partial.start.id,
                        partial.puts,
                        partial.removes,
                        partial.start.is_image,
                    ) {
                        Ok(change_set) => {
                            debug!(
                                change_set_id = change_set.id(),
                                puts = change_set.puts().len(),
                                removes = change_set.removes().len(),
                                "Frame disassembled"
                            );
                            receiver.on_change_set(change_set);
                            (State::AwaitingStart, Ok(()))
                        }
                        Err(error) => {
                            let error = CacheError::ProtocolViolation(error.to_string());
                            (State::Failed(error.clone()), Err(error))
                        }
                    }
                }
            }

            (state, message) => {
                let phase = match &state {
                    State::AwaitingStart => DisassemblerPhase::AwaitingStart,
                    State::InFrame(partial) => partial.phase(),
                    State::Failed(_) => DisassemblerPhase::Failed,
                };
                let error = CacheError::ProtocolViolation(format!(
                    "unexpected {} message while {}",
                    message.kind(),
                    phase
                ));
                (State::Failed(error.clone()), Err(error))
            }
        };

        if !was_failed {
            if let State::Failed(error) = &next {
                warn!(error = %error, "Frame disassembler failed");
                receiver.on_protocol_error(error);
            }
        }
        self.state = next;
        outcome
    }

    /// Process messages in order, stopping at the first error.
    pub fn feed_all<I>(&mut self, messages: I) -> Result<()>
    where
        I: IntoIterator<Item = FrameMessage>,
    {
        messages
            .into_iter()
            .try_for_each(|message| self.on_message(message))
    }
}

impl Default for FrameDisassembler {
    fn default() -> Self {
        Self::new()
    }
}
