//! Change set to frame.

use super::message::{FrameEnd, FrameMessage, FrameStart};
use crate::types::ChangeSet;

/// Turns change sets into frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameAssembler;

impl FrameAssembler {
    pub fn new() -> Self {
        Self
    }

    /// The frame for `change_set`: start, puts, removes, end.
    pub fn assemble(&self, change_set: &ChangeSet) -> Vec<FrameMessage> {
        let mut messages = Vec::with_capacity(change_set.puts().len() + change_set.removes().len() + 2);
        messages.push(FrameMessage::Start(FrameStart {
            id: change_set.id().to_string(),
            is_image: change_set.is_image(),
            num_puts: change_set.puts().len(),
            num_removes: change_set.removes().len(),
        }));
        messages.extend(change_set.puts().iter().cloned().map(FrameMessage::Put));
        messages.extend(change_set.removes().iter().cloned().map(FrameMessage::Remove));
        messages.push(FrameMessage::End(FrameEnd {
            id: change_set.id().to_string(),
        }));
        messages
    }
}
