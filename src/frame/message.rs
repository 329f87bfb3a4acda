//! Wire messages and their JSON shapes.

use crate::error::{CacheError, Result};
use crate::types::{CacheObject, RemoveMarker};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opens a frame and declares its size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStart {
    pub id: String,
    #[serde(rename = "isCacheImage")]
    pub is_image: bool,
    pub num_puts: usize,
    pub num_removes: usize,
}

/// Closes the frame opened by the [`FrameStart`] with the same id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameEnd {
    pub id: String,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
enum Marker {
    Start(FrameStart),
    End(FrameEnd),
}

/// One message of a frame.
///
/// A frame is a `Start`, then its puts, then its removes, then an `End`.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameMessage {
    Start(FrameStart),
    Put(CacheObject),
    Remove(RemoveMarker),
    End(FrameEnd),
}

impl FrameMessage {
    /// Short name for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            FrameMessage::Start(_) => "start",
            FrameMessage::Put(_) => "put",
            FrameMessage::Remove(_) => "remove",
            FrameMessage::End(_) => "end",
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        let value = match self {
            FrameMessage::Start(start) => serde_json::to_value(Marker::Start(start.clone()))?,
            FrameMessage::Put(object) => serde_json::to_value(object)?,
            FrameMessage::Remove(remove) => serde_json::to_value(remove)?,
            FrameMessage::End(end) => serde_json::to_value(Marker::End(end.clone()))?,
        };
        Ok(value)
    }

    /// Parse one message. Markers carry a `frame` field, puts a `type`
    /// field; anything else must be a remove.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Some(fields) = value.as_object() else {
            return Err(CacheError::Serialization(format!(
                "frame message must be a JSON object, got {value}"
            )));
        };

        let message = if fields.contains_key("frame") {
            match Marker::deserialize(value)? {
                Marker::Start(start) => FrameMessage::Start(start),
                Marker::End(end) => FrameMessage::End(end),
            }
        } else if fields.contains_key("type") {
            FrameMessage::Put(CacheObject::deserialize(value)?)
        } else {
            FrameMessage::Remove(RemoveMarker::deserialize(value)?)
        };

        let id = match &message {
            FrameMessage::Start(start) => start.id.as_str(),
            FrameMessage::Put(object) => object.id(),
            FrameMessage::Remove(remove) => remove.id(),
            FrameMessage::End(end) => end.id.as_str(),
        };
        if id.is_empty() {
            return Err(CacheError::InvalidArgument(format!(
                "{} message has an empty id",
                message.kind()
            )));
        }
        Ok(message)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_json()?)?)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(&value)
    }
}
