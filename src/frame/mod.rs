//! Wire framing for change sets.
//!
//! A change set travels as one frame: a start message declaring the id,
//! image flag and counts, the puts, the removes, then an end message with
//! the same id.
//!
//! ```text
//! {"frame":"start","id":"..","isCacheImage":false,"numPuts":1,"numRemoves":1}
//! {"id":"o-1","type":"order","content":{..}}
//! {"id":"o-2"}
//! {"frame":"end","id":".."}
//! ```
//!
//! [`FrameAssembler`] and [`FrameWriter`] produce frames;
//! [`FrameDisassembler`] checks and rebuilds them.

mod assembler;
mod disassembler;
mod message;
mod writer;

pub use assembler::FrameAssembler;
pub use disassembler::{DisassemblerPhase, FrameDisassembler, FrameReceiver};
pub use message::{FrameEnd, FrameMessage, FrameStart};
pub use writer::{FrameWriter, MessageSink};
