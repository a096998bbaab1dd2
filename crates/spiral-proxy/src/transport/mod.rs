//! Turning TCP byte streams into whole protocol frames.

pub mod packet_buffer;
pub mod stream;

pub use packet_buffer::PacketBuffer;
pub use stream::{FrameStream, IDLE_TIMEOUT};
