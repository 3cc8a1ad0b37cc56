//! Buffer data structures shared by the transport and the channels.

mod sequence_buffer;

pub use sequence_buffer::SequenceBuffer;
