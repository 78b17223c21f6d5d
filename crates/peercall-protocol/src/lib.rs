mod codec;
mod envelope;

pub use codec::{encode_line, CodecError, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_BYTES};
pub use envelope::{RemoteError, RequestEnvelope, ResponseEnvelope, SequenceNumber};
