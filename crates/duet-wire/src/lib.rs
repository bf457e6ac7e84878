pub mod buffer;
pub mod decode;
pub mod events;
pub mod frame;
pub mod stream;

pub use buffer::LineBuffer;
pub use decode::{decode_frame, Decoded};
pub use events::StreamEvent;
pub use frame::{Frame, FrameAssembler};
pub use stream::{decode_byte_stream, decode_sse_response, EventStream, MALFORMED_FRAME_BUDGET};
