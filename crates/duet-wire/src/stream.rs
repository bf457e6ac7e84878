use futures::{Stream, StreamExt};
use reqwest::Response;
use std::pin::Pin;
use tracing::{debug, warn};

use crate::buffer::LineBuffer;
use crate::decode::{decode_frame, Decoded};
use crate::events::StreamEvent;
use crate::frame::FrameAssembler;

/// A finite, non-restartable sequence of decoded events. Failures arrive
/// in-band as a terminal `StreamEvent::Error`; a new stream requires a new
/// request.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Dropped malformed frames tolerated per stream before the stream is
/// declared broken and terminated.
pub const MALFORMED_FRAME_BUDGET: usize = 64;

/// Decode an open HTTP event-stream response. A non-2xx status becomes a
/// single `Error` event before termination.
pub fn decode_sse_response(response: Response) -> EventStream {
    let status = response.status();
    if !status.is_success() {
        return Box::pin(futures::stream::once(async move {
            StreamEvent::Error {
                message: format!("stream request failed with status {}", status),
            }
        }));
    }

    decode_byte_stream(response.bytes_stream())
}

/// Decode an arbitrary chunked byte stream. Generic over the chunk and
/// error types so tests can drive the decoder without a network.
pub fn decode_byte_stream<S, B, E>(stream: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    Box::pin(async_stream::stream! {
        let mut chunks = Box::pin(stream);
        let mut buffer = LineBuffer::with_capacity(4096);
        let mut assembler = FrameAssembler::new();
        let mut malformed = 0usize;

        while let Some(chunk_result) = chunks.next().await {
            let bytes = match chunk_result {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(error = %e, "transport failure mid-stream");
                    yield StreamEvent::Error {
                        message: "connection lost".to_string(),
                    };
                    return;
                }
            };

            buffer.extend(bytes.as_ref());

            while let Some(line_result) = buffer.next_line() {
                let line = match line_result {
                    Ok(line) => line,
                    Err(_) => {
                        // Undecodable bytes spoil at most this line.
                        malformed += 1;
                        if malformed > MALFORMED_FRAME_BUDGET {
                            yield StreamEvent::Error {
                                message: "malformed stream".to_string(),
                            };
                            return;
                        }
                        continue;
                    }
                };

                let Some(frame) = assembler.push_line(&line) else {
                    continue;
                };

                match decode_frame(&frame) {
                    Decoded::Event(event) => {
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                    Decoded::Ignored => {}
                    Decoded::Malformed => {
                        malformed += 1;
                        if malformed > MALFORMED_FRAME_BUDGET {
                            warn!("malformed-frame budget exhausted, aborting stream");
                            yield StreamEvent::Error {
                                message: "malformed stream".to_string(),
                            };
                            return;
                        }
                    }
                }
            }
        }

        // EOF without done/error is an abrupt transport failure.
        yield StreamEvent::Error {
            message: "connection closed before completion".to_string(),
        };
    })
}
