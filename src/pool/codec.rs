//! NDJSON codec for worker stdio streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a fixed maximum line
//! length so a misbehaving worker cannot exhaust supervisor memory with
//! an unterminated line. Used for both directions: task records down
//! the worker's stdin, events up from its stdout.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum line length accepted on a worker stream: 4 MiB.
///
/// Chat tasks may carry base64 image attachments, so the cap is wider
/// than a plain-text protocol would need.
pub const MAX_LINE_BYTES: usize = 4 * 1_048_576;

/// NDJSON codec for bidirectional worker streams.
#[derive(Debug)]
pub struct EventCodec(LinesCodec);

impl EventCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EventCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for EventCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Event(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
