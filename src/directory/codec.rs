//! Envelope codec: frames a TCP byte stream into protocol envelopes.
//!
//! Splits on `\r\n`, parses each frame as a JSON envelope, and serializes
//! outgoing envelopes with `\r\n` termination. Any decode failure is fatal
//! to the connection; the codec never resynchronizes mid-stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Envelope, MessageKind, WireIn};

/// Frame terminator.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Maximum frame length (excluding `\r\n`). Offer lines with a fidelity
/// bond proof attached stay well below this.
pub const MAX_LINE_LENGTH: usize = 40_000;

/// Codec error: malformed frame or an I/O error underneath.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error("frame is not valid UTF-8")]
    NotUtf8,
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown message type {0}")]
    UnknownType(i64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames envelopes on `\r\n` boundaries.
#[derive(Debug, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Parse one frame (terminator already stripped).
    pub fn parse_frame(frame: &[u8]) -> Result<Envelope, CodecError> {
        let text = std::str::from_utf8(frame).map_err(|_| CodecError::NotUtf8)?;
        let wire: WireIn = serde_json::from_str(text)?;
        let kind = MessageKind::from_code(wire.kind).ok_or(CodecError::UnknownType(wire.kind))?;
        Ok(Envelope {
            kind,
            line: wire.line,
        })
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let end = src.windows(2).position(|w| w == TERMINATOR);

        match end {
            Some(pos) if pos > MAX_LINE_LENGTH => Err(CodecError::LineTooLong),
            Some(pos) => {
                let frame = src.split_to(pos);
                src.advance(TERMINATOR.len());
                Self::parse_frame(&frame).map(Some)
            }
            None => {
                // No complete frame yet. Refuse to buffer forever.
                if src.len() > MAX_LINE_LENGTH + 1 {
                    return Err(CodecError::LineTooLong);
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = item.to_json()?;
        dst.reserve(json.len() + TERMINATOR.len());
        dst.put_slice(json.as_bytes());
        dst.put_slice(TERMINATOR);
        Ok(())
    }
}
