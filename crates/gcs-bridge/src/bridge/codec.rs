//! Framed codec for the bridge control connection.
//!
//! Reads the fixed header, then exactly `size - HEADER_SIZE` body bytes. Works
//! over any AsyncRead/AsyncWrite (vsock, in-memory duplex, etc).

use std::io;

use serde::Serialize;
use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{FrameError, HEADER_SIZE, MessageHeader, RawHeader};
use super::request::Request;

/// Fatal codec failure. Framing cannot be recovered after one of these.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error on bridge connection: {0}")]
    Io(#[from] io::Error),

    #[error("declared frame size {size} outside [{min}, {max}]")]
    InvalidSize { size: usize, min: usize, max: usize },

    #[error("failed to encode message body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outgoing message: header plus an already-encoded JSON body.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl OutboundFrame {
    pub fn json<T: Serialize>(header: MessageHeader, body: &T) -> Result<Self, CodecError> {
        Ok(Self {
            header,
            body: Bytes::from(serde_json::to_vec(body)?),
        })
    }
}

/// Codec producing one item per complete frame.
///
/// A frame with an unrecognized type is consumed in full and yielded as
/// `Err(FrameError)` so the caller can log it and keep reading.
pub struct BridgeCodec {
    max_message_size: usize,
}

impl BridgeCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size: max_message_size.max(HEADER_SIZE),
        }
    }
}

impl Decoder for BridgeCodec {
    type Item = Result<Request, FrameError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let raw = match RawHeader::decode(src) {
            Ok(raw) => raw,
            Err(_) => {
                src.reserve(HEADER_SIZE - src.len());
                return Ok(None);
            }
        };
        let size = raw.size as usize;
        if size < HEADER_SIZE || size > self.max_message_size {
            return Err(CodecError::InvalidSize {
                size,
                min: HEADER_SIZE,
                max: self.max_message_size,
            });
        }

        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let frame = src.split_to(size).freeze();
        Ok(Some(Request::parse(frame)))
    }
}

impl Encoder<OutboundFrame> for BridgeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: OutboundFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = HEADER_SIZE + item.body.len();
        if size > self.max_message_size {
            return Err(CodecError::InvalidSize {
                size,
                min: HEADER_SIZE,
                max: self.max_message_size,
            });
        }

        let header = MessageHeader {
            size: size as u32,
            ..item.header
        };
        tracing::trace!(
            message_type = %header.message_type,
            id = header.id,
            size,
            "Encoding frame"
        );

        dst.reserve(size);
        dst.put_slice(&header.encode());
        dst.put_slice(&item.body);
        Ok(())
    }
}
