//! Decoded inbound message handed to a handler.

use tokio_util::bytes::Bytes;

use super::protocol::{FrameError, HEADER_SIZE, MessageHeader};

/// A validated header plus the undecoded JSON body.
#[derive(Debug, Clone)]
pub struct Request {
    pub header: MessageHeader,
    pub message: Bytes,
}

impl Request {
    /// Parse one complete frame (header and body).
    ///
    /// The declared size must match `frame.len()` exactly.
    pub fn parse(frame: Bytes) -> Result<Self, FrameError> {
        let header = MessageHeader::decode(&frame)?;
        if header.size as usize != frame.len() {
            return Err(FrameError::SizeMismatch {
                declared: header.size as usize,
                available: frame.len(),
            });
        }
        Ok(Self {
            header,
            message: frame.slice(HEADER_SIZE..),
        })
    }
}
