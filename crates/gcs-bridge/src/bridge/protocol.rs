//! Wire protocol envelope for host-guest bridge communication.
//!
//! Every message is a fixed 12-byte little-endian header followed by a JSON
//! document:
//!
//! ```text
//! +-------------+-------------+-------------+------------------------+
//! | type (u32)  | size (u32)  | id (u32)    | JSON body (size - 12)  |
//! +-------------+-------------+-------------+------------------------+
//! ```
//!
//! `size` counts the header itself. `id` correlates a response with its
//! request; notifications carry id 0.

use serde::{Deserialize, Serialize};

/// Size of the encoded [`MessageHeader`] in bytes.
pub const HEADER_SIZE: usize = 12;

/// Protocol version reported in create responses.
pub const PROTOCOL_VERSION: u32 = 4;

/// Activity id used when none could be recovered from a request.
pub const NIL_ACTIVITY_ID: &str = "00000000-0000-0000-0000-000000000000";

const TYPE_MASK: u32 = 0xF000_0000;
const TYPE_REQUEST: u32 = 0x1000_0000;
const TYPE_RESPONSE: u32 = 0x2000_0000;
const TYPE_NOTIFICATION: u32 = 0x3000_0000;

/// Known message identifiers.
///
/// Layout: `type (4 bits) | category (8 bits) | operation (12 bits) | version (8 bits)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageIdentifier {
    ComputeSystemCreateV1 = 0x1010_0101,
    ComputeSystemStartV1 = 0x1010_0201,
    ComputeSystemShutdownGracefulV1 = 0x1010_0301,
    ComputeSystemShutdownForcedV1 = 0x1010_0401,
    ComputeSystemExecuteProcessV1 = 0x1010_0501,
    ComputeSystemWaitForProcessV1 = 0x1010_0601,
    ComputeSystemSignalProcessV1 = 0x1010_0701,
    ComputeSystemResizeConsoleV1 = 0x1010_0801,
    ComputeSystemGetPropertiesV1 = 0x1010_0901,
    ComputeSystemModifySettingsV1 = 0x1010_0a01,

    ComputeSystemResponseCreateV1 = 0x2010_0101,
    ComputeSystemResponseStartV1 = 0x2010_0201,
    ComputeSystemResponseShutdownGracefulV1 = 0x2010_0301,
    ComputeSystemResponseShutdownForcedV1 = 0x2010_0401,
    ComputeSystemResponseExecuteProcessV1 = 0x2010_0501,
    ComputeSystemResponseWaitForProcessV1 = 0x2010_0601,
    ComputeSystemResponseSignalProcessV1 = 0x2010_0701,
    ComputeSystemResponseResizeConsoleV1 = 0x2010_0801,
    ComputeSystemResponseGetPropertiesV1 = 0x2010_0901,
    ComputeSystemResponseModifySettingsV1 = 0x2010_0a01,

    ComputeSystemNotificationV1 = 0x3010_0101,
}

impl MessageIdentifier {
    const ALL: [MessageIdentifier; 21] = [
        Self::ComputeSystemCreateV1,
        Self::ComputeSystemStartV1,
        Self::ComputeSystemShutdownGracefulV1,
        Self::ComputeSystemShutdownForcedV1,
        Self::ComputeSystemExecuteProcessV1,
        Self::ComputeSystemWaitForProcessV1,
        Self::ComputeSystemSignalProcessV1,
        Self::ComputeSystemResizeConsoleV1,
        Self::ComputeSystemGetPropertiesV1,
        Self::ComputeSystemModifySettingsV1,
        Self::ComputeSystemResponseCreateV1,
        Self::ComputeSystemResponseStartV1,
        Self::ComputeSystemResponseShutdownGracefulV1,
        Self::ComputeSystemResponseShutdownForcedV1,
        Self::ComputeSystemResponseExecuteProcessV1,
        Self::ComputeSystemResponseWaitForProcessV1,
        Self::ComputeSystemResponseSignalProcessV1,
        Self::ComputeSystemResponseResizeConsoleV1,
        Self::ComputeSystemResponseGetPropertiesV1,
        Self::ComputeSystemResponseModifySettingsV1,
        Self::ComputeSystemNotificationV1,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn is_request(self) -> bool {
        self.code() & TYPE_MASK == TYPE_REQUEST
    }

    pub fn is_notification(self) -> bool {
        self.code() & TYPE_MASK == TYPE_NOTIFICATION
    }

    /// Companion response identifier of a request identifier.
    ///
    /// Same operation and version with the response type bits set. Response
    /// and notification identifiers have no companion.
    pub fn response_identifier(self) -> Result<MessageIdentifier, ProtocolError> {
        if !self.is_request() {
            return Err(ProtocolError::NoResponseIdentifier(self));
        }
        let code = (self.code() & !TYPE_MASK) | TYPE_RESPONSE;
        MessageIdentifier::try_from(code).map_err(|_| ProtocolError::NoResponseIdentifier(self))
    }
}

impl TryFrom<u32> for MessageIdentifier {
    type Error = FrameError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|id| id.code() == code)
            .ok_or(FrameError::UnknownMessageType(code))
    }
}

impl std::fmt::Display for MessageIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}(0x{:08x})", self, self.code())
    }
}

/// Fixed-size header preceding every message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageIdentifier,
    /// Total encoded size, header included.
    pub size: u32,
    /// Correlation id.
    pub id: u32,
}

impl MessageHeader {
    /// Header for a response to `request`. Size is filled in by the encoder.
    pub fn response_to(request: &MessageHeader) -> Result<Self, ProtocolError> {
        Ok(Self {
            message_type: request.message_type.response_identifier()?,
            size: HEADER_SIZE as u32,
            id: request.id,
        })
    }

    pub fn notification() -> Self {
        Self {
            message_type: MessageIdentifier::ComputeSystemNotificationV1,
            size: HEADER_SIZE as u32,
            id: 0,
        }
    }

    /// Decode a header from the first [`HEADER_SIZE`] bytes of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let raw = RawHeader::decode(data)?;
        if (raw.size as usize) < HEADER_SIZE {
            return Err(FrameError::SizeTooSmall(raw.size));
        }
        Ok(Self {
            message_type: MessageIdentifier::try_from(raw.type_code)?,
            size: raw.size,
            id: raw.id,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        RawHeader {
            type_code: self.message_type.code(),
            size: self.size,
            id: self.id,
        }
        .encode()
    }

    /// Number of body bytes that follow the header.
    pub fn body_len(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_SIZE)
    }
}

/// Header fields before the type code has been validated.
///
/// The codec needs the declared size of a frame even when its type is unknown
/// so that the frame can be skipped without losing sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawHeader {
    pub type_code: u32,
    pub size: u32,
    pub id: u32,
}

impl RawHeader {
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }
        let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Ok(Self {
            type_code: word(0),
            size: word(4),
            id: word(8),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.type_code.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.id.to_le_bytes());
        buf
    }
}

/// Fields present at the top level of every request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageBase {
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub activity_id: String,
}

impl MessageBase {
    pub fn new(container_id: impl Into<String>, activity_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            activity_id: activity_id.into(),
        }
    }
}

/// Best-effort recovery of the activity id from a body that failed to decode.
///
/// Returns [`NIL_ACTIVITY_ID`] when the body is not a JSON object or carries no
/// usable activity id.
pub fn salvage_activity_id(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct Partial {
        #[serde(rename = "ActivityId")]
        activity_id: Option<String>,
    }

    match serde_json::from_slice::<Partial>(body) {
        Ok(Partial {
            activity_id: Some(id),
        }) if !id.is_empty() => id,
        _ => NIL_ACTIVITY_ID.to_string(),
    }
}

/// Malformed frame. Raised before a request exists, so never answered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("truncated header: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("declared size {0} is smaller than the header")]
    SizeTooSmall(u32),

    #[error("declared size {declared} does not match {available} available bytes")]
    SizeMismatch { declared: usize, available: usize },

    #[error("unknown message type 0x{0:08x}")]
    UnknownMessageType(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message type {0} has no response identifier")]
    NoResponseIdentifier(MessageIdentifier),
}
