//! Errors surfaced to the host through error responses.

use crate::bridge::codec::CodecError;
use crate::bridge::protocol::MessageIdentifier;
use crate::bridge::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to unmarshal JSON for {what}: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed creating stdio connection on port {port}: {source}")]
    Dial {
        port: u32,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Engine(#[from] anyhow::Error),

    #[error("no handler registered for {0}")]
    NotSupported(MessageIdentifier),

    #[error("failed reading from bridge connection: {0}")]
    Receive(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BridgeError {
    pub fn parse(what: &'static str, source: serde_json::Error) -> Self {
        Self::Parse { what, source }
    }
}
