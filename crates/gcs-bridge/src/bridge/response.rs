//! Response side of the bridge.
//!
//! Handlers answer through a [`ResponseWriter`] bound to the response header of
//! their request. The writer is consumed by the first write, so a handler
//! cannot answer twice. Responses and notifications are funnelled through one
//! bounded channel whose only consumer owns the write half of the connection.

use async_trait::async_trait;
use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;

use super::codec::{BridgeCodec, CodecError, OutboundFrame};
use super::messages::{E_FAIL, MessageResponseBase, ResponseBody};
use super::protocol::{MessageHeader, NIL_ACTIVITY_ID};
use crate::error::BridgeError;

/// A message queued for the writer task.
#[derive(Debug, Clone)]
pub struct BridgeResponse {
    pub header: MessageHeader,
    pub body: ResponseBody,
}

#[async_trait]
pub trait ResponseWriter: Send + Sized + 'static {
    fn header(&self) -> &MessageHeader;

    async fn write(self, body: ResponseBody);

    async fn error(self, activity_id: String, error: BridgeError) {
        tracing::warn!(
            message_type = %self.header().message_type,
            id = self.header().id,
            %activity_id,
            error = %error,
            "Request failed"
        );
        let body = ResponseBody::Error(MessageResponseBase::error(activity_id, error.to_string()));
        self.write(body).await;
    }
}

/// Writer that queues onto the bridge's response channel.
pub struct ChannelResponseWriter {
    header: MessageHeader,
    responses: mpsc::Sender<BridgeResponse>,
}

impl ChannelResponseWriter {
    pub fn new(header: MessageHeader, responses: mpsc::Sender<BridgeResponse>) -> Self {
        Self { header, responses }
    }
}

#[async_trait]
impl ResponseWriter for ChannelResponseWriter {
    fn header(&self) -> &MessageHeader {
        &self.header
    }

    async fn write(self, body: ResponseBody) {
        let response = BridgeResponse {
            header: self.header,
            body,
        };
        if self.responses.send(response).await.is_err() {
            tracing::warn!(id = self.header.id, "Response channel closed, dropping response");
        }
    }
}

/// Message reported when a response does not fit in one frame.
pub const OVERSIZED_RESPONSE: &str = "response exceeds maximum message size";

/// Drain `rx` onto `sink` until the channel closes or the connection fails.
///
/// A response that cannot be framed is replaced by the first error body that
/// fits, so every request still gets an answer. Notifications that cannot be
/// framed are dropped. Only I/O failures end the task.
pub async fn write_responses<W>(
    mut rx: mpsc::Receiver<BridgeResponse>,
    mut sink: FramedWrite<W, BridgeCodec>,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    'responses: while let Some(response) = rx.recv().await {
        let header = response.header;
        let error = match send_body(&mut sink, header, &response.body).await {
            Ok(()) => continue,
            Err(CodecError::Io(e)) => return Err(connection_failed(e)),
            Err(e) => e,
        };

        if header.message_type.is_notification() {
            tracing::error!(error = %error, "Dropping notification");
            continue;
        }
        tracing::warn!(id = header.id, error = %error, "Replacing unframeable response");

        for fallback in oversized_fallbacks(response.body.activity_id()) {
            match send_body(&mut sink, header, &ResponseBody::Error(fallback)).await {
                Ok(()) => continue 'responses,
                Err(CodecError::Io(e)) => return Err(connection_failed(e)),
                Err(_) => {}
            }
        }
        tracing::error!(id = header.id, "No error response fits, dropping response");
    }
    tracing::debug!("Response channel closed");
    Ok(())
}

async fn send_body<W>(
    sink: &mut FramedWrite<W, BridgeCodec>,
    header: MessageHeader,
    body: &ResponseBody,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    sink.send(OutboundFrame::json(header, body)?).await
}

fn connection_failed(e: std::io::Error) -> CodecError {
    tracing::error!(error = %e, "Failed writing to bridge connection");
    CodecError::Io(e)
}

/// Error bodies to try in place of an oversized response, largest first.
fn oversized_fallbacks(activity_id: &str) -> [MessageResponseBase; 3] {
    let bare = |activity_id: &str| MessageResponseBase {
        result: E_FAIL,
        activity_id: activity_id.to_string(),
        error_records: Vec::new(),
    };
    [
        MessageResponseBase::error(activity_id, OVERSIZED_RESPONSE),
        bare(activity_id),
        bare(NIL_ACTIVITY_ID),
    ]
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::bridge::request::Request;

    /// Writer that records every body written through any of its clones.
    #[derive(Clone)]
    pub struct RecordingWriter {
        header: MessageHeader,
        written: Arc<Mutex<Vec<ResponseBody>>>,
    }

    impl RecordingWriter {
        pub fn for_request(request: &Request) -> Self {
            Self {
                header: MessageHeader::response_to(&request.header).unwrap(),
                written: Arc::default(),
            }
        }

        pub fn responses(&self) -> Vec<ResponseBody> {
            self.written.lock().unwrap().clone()
        }

        /// The only response written. Panics unless exactly one was written.
        pub fn single(&self) -> ResponseBody {
            let written = self.responses();
            assert_eq!(written.len(), 1, "response written {} times", written.len());
            written.into_iter().next().unwrap()
        }
    }

    #[async_trait]
    impl ResponseWriter for RecordingWriter {
        fn header(&self) -> &MessageHeader {
            &self.header
        }

        async fn write(self, body: ResponseBody) {
            self.written.lock().unwrap().push(body);
        }
    }
}
