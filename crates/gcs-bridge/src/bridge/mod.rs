//! Host-guest control bridge.
//!
//! The guest dials the host's control port, then reads framed requests and
//! dispatches each one to a handler. Handlers answer through a shared response
//! channel drained by a single writer task, so frames never interleave.
//!
//! # Architecture
//!
//! - **protocol**: header, message identifiers, activity id recovery
//! - **messages**: typed JSON bodies
//! - **codec**: framing over any AsyncRead/AsyncWrite
//! - **handlers**: one handler per operation
//! - **response**: response writer and the writer task
//! - **transport**: host connections (vsock) with the dial retry policy

pub mod codec;
pub mod handlers;
pub mod messages;
pub mod protocol;
pub mod request;
pub mod response;
pub mod transport;
mod vsock;

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::Instrument;

use crate::config::BridgeConfig;
use crate::engine::Engine;
use crate::error::BridgeError;
use codec::BridgeCodec;
use protocol::{MessageHeader, MessageIdentifier, salvage_activity_id};
use request::Request;
use response::{BridgeResponse, ChannelResponseWriter, ResponseWriter};
use transport::Transport;

pub use transport::VsockTransport;

/// Operations the bridge knows how to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    CreateContainer,
    ExecuteProcess,
    KillContainer,
    ShutdownContainer,
    SignalProcess,
    WaitOnProcess,
    ResizeConsole,
    ModifySettings,
    ListProcesses,
}

impl Handler {
    fn route(id: MessageIdentifier) -> Option<Self> {
        use MessageIdentifier::*;
        match id {
            ComputeSystemCreateV1 => Some(Self::CreateContainer),
            ComputeSystemExecuteProcessV1 => Some(Self::ExecuteProcess),
            ComputeSystemShutdownForcedV1 => Some(Self::KillContainer),
            ComputeSystemShutdownGracefulV1 => Some(Self::ShutdownContainer),
            ComputeSystemSignalProcessV1 => Some(Self::SignalProcess),
            ComputeSystemWaitForProcessV1 => Some(Self::WaitOnProcess),
            ComputeSystemResizeConsoleV1 => Some(Self::ResizeConsole),
            ComputeSystemModifySettingsV1 => Some(Self::ModifySettings),
            ComputeSystemGetPropertiesV1 => Some(Self::ListProcesses),
            _ => None,
        }
    }
}

/// Dispatcher state shared by the read loop and the tasks it spawns.
#[derive(Clone)]
pub struct Bridge {
    engine: Arc<dyn Engine>,
    transport: Arc<dyn Transport>,
    responses: mpsc::Sender<BridgeResponse>,
    config: BridgeConfig,
}

impl Bridge {
    /// Create a bridge and the receiving end of its response channel.
    ///
    /// The receiver is handed back to [`Bridge::serve`], which gives it to the
    /// writer task.
    pub fn new(
        engine: Arc<dyn Engine>,
        transport: Arc<dyn Transport>,
        config: BridgeConfig,
    ) -> (Self, mpsc::Receiver<BridgeResponse>) {
        let (responses, rx) = mpsc::channel(config.response_queue_depth.max(1));
        let bridge = Self {
            engine,
            transport,
            responses,
            config,
        };
        (bridge, rx)
    }

    /// Dial the host control port and serve it until it closes.
    pub async fn connect_and_serve(
        self,
        responses: mpsc::Receiver<BridgeResponse>,
    ) -> Result<(), BridgeError> {
        let port = self.config.control_port;
        tracing::info!(port, "Connecting bridge control channel");
        let conn = self.transport.dial(port).await.inspect_err(|e| {
            tracing::error!(port = e.port(), error = %e, "Bridge control channel unavailable");
        })?;
        self.serve(conn, responses).await
    }

    /// Serve requests arriving on `conn`.
    ///
    /// Returns `Ok` when the host stops sending and an error when framing is
    /// lost. End of input only closes the host's direction, so responses
    /// already queued or still owed by spawned handlers are flushed for up to
    /// `drain_timeout`. A framing error aborts the writer at once.
    pub async fn serve<C>(
        self,
        conn: C,
        responses: mpsc::Receiver<BridgeResponse>,
    ) -> Result<(), BridgeError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(conn);
        let max = self.config.max_message_size;

        let writer = FramedWrite::new(write_half, BridgeCodec::new(max));
        let mut writer_task = tokio::spawn(response::write_responses(responses, writer));

        let mut reader = FramedRead::new(read_half, BridgeCodec::new(max));
        tracing::info!("Bridge listening");

        let result = loop {
            match reader.next().await {
                Some(Ok(Ok(request))) => self.dispatch(request).await,
                Some(Ok(Err(e))) => {
                    tracing::warn!(error = %e, "Skipping malformed frame");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Bridge connection failed");
                    break Err(BridgeError::Receive(e));
                }
                None => {
                    tracing::info!("Host stopped sending, draining responses");
                    break Ok(());
                }
            }
        };

        if result.is_err() {
            writer_task.abort();
            return result;
        }

        // The writer finishes once every sender, including those held by
        // spawned handlers, is gone.
        let drain_timeout = self.config.drain_timeout;
        drop(self);
        if tokio::time::timeout(drain_timeout, &mut writer_task)
            .await
            .is_err()
        {
            tracing::warn!(?drain_timeout, "Abandoning undelivered responses");
            writer_task.abort();
        }
        result
    }

    async fn dispatch(&self, request: Request) {
        let header = request.header;
        let span = tracing::info_span!(
            "dispatch",
            message_type = %header.message_type,
            id = header.id
        );

        async move {
            let response_header = match MessageHeader::response_to(&header) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring message");
                    return;
                }
            };
            let w = ChannelResponseWriter::new(response_header, self.responses.clone());

            let Some(handler) = Handler::route(header.message_type) else {
                let activity_id = salvage_activity_id(&request.message);
                w.error(activity_id, BridgeError::NotSupported(header.message_type))
                    .await;
                return;
            };
            tracing::debug!(?handler, "Dispatching request");

            match handler {
                Handler::CreateContainer => self.create_container(w, &request).await,
                Handler::ExecuteProcess => self.execute_process(w, &request).await,
                Handler::KillContainer => self.kill_container(w, &request).await,
                Handler::ShutdownContainer => self.shutdown_container(w, &request).await,
                Handler::SignalProcess => self.signal_process(w, &request).await,
                Handler::WaitOnProcess => {
                    let bridge = self.clone();
                    tokio::spawn(
                        async move { bridge.wait_on_process(w, &request).await }
                            .in_current_span(),
                    );
                }
                Handler::ResizeConsole => self.resize_console(w, &request).await,
                Handler::ModifySettings => self.modify_settings(w, &request).await,
                Handler::ListProcesses => self.list_processes(w, &request).await,
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::bridge::messages::E_FAIL;
    use crate::bridge::protocol::{HEADER_SIZE, NIL_ACTIVITY_ID, RawHeader};
    use crate::bridge::transport::{Connection, TransportError};
    use crate::engine::mock::{Behavior, MOCK_EXIT_CODE, MockEngine};

    #[derive(Default)]
    struct RefusingTransport {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Transport for RefusingTransport {
        async fn dial(&self, port: u32) -> Result<Box<dyn Connection>, TransportError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Connect {
                port,
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            })
        }
    }

    fn start(
        behavior: Behavior,
        config: BridgeConfig,
    ) -> (
        DuplexStream,
        tokio::task::JoinHandle<Result<(), BridgeError>>,
    ) {
        let engine = Arc::new(MockEngine::new(behavior));
        let (bridge, rx) = Bridge::new(engine, Arc::new(RefusingTransport::default()), config);
        let (host, guest) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(bridge.serve(guest, rx));
        (host, server)
    }

    async fn send(host: &mut DuplexStream, type_code: u32, id: u32, body: &[u8]) {
        let header = RawHeader {
            type_code,
            size: (HEADER_SIZE + body.len()) as u32,
            id,
        };
        host.write_all(&header.encode()).await.unwrap();
        host.write_all(body).await.unwrap();
    }

    async fn send_json(host: &mut DuplexStream, id: MessageIdentifier, corr: u32, body: Value) {
        send(host, id.code(), corr, &serde_json::to_vec(&body).unwrap()).await;
    }

    async fn receive(host: &mut DuplexStream) -> (MessageHeader, Value) {
        let mut header = [0u8; HEADER_SIZE];
        host.read_exact(&mut header).await.unwrap();
        let header = MessageHeader::decode(&header).unwrap();
        let mut body = vec![0u8; header.body_len()];
        host.read_exact(&mut body).await.unwrap();
        (header, serde_json::from_slice(&body).unwrap())
    }

    fn base(activity_id: &str) -> Value {
        json!({"ContainerId": "c1", "ActivityId": activity_id})
    }

    #[test]
    fn every_request_except_start_has_a_handler() {
        use MessageIdentifier::*;
        for id in [
            ComputeSystemCreateV1,
            ComputeSystemShutdownGracefulV1,
            ComputeSystemShutdownForcedV1,
            ComputeSystemExecuteProcessV1,
            ComputeSystemWaitForProcessV1,
            ComputeSystemSignalProcessV1,
            ComputeSystemResizeConsoleV1,
            ComputeSystemGetPropertiesV1,
            ComputeSystemModifySettingsV1,
        ] {
            assert!(Handler::route(id).is_some(), "{id} not routed");
        }
        assert_eq!(Handler::route(ComputeSystemStartV1), None);
        assert_eq!(Handler::route(ComputeSystemResponseCreateV1), None);
    }

    #[tokio::test]
    async fn create_answers_then_notifies() {
        let (mut host, server) = start(Behavior::Success, BridgeConfig::default());

        let config = serde_json::to_string(&json!({"Layers": [{"Path": "0"}]})).unwrap();
        let mut body = base("a1");
        body["ContainerConfig"] = Value::String(config);
        send_json(&mut host, MessageIdentifier::ComputeSystemCreateV1, 7, body).await;

        let (header, response) = receive(&mut host).await;
        assert_eq!(
            header.message_type,
            MessageIdentifier::ComputeSystemResponseCreateV1
        );
        assert_eq!(header.id, 7);
        assert_eq!(response["Result"], 0);
        assert_eq!(response["ActivityId"], "a1");

        let (header, notification) = receive(&mut host).await;
        assert_eq!(
            header.message_type,
            MessageIdentifier::ComputeSystemNotificationV1
        );
        assert_eq!(header.id, 0);
        assert_eq!(notification["ContainerId"], "c1");
        assert_eq!(notification["ActivityId"], "a1");
        assert_eq!(notification["Type"], "UnexpectedExit");
        assert_eq!(notification["Operation"], "None");
        assert_eq!(notification["Result"], MOCK_EXIT_CODE);

        drop(host);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_and_response_frames_are_skipped() {
        let (mut host, server) = start(Behavior::Success, BridgeConfig::default());

        send(&mut host, 0x1010_7701, 1, b"{\"ActivityId\":\"x\"}").await;
        send_json(
            &mut host,
            MessageIdentifier::ComputeSystemResponseCreateV1,
            2,
            base("x"),
        )
        .await;
        send_json(
            &mut host,
            MessageIdentifier::ComputeSystemShutdownForcedV1,
            3,
            base("a3"),
        )
        .await;

        let (header, response) = receive(&mut host).await;
        assert_eq!(header.id, 3);
        assert_eq!(
            header.message_type,
            MessageIdentifier::ComputeSystemResponseShutdownForcedV1
        );
        assert_eq!(response["ActivityId"], "a3");

        drop(host);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn start_is_not_supported() {
        let (mut host, server) = start(Behavior::Success, BridgeConfig::default());

        send_json(&mut host, MessageIdentifier::ComputeSystemStartV1, 4, base("a4")).await;
        let (header, response) = receive(&mut host).await;
        assert_eq!(
            header.message_type,
            MessageIdentifier::ComputeSystemResponseStartV1
        );
        assert_eq!(header.id, 4);
        assert_eq!(response["ActivityId"], "a4");
        assert_ne!(response["Result"], 0);

        send(&mut host, MessageIdentifier::ComputeSystemStartV1.code(), 5, b"").await;
        let (_, response) = receive(&mut host).await;
        assert_eq!(response["ActivityId"], NIL_ACTIVITY_ID);

        drop(host);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_errors_keep_the_loop_running() {
        let (mut host, server) = start(Behavior::Error, BridgeConfig::default());

        for corr in 1..=3 {
            send_json(
                &mut host,
                MessageIdentifier::ComputeSystemResizeConsoleV1,
                corr,
                json!({"ContainerId": "c1", "ActivityId": "a", "ProcessId": 1, "Height": 1, "Width": 1}),
            )
            .await;
            let (header, response) = receive(&mut host).await;
            assert_eq!(header.id, corr);
            assert_eq!(response["ErrorRecords"][0]["Message"], "mock engine failure");
        }

        drop(host);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_runs_on_its_own_task() {
        let (mut host, server) = start(Behavior::Success, BridgeConfig::default());

        let mut wait = base("wait");
        wait["ProcessId"] = json!(42);
        send_json(&mut host, MessageIdentifier::ComputeSystemWaitForProcessV1, 1, wait).await;
        send_json(
            &mut host,
            MessageIdentifier::ComputeSystemShutdownGracefulV1,
            2,
            base("shutdown"),
        )
        .await;

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (header, response) = receive(&mut host).await;
            if header.id == 1 {
                assert_eq!(response["ExitCode"], MOCK_EXIT_CODE);
            }
            seen.push(header.id);
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2]);

        drop(host);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn responses_are_flushed_after_the_host_stops_sending() {
        let (mut host, server) = start(Behavior::Success, BridgeConfig::default());

        let mut wait = base("wait");
        wait["ProcessId"] = json!(42);
        send_json(&mut host, MessageIdentifier::ComputeSystemWaitForProcessV1, 1, wait).await;
        send_json(
            &mut host,
            MessageIdentifier::ComputeSystemShutdownForcedV1,
            2,
            base("kill"),
        )
        .await;
        host.shutdown().await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (header, _) = receive(&mut host).await;
            seen.push(header.id);
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2]);

        server.await.unwrap().unwrap();
        let mut rest = Vec::new();
        host.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn oversized_response_still_gets_one_answer() {
        let (mut host, server) = start(
            Behavior::Success,
            BridgeConfig::default().with_max_message_size(120),
        );

        let long_id = "a".repeat(60);
        send_json(&mut host, MessageIdentifier::ComputeSystemStartV1, 1, base(&long_id)).await;
        let (header, response) = receive(&mut host).await;
        assert_eq!(
            header.message_type,
            MessageIdentifier::ComputeSystemResponseStartV1
        );
        assert_eq!(header.id, 1);
        assert_eq!(response["Result"], E_FAIL);
        assert_eq!(response["ActivityId"], long_id.as_str());

        send_json(
            &mut host,
            MessageIdentifier::ComputeSystemShutdownForcedV1,
            2,
            base("a2"),
        )
        .await;
        let (header, response) = receive(&mut host).await;
        assert_eq!(header.id, 2);
        assert_eq!(response["Result"], 0);

        drop(host);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn oversized_frame_ends_the_loop() {
        let (mut host, server) = start(
            Behavior::Success,
            BridgeConfig::default().with_max_message_size(64),
        );

        send(
            &mut host,
            MessageIdentifier::ComputeSystemCreateV1.code(),
            1,
            &[b' '; 100],
        )
        .await;

        let result = server.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Receive(_))));
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let engine = Arc::new(MockEngine::new(Behavior::Success));
        let transport = Arc::new(RefusingTransport::default());
        let (bridge, rx) = Bridge::new(
            engine,
            transport.clone(),
            BridgeConfig::default().with_control_port(1234),
        );

        let err = bridge.connect_and_serve(rx).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Transport(TransportError::Connect { port: 1234, .. })
        ));
        assert_eq!(transport.dials.load(Ordering::SeqCst), 1);
    }
}
