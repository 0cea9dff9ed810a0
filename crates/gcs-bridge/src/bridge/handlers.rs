//! Per-operation request handlers.
//!
//! Every handler decodes its request, makes one engine call and answers
//! exactly once through the writer it is given. A body that fails to decode is
//! answered with the activity id salvaged from it; an embedded document that
//! fails to decode is answered with the request's own activity id.

use nix::sys::signal::Signal;
use serde::de::DeserializeOwned;

use super::Bridge;
use super::messages::{
    ContainerCreate, ContainerCreateResponse, ContainerExecuteProcess,
    ContainerExecuteProcessResponse, ContainerGetProperties, ContainerGetPropertiesResponse,
    ContainerModifySettings, ContainerNotification, ContainerProperties, ContainerResizeConsole,
    ContainerSignalProcess, ContainerWaitForProcess, ContainerWaitForProcessResponse,
    MessageResponseBase, ProcessParameters, PropertyQuery, ResponseBody,
    VmHostedContainerSettings,
};
use super::protocol::{MessageBase, MessageHeader, PROTOCOL_VERSION, salvage_activity_id};
use super::request::Request;
use super::response::{BridgeResponse, ResponseWriter};
use super::transport::Connection;
use crate::engine::{ExitWatch, StdioConnections};
use crate::error::BridgeError;

/// Failure of a handler, with the activity id to report it under.
struct HandlerError {
    activity_id: String,
    error: BridgeError,
}

impl HandlerError {
    fn new(activity_id: &str, error: impl Into<BridgeError>) -> Self {
        Self {
            activity_id: activity_id.to_string(),
            error: error.into(),
        }
    }
}

type HandlerResult<T = ResponseBody> = Result<T, HandlerError>;

/// Decode the request body into `T`.
fn decode<T: DeserializeOwned>(request: &Request, what: &'static str) -> HandlerResult<T> {
    serde_json::from_slice(&request.message).map_err(|e| HandlerError {
        activity_id: salvage_activity_id(&request.message),
        error: BridgeError::parse(what, e),
    })
}

/// Decode a JSON document embedded as a string field of an already decoded body.
fn decode_embedded<T: DeserializeOwned>(
    json: &str,
    what: &'static str,
    activity_id: &str,
) -> HandlerResult<T> {
    serde_json::from_str(json)
        .map_err(|e| HandlerError::new(activity_id, BridgeError::parse(what, e)))
}

async fn respond<W: ResponseWriter>(w: W, result: HandlerResult) {
    match result {
        Ok(body) => w.write(body).await,
        Err(e) => w.error(e.activity_id, e.error).await,
    }
}

fn acknowledge(activity_id: String) -> ResponseBody {
    ResponseBody::Acknowledge(MessageResponseBase::success(activity_id))
}

impl Bridge {
    pub async fn create_container<W: ResponseWriter>(&self, w: W, request: &Request) {
        match self.try_create_container(request).await {
            Ok((body, watch)) => {
                w.write(body).await;
                if let Some((base, exit)) = watch {
                    self.spawn_exit_watcher(base, exit);
                }
            }
            Err(e) => w.error(e.activity_id, e.error).await,
        }
    }

    async fn try_create_container(
        &self,
        request: &Request,
    ) -> HandlerResult<(ResponseBody, Option<(MessageBase, ExitWatch)>)> {
        let create: ContainerCreate = decode(request, "ContainerCreate")?;
        let activity_id = &create.base.activity_id;
        let settings: VmHostedContainerSettings = decode_embedded(
            &create.container_config,
            "VmHostedContainerSettings",
            activity_id,
        )?;

        let id = &create.base.container_id;
        self.engine
            .create_container(id, settings)
            .await
            .map_err(|e| HandlerError::new(activity_id, e))?;
        tracing::info!(container_id = %id, "Container created");

        let watch = match self.engine.wait_container(id).await {
            Ok(exit) => Some((create.base.clone(), exit)),
            Err(e) => {
                tracing::error!(container_id = %id, error = %e, "Failed to register for container exit");
                None
            }
        };

        let body = ResponseBody::Create(ContainerCreateResponse {
            base: MessageResponseBase::success(activity_id.clone()),
            selected_protocol_version: PROTOCOL_VERSION,
        });
        Ok((body, watch))
    }

    /// Publish an unexpected-exit notification once `exit` resolves.
    fn spawn_exit_watcher(&self, base: MessageBase, exit: ExitWatch) {
        let responses = self.responses.clone();
        tokio::spawn(async move {
            let exit_code = exit.await;
            tracing::info!(container_id = %base.container_id, exit_code, "Container exited");
            let notification = BridgeResponse {
                header: MessageHeader::notification(),
                body: ResponseBody::Notification(ContainerNotification::unexpected_exit(
                    base, exit_code,
                )),
            };
            if responses.send(notification).await.is_err() {
                tracing::warn!("Response channel closed, dropping exit notification");
            }
        });
    }

    pub async fn execute_process<W: ResponseWriter>(&self, w: W, request: &Request) {
        respond(w, self.try_execute_process(request).await).await
    }

    async fn try_execute_process(&self, request: &Request) -> HandlerResult {
        let exec: ContainerExecuteProcess = decode(request, "ContainerExecuteProcess")?;
        let activity_id = &exec.base.activity_id;
        let params: ProcessParameters = decode_embedded(
            &exec.settings.process_parameters,
            "ProcessParameters",
            activity_id,
        )?;

        let result = if params.is_external {
            self.engine
                .run_external_process(params, StdioConnections::default())
                .await
        } else {
            let relay = exec.settings.vsock_stdio_relay_settings;
            let mut stdio = StdioConnections::default();
            if params.create_std_in_pipe {
                stdio.stdin = Some(self.dial_relay(relay.std_in, activity_id).await?);
            }
            if params.create_std_out_pipe {
                stdio.stdout = Some(self.dial_relay(relay.std_out, activity_id).await?);
            }
            if params.create_std_err_pipe {
                stdio.stderr = Some(self.dial_relay(relay.std_err, activity_id).await?);
            }
            self.engine
                .execute_process(&exec.base.container_id, params, stdio)
                .await
        };
        let pid = result.map_err(|e| HandlerError::new(activity_id, e))?;

        tracing::info!(container_id = %exec.base.container_id, pid, "Process started");
        Ok(ResponseBody::ExecuteProcess(ContainerExecuteProcessResponse {
            base: MessageResponseBase::success(activity_id.clone()),
            process_id: pid,
        }))
    }

    async fn dial_relay(
        &self,
        port: u32,
        activity_id: &str,
    ) -> HandlerResult<Box<dyn Connection>> {
        tracing::debug!(port, "Dialing stdio relay");
        self.transport
            .dial(port)
            .await
            .map_err(|source| HandlerError::new(activity_id, BridgeError::Dial { port, source }))
    }

    /// Forced shutdown.
    pub async fn kill_container<W: ResponseWriter>(&self, w: W, request: &Request) {
        respond(w, self.try_signal_container(request, Signal::SIGKILL).await).await
    }

    /// Graceful shutdown.
    pub async fn shutdown_container<W: ResponseWriter>(&self, w: W, request: &Request) {
        respond(w, self.try_signal_container(request, Signal::SIGTERM).await).await
    }

    async fn try_signal_container(&self, request: &Request, signal: Signal) -> HandlerResult {
        let base: MessageBase = decode(request, "MessageBase")?;
        self.engine
            .signal_container(&base.container_id, signal)
            .await
            .map_err(|e| HandlerError::new(&base.activity_id, e))?;
        Ok(acknowledge(base.activity_id))
    }

    pub async fn signal_process<W: ResponseWriter>(&self, w: W, request: &Request) {
        respond(w, self.try_signal_process(request).await).await
    }

    async fn try_signal_process(&self, request: &Request) -> HandlerResult {
        let signal: ContainerSignalProcess = decode(request, "ContainerSignalProcess")?;
        self.engine
            .signal_process(signal.process_id, signal.options)
            .await
            .map_err(|e| HandlerError::new(&signal.base.activity_id, e))?;
        Ok(acknowledge(signal.base.activity_id))
    }

    /// Blocks until the process exits. Runs on its own task.
    pub async fn wait_on_process<W: ResponseWriter>(&self, w: W, request: &Request) {
        respond(w, self.try_wait_on_process(request).await).await
    }

    async fn try_wait_on_process(&self, request: &Request) -> HandlerResult {
        let wait: ContainerWaitForProcess = decode(request, "ContainerWaitForProcess")?;
        let exit_code = self
            .engine
            .wait_process(wait.process_id)
            .await
            .map_err(|e| HandlerError::new(&wait.base.activity_id, e))?;
        tracing::debug!(pid = wait.process_id, exit_code, "Process exited");
        Ok(ResponseBody::WaitForProcess(ContainerWaitForProcessResponse {
            base: MessageResponseBase::success(wait.base.activity_id),
            exit_code,
        }))
    }

    pub async fn resize_console<W: ResponseWriter>(&self, w: W, request: &Request) {
        respond(w, self.try_resize_console(request).await).await
    }

    async fn try_resize_console(&self, request: &Request) -> HandlerResult {
        let resize: ContainerResizeConsole = decode(request, "ContainerResizeConsole")?;
        self.engine
            .resize_console(resize.process_id, resize.width, resize.height)
            .await
            .map_err(|e| HandlerError::new(&resize.base.activity_id, e))?;
        Ok(acknowledge(resize.base.activity_id))
    }

    pub async fn modify_settings<W: ResponseWriter>(&self, w: W, request: &Request) {
        respond(w, self.try_modify_settings(request).await).await
    }

    async fn try_modify_settings(&self, request: &Request) -> HandlerResult {
        let modify: ContainerModifySettings = decode(request, "ContainerModifySettings")?;
        self.engine
            .modify_settings(&modify.base.container_id, modify.request)
            .await
            .map_err(|e| HandlerError::new(&modify.base.activity_id, e))?;
        Ok(acknowledge(modify.base.activity_id))
    }

    pub async fn list_processes<W: ResponseWriter>(&self, w: W, request: &Request) {
        respond(w, self.try_list_processes(request).await).await
    }

    async fn try_list_processes(&self, request: &Request) -> HandlerResult {
        let get: ContainerGetProperties = decode(request, "ContainerGetProperties")?;
        let activity_id = &get.base.activity_id;
        let query: PropertyQuery = if get.query.is_empty() {
            PropertyQuery::default()
        } else {
            decode_embedded(&get.query, "PropertyQuery", activity_id)?
        };
        tracing::trace!(?query, "Property query");

        let process_list = self
            .engine
            .list_processes(&get.base.container_id)
            .await
            .map_err(|e| HandlerError::new(activity_id, e))?;
        let properties = serde_json::to_string(&ContainerProperties { process_list })
            .map_err(|e| {
                HandlerError::new(
                    activity_id,
                    anyhow::Error::new(e).context("failed to encode process list"),
                )
            })?;

        Ok(ResponseBody::GetProperties(ContainerGetPropertiesResponse {
            base: MessageResponseBase::success(activity_id.clone()),
            properties,
        }))
    }
}
