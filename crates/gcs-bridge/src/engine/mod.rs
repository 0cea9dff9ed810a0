//! Container engine capability consumed by the bridge.
//!
//! The bridge only translates messages; everything that actually touches
//! containers and processes goes through an [`Engine`]. Errors are opaque to
//! the bridge and forwarded to the host as the error record message.

use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;
use nix::sys::signal::Signal;

use crate::bridge::messages::{
    ProcessDetails, ProcessParameters, ResourceModification, SignalProcessOptions,
    VmHostedContainerSettings,
};
use crate::bridge::transport::Connection;

#[cfg(test)]
pub mod mock;

/// Resolves to the exit code of a container's init process.
pub type ExitWatch = BoxFuture<'static, i32>;

/// Relay connections for a process's standard streams.
///
/// A stream is `None` when the process did not ask for that pipe.
#[derive(Default)]
pub struct StdioConnections {
    pub stdin: Option<Box<dyn Connection>>,
    pub stdout: Option<Box<dyn Connection>>,
    pub stderr: Option<Box<dyn Connection>>,
}

impl StdioConnections {
    pub fn is_empty(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }
}

impl fmt::Debug for StdioConnections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioConnections")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn create_container(
        &self,
        id: &str,
        settings: VmHostedContainerSettings,
    ) -> anyhow::Result<()>;

    /// Start a process inside container `id`, returning its pid.
    async fn execute_process(
        &self,
        id: &str,
        params: ProcessParameters,
        stdio: StdioConnections,
    ) -> anyhow::Result<u32>;

    async fn signal_container(&self, id: &str, signal: Signal) -> anyhow::Result<()>;

    async fn signal_process(&self, pid: u32, options: SignalProcessOptions)
    -> anyhow::Result<()>;

    /// Block until `pid` exits and return its exit code.
    async fn wait_process(&self, pid: u32) -> anyhow::Result<i32>;

    async fn resize_console(&self, pid: u32, width: u16, height: u16) -> anyhow::Result<()>;

    async fn modify_settings(&self, id: &str, request: ResourceModification)
    -> anyhow::Result<()>;

    async fn list_processes(&self, id: &str) -> anyhow::Result<Vec<ProcessDetails>>;

    /// Start a process in the utility VM outside any container.
    async fn run_external_process(
        &self,
        params: ProcessParameters,
        stdio: StdioConnections,
    ) -> anyhow::Result<u32>;

    /// Register interest in the exit of container `id`.
    ///
    /// Registration happens before this returns; the watch resolves once.
    async fn wait_container(&self, id: &str) -> anyhow::Result<ExitWatch>;
}
