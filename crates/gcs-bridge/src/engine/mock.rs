//! Scriptable engine for handler and dispatcher tests.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::FutureExt;
use nix::sys::signal::Signal;

use super::{Engine, ExitWatch, StdioConnections};
use crate::bridge::messages::{
    ProcessDetails, ProcessParameters, ResourceModification, SignalProcessOptions,
    VmHostedContainerSettings,
};

pub const MOCK_PID: u32 = 101;
pub const MOCK_EXIT_CODE: i32 = -1;
pub const MOCK_ERROR: &str = "mock engine failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Success,
    Error,
    /// The first call succeeds, every later call fails.
    SingleSuccess,
}

/// Arguments of the most recent call to each capability.
#[derive(Debug, Default)]
pub struct Calls {
    pub total: usize,
    pub create_container: Option<(String, VmHostedContainerSettings)>,
    pub execute_process: Option<(String, ProcessParameters, bool)>,
    pub signal_container: Option<(String, Signal)>,
    pub signal_process: Option<(u32, SignalProcessOptions)>,
    pub wait_process: Option<u32>,
    pub resize_console: Option<(u32, u16, u16)>,
    pub modify_settings: Option<(String, ResourceModification)>,
    pub list_processes: Option<String>,
    pub run_external_process: Option<(ProcessParameters, bool)>,
    pub wait_container: Option<String>,
}

pub struct MockEngine {
    behavior: Behavior,
    calls: Mutex<Calls>,
}

impl MockEngine {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Calls::default()),
        }
    }

    /// Run `f` against the recorded calls.
    pub fn calls<R>(&self, f: impl FnOnce(&Calls) -> R) -> R {
        f(&self.calls.lock().unwrap())
    }

    /// Record one call and decide its outcome.
    fn record(&self, f: impl FnOnce(&mut Calls)) -> anyhow::Result<()> {
        let mut calls = self.calls.lock().unwrap();
        calls.total += 1;
        f(&mut calls);
        let ok = match self.behavior {
            Behavior::Success => true,
            Behavior::Error => false,
            Behavior::SingleSuccess => calls.total == 1,
        };
        if ok {
            Ok(())
        } else {
            anyhow::bail!(MOCK_ERROR)
        }
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn create_container(
        &self,
        id: &str,
        settings: VmHostedContainerSettings,
    ) -> anyhow::Result<()> {
        self.record(|c| c.create_container = Some((id.to_string(), settings)))
    }

    async fn execute_process(
        &self,
        id: &str,
        params: ProcessParameters,
        stdio: StdioConnections,
    ) -> anyhow::Result<u32> {
        let empty = stdio.is_empty();
        self.record(|c| c.execute_process = Some((id.to_string(), params, empty)))?;
        Ok(MOCK_PID)
    }

    async fn signal_container(&self, id: &str, signal: Signal) -> anyhow::Result<()> {
        self.record(|c| c.signal_container = Some((id.to_string(), signal)))
    }

    async fn signal_process(
        &self,
        pid: u32,
        options: SignalProcessOptions,
    ) -> anyhow::Result<()> {
        self.record(|c| c.signal_process = Some((pid, options)))
    }

    async fn wait_process(&self, pid: u32) -> anyhow::Result<i32> {
        self.record(|c| c.wait_process = Some(pid))?;
        Ok(MOCK_EXIT_CODE)
    }

    async fn resize_console(&self, pid: u32, width: u16, height: u16) -> anyhow::Result<()> {
        self.record(|c| c.resize_console = Some((pid, width, height)))
    }

    async fn modify_settings(
        &self,
        id: &str,
        request: ResourceModification,
    ) -> anyhow::Result<()> {
        self.record(|c| c.modify_settings = Some((id.to_string(), request)))
    }

    async fn list_processes(&self, id: &str) -> anyhow::Result<Vec<ProcessDetails>> {
        self.record(|c| c.list_processes = Some(id.to_string()))?;
        Ok(vec![ProcessDetails {
            process_id: MOCK_PID,
            command: vec!["/bin/sh".to_string()],
            created_by_runtime: true,
            is_zombie: false,
        }])
    }

    async fn run_external_process(
        &self,
        params: ProcessParameters,
        stdio: StdioConnections,
    ) -> anyhow::Result<u32> {
        let empty = stdio.is_empty();
        self.record(|c| c.run_external_process = Some((params, empty)))?;
        Ok(MOCK_PID)
    }

    async fn wait_container(&self, id: &str) -> anyhow::Result<ExitWatch> {
        self.record(|c| c.wait_container = Some(id.to_string()))?;
        Ok(async { MOCK_EXIT_CODE }.boxed())
    }
}
