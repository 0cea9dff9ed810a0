//! Typed JSON bodies carried inside bridge frames.
//!
//! Field names follow the host's PascalCase wire format. Several requests embed
//! a second JSON document as a string (container configuration, process
//! parameters, property queries); those are decoded separately by the handlers
//! so that a bad embedded document still reports the request's activity id.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::protocol::{MessageBase, NIL_ACTIVITY_ID};

/// `E_FAIL`, reported as the result of every error response.
pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;

const MODULE_NAME: &str = "gcs";

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreate {
    #[serde(flatten)]
    pub base: MessageBase,
    /// JSON-encoded [`VmHostedContainerSettings`].
    pub container_config: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_versions: Option<ProtocolSupport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProtocolSupport {
    pub minimum_version: String,
    pub maximum_version: String,
}

/// Settings for a container hosted in the utility VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VmHostedContainerSettings {
    pub layers: Vec<Layer>,
    /// Path to the scratch (sandbox) disk.
    pub sandbox_data_path: String,
    pub mapped_virtual_disks: Vec<MappedVirtualDisk>,
    pub network_adapters: Vec<NetworkAdapter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Layer {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MappedVirtualDisk {
    pub container_path: String,
    pub lun: u8,
    #[serde(rename = "CreateInUtilityVM")]
    pub create_in_utility_vm: bool,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MappedDirectory {
    /// vsock port the host serves the directory on.
    pub port: u32,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkAdapter {
    pub adapter_instance_id: String,
    pub firewall_enabled: bool,
    pub nat_enabled: bool,
    pub mac_address: String,
    pub allocated_ip_address: String,
    pub host_ip_address: String,
    pub host_ip_prefix_length: u8,
    /// Space-separated list of DNS servers.
    pub host_dns_server_list: String,
    pub host_dns_suffix: String,
    pub enable_low_metric: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerExecuteProcess {
    #[serde(flatten)]
    pub base: MessageBase,
    pub settings: ExecuteProcessSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecuteProcessSettings {
    /// JSON-encoded [`ProcessParameters`].
    pub process_parameters: String,
    #[serde(default)]
    pub vsock_stdio_relay_settings: VsockStdioRelaySettings,
}

/// Host ports to dial for each requested stdio pipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VsockStdioRelaySettings {
    pub std_in: u32,
    pub std_out: u32,
    pub std_err: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProcessParameters {
    pub command_line: String,
    pub working_directory: String,
    pub environment: HashMap<String, String>,
    pub emulate_console: bool,
    pub create_std_in_pipe: bool,
    pub create_std_out_pipe: bool,
    pub create_std_err_pipe: bool,
    /// Run in the utility VM itself rather than inside a container.
    pub is_external: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerWaitForProcess {
    #[serde(flatten)]
    pub base: MessageBase,
    pub process_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSignalProcess {
    #[serde(flatten)]
    pub base: MessageBase,
    pub process_id: u32,
    #[serde(default)]
    pub options: SignalProcessOptions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignalProcessOptions {
    pub signal: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerResizeConsole {
    #[serde(flatten)]
    pub base: MessageBase,
    pub process_id: u32,
    pub height: u16,
    pub width: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerGetProperties {
    #[serde(flatten)]
    pub base: MessageBase,
    /// JSON-encoded [`PropertyQuery`]. Empty means the process list.
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PropertyQuery {
    pub property_types: Vec<PropertyType>,
}

impl Default for PropertyQuery {
    fn default() -> Self {
        Self {
            property_types: vec![PropertyType::ProcessList],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    ProcessList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerModifySettings {
    #[serde(flatten)]
    pub base: MessageBase,
    pub request: ResourceModification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    MappedVirtualDisk,
    MappedDirectory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    #[default]
    Add,
    Remove,
    Update,
}

/// Settings payload whose shape is selected by the resource type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSettings {
    MappedVirtualDisk(MappedVirtualDisk),
    MappedDirectory(MappedDirectory),
}

impl ResourceSettings {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::MappedVirtualDisk(_) => ResourceType::MappedVirtualDisk,
            Self::MappedDirectory(_) => ResourceType::MappedDirectory,
        }
    }
}

/// A resource add/remove/update request against a running container.
///
/// Decoding fails unless `Settings` matches `ResourceType`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawResourceModification", into = "RawResourceModification")]
pub struct ResourceModification {
    pub request_type: RequestType,
    pub settings: ResourceSettings,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawResourceModification {
    resource_type: ResourceType,
    #[serde(default)]
    request_type: RequestType,
    #[serde(default)]
    settings: serde_json::Value,
}

impl TryFrom<RawResourceModification> for ResourceModification {
    type Error = String;

    fn try_from(raw: RawResourceModification) -> Result<Self, Self::Error> {
        let settings = match raw.resource_type {
            ResourceType::MappedVirtualDisk => serde_json::from_value(raw.settings)
                .map(ResourceSettings::MappedVirtualDisk),
            ResourceType::MappedDirectory => {
                serde_json::from_value(raw.settings).map(ResourceSettings::MappedDirectory)
            }
        }
        .map_err(|e| format!("invalid {:?} settings: {}", raw.resource_type, e))?;

        Ok(Self {
            request_type: raw.request_type,
            settings,
        })
    }
}

impl From<ResourceModification> for RawResourceModification {
    fn from(modification: ResourceModification) -> Self {
        let resource_type = modification.settings.resource_type();
        let settings = match modification.settings {
            ResourceSettings::MappedVirtualDisk(disk) => serde_json::to_value(disk),
            ResourceSettings::MappedDirectory(dir) => serde_json::to_value(dir),
        }
        .unwrap_or(serde_json::Value::Null);

        Self {
            resource_type,
            request_type: modification.request_type,
            settings,
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Fields present at the top level of every response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageResponseBase {
    pub result: i32,
    pub activity_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_records: Vec<ErrorRecord>,
}

impl MessageResponseBase {
    pub fn success(activity_id: impl Into<String>) -> Self {
        Self {
            result: 0,
            activity_id: activity_id.into(),
            error_records: Vec::new(),
        }
    }

    /// Error base; an empty activity id becomes the nil sentinel.
    pub fn error(activity_id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut activity_id = activity_id.into();
        if activity_id.is_empty() {
            activity_id = NIL_ACTIVITY_ID.to_string();
        }
        Self {
            result: E_FAIL,
            activity_id,
            error_records: vec![ErrorRecord {
                result: E_FAIL,
                message: message.into(),
                module_name: MODULE_NAME.to_string(),
            }],
        }
    }

    pub fn is_error(&self) -> bool {
        self.result != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorRecord {
    pub result: i32,
    pub message: String,
    pub module_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateResponse {
    #[serde(flatten)]
    pub base: MessageResponseBase,
    pub selected_protocol_version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerExecuteProcessResponse {
    #[serde(flatten)]
    pub base: MessageResponseBase,
    pub process_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerWaitForProcessResponse {
    #[serde(flatten)]
    pub base: MessageResponseBase,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerGetPropertiesResponse {
    #[serde(flatten)]
    pub base: MessageResponseBase,
    /// JSON-encoded [`ContainerProperties`].
    pub properties: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerProperties {
    pub process_list: Vec<ProcessDetails>,
}

/// A process running in a container, as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessDetails {
    pub process_id: u32,
    pub command: Vec<String>,
    pub created_by_runtime: bool,
    pub is_zombie: bool,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationType {
    #[default]
    None,
    GracefulExit,
    ForcedExit,
    UnexpectedExit,
    Reboot,
    Constructed,
    Started,
    Paused,
    Unknown,
}

/// Operation that was in flight when a notification was raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveOperation {
    #[default]
    None,
    Construct,
    Start,
    Pause,
    Resume,
    Shutdown,
    Terminate,
}

/// Unsolicited container event pushed to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerNotification {
    #[serde(flatten)]
    pub base: MessageBase,
    #[serde(rename = "Type")]
    pub notification_type: NotificationType,
    pub operation: ActiveOperation,
    pub result: i32,
    #[serde(default)]
    pub result_info: String,
}

impl ContainerNotification {
    /// Notification for a container whose init process exited on its own.
    pub fn unexpected_exit(base: MessageBase, exit_code: i32) -> Self {
        Self {
            base,
            notification_type: NotificationType::UnexpectedExit,
            operation: ActiveOperation::None,
            result: exit_code,
            result_info: String::new(),
        }
    }
}

/// Body of any message the guest sends to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Create(ContainerCreateResponse),
    ExecuteProcess(ContainerExecuteProcessResponse),
    WaitForProcess(ContainerWaitForProcessResponse),
    GetProperties(ContainerGetPropertiesResponse),
    /// Success with no payload beyond the base.
    Acknowledge(MessageResponseBase),
    Error(MessageResponseBase),
    Notification(ContainerNotification),
}

impl ResponseBody {
    pub fn activity_id(&self) -> &str {
        match self {
            Self::Create(r) => &r.base.activity_id,
            Self::ExecuteProcess(r) => &r.base.activity_id,
            Self::WaitForProcess(r) => &r.base.activity_id,
            Self::GetProperties(r) => &r.base.activity_id,
            Self::Acknowledge(base) | Self::Error(base) => &base.activity_id,
            Self::Notification(n) => &n.base.activity_id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(base) => base.error_records.first().map(|r| r.message.as_str()),
            _ => None,
        }
    }
}
