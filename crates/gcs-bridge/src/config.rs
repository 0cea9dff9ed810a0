//! Bridge configuration.

use std::time::Duration;

/// vsock port the host listens on for the control connection.
pub const DEFAULT_CONTROL_PORT: u32 = 0x4000_0000;
pub const DEFAULT_RESPONSE_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub control_port: u32,
    /// Capacity of the channel between handlers and the writer task.
    pub response_queue_depth: usize,
    /// Largest frame accepted or produced, header included.
    pub max_message_size: usize,
    /// How long queued responses may keep flushing after the host stops sending.
    pub drain_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_CONTROL_PORT,
            response_queue_depth: DEFAULT_RESPONSE_QUEUE_DEPTH,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `GCS_CONTROL_PORT`, `GCS_RESPONSE_QUEUE_DEPTH`,
    /// `GCS_MAX_MESSAGE_SIZE` and `GCS_DRAIN_TIMEOUT_MS`. Unset or unparseable
    /// values keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            control_port: parse_or(&lookup, "GCS_CONTROL_PORT", defaults.control_port),
            response_queue_depth: parse_or(
                &lookup,
                "GCS_RESPONSE_QUEUE_DEPTH",
                defaults.response_queue_depth,
            )
            .max(1),
            max_message_size: parse_or(&lookup, "GCS_MAX_MESSAGE_SIZE", defaults.max_message_size),
            drain_timeout: Duration::from_millis(parse_or(
                &lookup,
                "GCS_DRAIN_TIMEOUT_MS",
                defaults.drain_timeout.as_millis() as u64,
            )),
        }
    }

    pub fn with_control_port(mut self, port: u32) -> Self {
        self.control_port = port;
        self
    }

    pub fn with_response_queue_depth(mut self, depth: usize) -> Self {
        self.response_queue_depth = depth.max(1);
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring unparseable setting");
            default
        }),
        None => default,
    }
}
