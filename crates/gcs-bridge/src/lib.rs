//! gcs-bridge: guest-side control bridge for containers in a utility VM.
//!
//! The host drives container lifecycle over a single framed vsock connection.
//! This crate decodes those requests, hands them to an [`Engine`] and sends
//! the answers (and container exit notifications) back.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod telemetry;

pub use bridge::Bridge;
pub use bridge::VsockTransport;
pub use bridge::response::BridgeResponse;
pub use bridge::transport::{Connection, Transport, TransportError, dial_with_retry};
pub use config::BridgeConfig;
pub use engine::{Engine, ExitWatch, StdioConnections};
pub use error::BridgeError;
pub use telemetry::init_tracing;
