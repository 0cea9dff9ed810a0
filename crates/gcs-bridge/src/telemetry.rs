//! Tracing setup.
//!
//! `RUST_LOG` wins when set. Otherwise `GCS_LOG` (debug, info, warn, error)
//! picks the level for this crate. `LOG_FORMAT=json` switches to JSON lines.
//! Output always goes to stderr; stdout may carry process I/O.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn level_from(value: Option<&str>) -> &'static str {
    match value {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directive(level: &str) -> String {
    format!("gcs_bridge={level}")
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = level_from(std::env::var("GCS_LOG").ok().as_deref());
        EnvFilter::new(filter_directive(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
