//! Structured logging bootstrap
//!
//! JSON output for production, human-readable text for development. The
//! level filter always comes from `RUST_LOG` (default `info`), e.g.
//! `RUST_LOG=relay_dispatch=debug,sqlx=warn`.
//!
//! ```rust,ignore
//! use relay_common::logging::{init_logging, LogFormat};
//!
//! init_logging("relay-dispatcher", LogFormat::Json)?;
//! tracing::info!(store = %name, count = 3, "SMS chunk sent");
//! ```

use std::str::FromStr;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}', expected 'text' or 'json'", other)),
        }
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed (e.g. called twice).
pub fn init_logging(service_name: &str, format: LogFormat) -> Result<(), TryInitError> {
    let env_filter = default_filter();

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .flatten_event(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?,
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(true),
            )
            .try_init()?,
    }

    tracing::info!(service = service_name, format = ?format, "Logging initialized");
    Ok(())
}
