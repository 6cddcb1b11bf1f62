//! Error types for the dispatcher
//!
//! Routing and delivery failures are absorbed by the chunk sender (the chunk
//! stays queued). Store failures abort the pass for that store, roll back its
//! transaction and surface as [`StorePassError`].

use std::error::Error as _;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("No router url mapping found for backend '{0}'")]
    NoRoute(String),

    #[error("Router url references unknown placeholder '{0}'")]
    UnknownPlaceholder(String),

    #[error("Malformed router url at byte {position}: {reason}")]
    MalformedTemplate {
        position: usize,
        reason: &'static str,
    },
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Gateway request timed out: {0}")]
    Timeout(String),

    #[error("Gateway unreachable: {0}")]
    Unreachable(String),

    #[error("Gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Anything that stops a chunk from reaching the gateway
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Unsupported store url '{0}'")]
    UnsupportedUrl(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A store pass that was rolled back
#[derive(Error, Debug)]
#[error("Dispatch pass for store '{store}' failed")]
pub struct StorePassError {
    pub store: String,
    #[source]
    pub source: StoreError,
}

impl StorePassError {
    pub fn new(store: impl Into<String>, source: StoreError) -> Self {
        Self {
            store: store.into(),
            source,
        }
    }

    /// Full cause chain, one line per level
    pub fn trace(&self) -> String {
        let mut out = self.to_string();
        let mut cause = self.source();
        while let Some(err) = cause {
            out.push_str("\n  caused by: ");
            out.push_str(&err.to_string());
            cause = err.source();
        }
        out
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Invalid mailbox: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Failed to build email: {0}")]
    Email(#[from] lettre::error::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}
