use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Message Types
// ============================================================================

/// Direction of a message relative to the relay.
///
/// Stored as a single-letter code (`O` / `I`) matching the relay's message table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn code(&self) -> &'static str {
        match self {
            Direction::Outgoing => "O",
            Direction::Incoming => "I",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "O" => Some(Direction::Outgoing),
            "I" => Some(Direction::Incoming),
            _ => None,
        }
    }
}

/// Message lifecycle status.
///
/// The dispatcher only ever moves outgoing messages between `Queued` and `Sent`;
/// the remaining statuses are written by other parts of the relay (inbound
/// handling, delivery reports, operators) and are read here only to decide
/// whether a batch can be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Waiting to be sent (code: Q)
    Queued,
    /// Inbound message received (code: R)
    Received,
    /// Inbound message handled by an app (code: H)
    Handled,
    /// Being processed (code: P)
    Processing,
    /// Locked by a worker (code: L)
    Locked,
    /// Accepted by the gateway (code: S)
    Sent,
    /// Delivery confirmed by the gateway (code: D)
    Confirmed,
    /// Cancelled by an operator (code: C)
    Cancelled,
    /// Permanently failed (code: E)
    Errored,
}

impl MessageStatus {
    /// Single-letter code used for storage
    pub fn code(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "Q",
            MessageStatus::Received => "R",
            MessageStatus::Handled => "H",
            MessageStatus::Processing => "P",
            MessageStatus::Locked => "L",
            MessageStatus::Sent => "S",
            MessageStatus::Confirmed => "D",
            MessageStatus::Cancelled => "C",
            MessageStatus::Errored => "E",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "Q" => Some(MessageStatus::Queued),
            "R" => Some(MessageStatus::Received),
            "H" => Some(MessageStatus::Handled),
            "P" => Some(MessageStatus::Processing),
            "L" => Some(MessageStatus::Locked),
            "S" => Some(MessageStatus::Sent),
            "D" => Some(MessageStatus::Confirmed),
            "C" => Some(MessageStatus::Cancelled),
            "E" => Some(MessageStatus::Errored),
            _ => None,
        }
    }

    /// Statuses the dispatcher takes no further action on
    pub const TERMINAL: [MessageStatus; 3] = [
        MessageStatus::Sent,
        MessageStatus::Confirmed,
        MessageStatus::Cancelled,
    ];
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Batch lifecycle status. A batch is closed by marking it `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    Queued,
    Sent,
}

impl BatchStatus {
    pub fn code(&self) -> &'static str {
        match self {
            BatchStatus::Queued => "Q",
            BatchStatus::Sent => "S",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "Q" => Some(BatchStatus::Queued),
            "S" => Some(BatchStatus::Sent),
            _ => None,
        }
    }
}

/// A (backend, recipient) pair. Read-only for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Recipient address, usually an MSISDN
    pub identity: String,
    /// Name of the gateway backend the recipient is reached through
    pub backend: String,
}

impl Connection {
    pub fn new(identity: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            backend: backend.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub direction: Direction,
    pub status: MessageStatus,
    /// Lower sorts first
    pub priority: i32,
    pub text: String,
    pub connection: Connection,
    pub batch_id: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn backend(&self) -> &str {
        &self.connection.backend
    }

    pub fn identity(&self) -> &str {
        &self.connection.identity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub id: i64,
    pub name: Option<String>,
    pub status: BatchStatus,
}

// ============================================================================
// Routing
// ============================================================================

/// Gateway URL template(s) for one store.
///
/// Either a single template used for every backend, or a table keyed by
/// backend name with an optional `default` entry:
///
/// ```toml
/// router_url = "http://kannel:13013/cgi-bin/sendsms?to=%(recipient)s&text=%(text)s"
///
/// [stores.default.router_url]
/// yo = "http://yo/send?dest=%(recipient)s&msg=%(text)s"
/// default = "http://kannel:13013/cgi-bin/sendsms?to=%(recipient)s&text=%(text)s"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouterUrl {
    Template(String),
    PerBackend(BTreeMap<String, String>),
}

impl RouterUrl {
    /// Key of the fallback entry in a per-backend table
    pub const DEFAULT_KEY: &'static str = "default";

    /// Resolve the template for a backend, falling back to `default`.
    pub fn template_for(&self, backend: &str) -> Option<&str> {
        match self {
            RouterUrl::Template(template) => Some(template),
            RouterUrl::PerBackend(routes) => routes
                .get(backend)
                .or_else(|| routes.get(Self::DEFAULT_KEY))
                .map(String::as_str),
        }
    }
}

impl Default for RouterUrl {
    fn default() -> Self {
        RouterUrl::PerBackend(BTreeMap::new())
    }
}
