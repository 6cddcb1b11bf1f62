//! Message store abstraction
//!
//! A store is one database holding the relay tables. Every dispatch pass runs
//! inside a single [`StoreTransaction`]: all status writes of the pass commit
//! together or not at all.

use std::sync::Arc;

use async_trait::async_trait;
use relay_common::{BatchStatus, Direction, Message, MessageBatch, MessageStatus};

use crate::error::StoreError;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod sql;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryMessageStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresMessageStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteMessageStore;

/// Result ordering for [`MessageQuery`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageOrder {
    /// Priority, then status code, then backend name, then id
    #[default]
    Dispatch,
    Id,
}

/// Filter over the messages table. Empty `statuses` matches any status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageQuery {
    pub batch_id: Option<i64>,
    pub ids: Option<Vec<i64>>,
    pub direction: Option<Direction>,
    pub statuses: Vec<MessageStatus>,
    pub order: MessageOrder,
    pub limit: Option<u32>,
}

impl MessageQuery {
    /// Outgoing messages waiting to be sent, in dispatch order
    pub fn pending_outgoing() -> Self {
        Self {
            direction: Some(Direction::Outgoing),
            statuses: vec![MessageStatus::Queued],
            ..Default::default()
        }
    }

    /// Every message of a batch regardless of direction or status
    pub fn batch(batch_id: i64) -> Self {
        Self {
            batch_id: Some(batch_id),
            ..Default::default()
        }
    }

    pub fn with_ids(ids: &[i64]) -> Self {
        Self {
            ids: Some(ids.to_vec()),
            order: MessageOrder::Id,
            ..Default::default()
        }
    }

    pub fn in_batch(mut self, batch_id: i64) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn outgoing(mut self) -> Self {
        self.direction = Some(Direction::Outgoing);
        self
    }

    pub fn with_statuses(mut self, statuses: &[MessageStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// An explicit but empty id list can never match
    pub fn is_empty_selection(&self) -> bool {
        matches!(&self.ids, Some(ids) if ids.is_empty())
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(batch_id) = self.batch_id {
            if message.batch_id != Some(batch_id) {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&message.id) {
                return false;
            }
        }
        if let Some(direction) = self.direction {
            if message.direction != direction {
                return false;
            }
        }
        self.statuses.is_empty() || self.statuses.contains(&message.status)
    }
}

/// One unit of work against a store
#[async_trait]
pub trait StoreTransaction: Send {
    /// Batches still in `Queued` status, lowest id first
    async fn queued_batches(&mut self) -> Result<Vec<MessageBatch>, StoreError>;

    async fn find_messages(&mut self, query: &MessageQuery) -> Result<Vec<Message>, StoreError>;

    /// Count matches, ignoring `order` and `limit`
    async fn count_messages(&mut self, query: &MessageQuery) -> Result<u64, StoreError>;

    /// Set status and refresh `updated_at`; returns affected rows
    async fn update_status(&mut self, ids: &[i64], status: MessageStatus) -> Result<u64, StoreError>;

    async fn set_batch_status(&mut self, batch_id: i64, status: BatchStatus) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Create the relay tables if they do not exist
    async fn init_schema(&self) -> Result<(), StoreError>;
}

/// Open a store from its database URL
pub async fn connect(
    url: &str,
    #[cfg_attr(not(any(feature = "sqlite", feature = "postgres")), allow(unused_variables))]
    max_connections: u32,
) -> Result<Arc<dyn MessageStore>, StoreError> {
    #[cfg(feature = "sqlite")]
    if url.starts_with("sqlite:") {
        let store = SqliteMessageStore::connect(url, max_connections).await?;
        return Ok(Arc::new(store));
    }

    #[cfg(feature = "postgres")]
    if url.starts_with("postgres:") || url.starts_with("postgresql:") {
        let store = PostgresMessageStore::connect(url, max_connections).await?;
        return Ok(Arc::new(store));
    }

    if url == "memory:" {
        return Ok(Arc::new(MemoryMessageStore::new()));
    }

    Err(StoreError::UnsupportedUrl(url.to_string()))
}
