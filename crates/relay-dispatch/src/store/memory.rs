//! In-memory message store
//!
//! Used by tests and `memory:` dry runs. A transaction works on a private
//! copy of the state and writes back only the rows it touched on commit, so a
//! rolled back pass leaves nothing behind and concurrent inserts survive.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use relay_common::{BatchStatus, Connection, Direction, Message, MessageBatch, MessageStatus};

use super::{MessageOrder, MessageQuery, MessageStore, StoreTransaction};
use crate::error::StoreError;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    messages: BTreeMap<i64, Message>,
    batches: BTreeMap<i64, MessageBatch>,
    next_message_id: i64,
    next_batch_id: i64,
}

#[derive(Default)]
pub struct MemoryMessageStore {
    state: Arc<Mutex<MemoryState>>,
    fail_updates: Arc<AtomicBool>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch(&self, name: Option<&str>) -> i64 {
        let mut state = self.state.lock();
        state.next_batch_id += 1;
        let id = state.next_batch_id;
        state.batches.insert(
            id,
            MessageBatch {
                id,
                name: name.map(str::to_string),
                status: BatchStatus::Queued,
            },
        );
        id
    }

    /// Insert a message with an assigned id and return the id
    pub fn insert(
        &self,
        direction: Direction,
        status: MessageStatus,
        priority: i32,
        text: &str,
        connection: Connection,
        batch_id: Option<i64>,
    ) -> i64 {
        let mut state = self.state.lock();
        state.next_message_id += 1;
        let id = state.next_message_id;
        state.messages.insert(
            id,
            Message {
                id,
                direction,
                status,
                priority,
                text: text.to_string(),
                connection,
                batch_id,
                updated_at: None,
            },
        );
        id
    }

    /// Shorthand for an outgoing queued message at default priority
    pub fn queue_outgoing(&self, identity: &str, backend: &str, text: &str, batch_id: Option<i64>) -> i64 {
        self.insert(
            Direction::Outgoing,
            MessageStatus::Queued,
            10,
            text,
            Connection::new(identity, backend),
            batch_id,
        )
    }

    pub fn message(&self, id: i64) -> Option<Message> {
        self.state.lock().messages.get(&id).cloned()
    }

    pub fn batch(&self, id: i64) -> Option<MessageBatch> {
        self.state.lock().batches.get(&id).cloned()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.values().cloned().collect()
    }

    pub fn set_status(&self, id: i64, status: MessageStatus) {
        if let Some(message) = self.state.lock().messages.get_mut(&id) {
            message.status = status;
        }
    }

    /// Make every subsequent status update fail
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let working = self.state.lock().clone();
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.state),
            working,
            touched_messages: BTreeSet::new(),
            touched_batches: BTreeSet::new(),
            fail_updates: Arc::clone(&self.fail_updates),
        }))
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct MemoryTransaction {
    shared: Arc<Mutex<MemoryState>>,
    working: MemoryState,
    touched_messages: BTreeSet<i64>,
    touched_batches: BTreeSet<i64>,
    fail_updates: Arc<AtomicBool>,
}

fn dispatch_order(a: &Message, b: &Message) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.status.code().cmp(b.status.code()))
        .then_with(|| a.backend().cmp(b.backend()))
        .then_with(|| a.text.cmp(&b.text))
        .then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn queued_batches(&mut self) -> Result<Vec<MessageBatch>, StoreError> {
        Ok(self
            .working
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Queued)
            .cloned()
            .collect())
    }

    async fn find_messages(&mut self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        let mut found: Vec<Message> = self
            .working
            .messages
            .values()
            .filter(|m| query.matches(m))
            .cloned()
            .collect();

        if query.order == MessageOrder::Dispatch {
            found.sort_by(dispatch_order);
        }
        if let Some(limit) = query.limit {
            found.truncate(limit as usize);
        }
        Ok(found)
    }

    async fn count_messages(&mut self, query: &MessageQuery) -> Result<u64, StoreError> {
        Ok(self
            .working
            .messages
            .values()
            .filter(|m| query.matches(m))
            .count() as u64)
    }

    async fn update_status(&mut self, ids: &[i64], status: MessageStatus) -> Result<u64, StoreError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("status updates disabled".to_string()));
        }

        let now = Utc::now();
        let mut affected = 0;
        for id in ids {
            if let Some(message) = self.working.messages.get_mut(id) {
                message.status = status;
                message.updated_at = Some(now);
                self.touched_messages.insert(*id);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn set_batch_status(&mut self, batch_id: i64, status: BatchStatus) -> Result<(), StoreError> {
        if let Some(batch) = self.working.batches.get_mut(&batch_id) {
            batch.status = status;
            self.touched_batches.insert(batch_id);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = *self;
        let mut shared = this.shared.lock();
        for id in &this.touched_messages {
            if let Some(message) = this.working.messages.remove(id) {
                shared.messages.insert(*id, message);
            }
        }
        for id in &this.touched_batches {
            if let Some(batch) = this.working.batches.remove(id) {
                shared.batches.insert(*id, batch);
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
