//! Splits an ordered message list into contiguous chunks and hands each one
//! to the [`ChunkSender`].

use relay_common::Message;
use tracing::debug;

use crate::chunk_sender::{ChunkOutcome, ChunkSender};
use crate::error::StoreError;
use crate::store::StoreTransaction;
use crate::url_builder::Routing;

/// What starts a new chunk while walking the list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkKey {
    /// A change of backend
    Backend,
    /// A change of backend or of message text
    #[default]
    BackendAndText,
}

impl ChunkKey {
    fn same_chunk(&self, a: &Message, b: &Message) -> bool {
        match self {
            ChunkKey::Backend => a.backend() == b.backend(),
            ChunkKey::BackendAndText => a.backend() == b.backend() && a.text == b.text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub backend: String,
    pub ids: Vec<i64>,
}

/// Group maximal runs of adjacent messages. Order is preserved and no
/// message appears in more than one chunk; the same backend may show up in
/// several non-adjacent chunks.
pub fn partition(messages: &[Message], key: ChunkKey) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut previous: Option<&Message> = None;

    for message in messages {
        let continues = previous.is_some_and(|prev| key.same_chunk(prev, message));
        match chunks.last_mut() {
            Some(chunk) if continues => chunk.ids.push(message.id),
            _ => chunks.push(Chunk {
                backend: message.backend().to_string(),
                ids: vec![message.id],
            }),
        }
        previous = Some(message);
    }

    chunks
}

pub struct BatchingEngine {
    sender: ChunkSender,
    key: ChunkKey,
}

impl BatchingEngine {
    pub fn new(sender: ChunkSender, key: ChunkKey) -> Self {
        Self { sender, key }
    }

    /// Send every chunk of `messages` in order. A store failure stops at the
    /// failing chunk.
    pub async fn send_all(
        &self,
        tx: &mut dyn StoreTransaction,
        routing: &Routing,
        messages: &[Message],
    ) -> Result<Vec<ChunkOutcome>, StoreError> {
        let chunks = partition(messages, self.key);
        debug!(messages = messages.len(), chunks = chunks.len(), "Partitioned messages");

        let mut outcomes = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let outcome = self
                .sender
                .send_backend_chunk(&mut *tx, routing, &chunk.ids, &chunk.backend)
                .await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
