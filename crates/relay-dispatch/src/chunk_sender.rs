//! Delivers one chunk of same-backend messages in a single gateway request
//! and records the result on every message of the chunk.

use std::sync::Arc;

use relay_common::{Message, MessageStatus};
use tracing::{error, info, warn};

use crate::delivery::{is_accepted, DeliveryClient};
use crate::error::{ChunkError, StoreError};
use crate::store::{MessageQuery, StoreTransaction};
use crate::url_builder::Routing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Drop recipients whose identity contains an ASCII letter
    pub exclude_alphabetic_identities: bool,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            exclude_alphabetic_identities: true,
        }
    }
}

impl ChunkPolicy {
    /// Split `messages` into (deliverable, excluded), keeping the input order
    pub fn split(&self, messages: Vec<Message>) -> (Vec<Message>, Vec<Message>) {
        if !self.exclude_alphabetic_identities {
            return (messages, Vec::new());
        }
        messages.into_iter().partition(|m| !has_alphabetic_identity(m))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Gateway answered 2xx; messages marked Sent
    Sent { ids: Vec<i64> },
    /// Messages left Queued for a later pass
    Requeued { ids: Vec<i64>, reason: String },
    /// Nothing deliverable remained after filtering
    Skipped,
}

impl ChunkOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, ChunkOutcome::Sent { .. })
    }
}

fn has_alphabetic_identity(message: &Message) -> bool {
    message.identity().chars().any(|c| c.is_ascii_alphabetic())
}

pub struct ChunkSender {
    client: Arc<dyn DeliveryClient>,
    policy: ChunkPolicy,
}

impl ChunkSender {
    pub fn new(client: Arc<dyn DeliveryClient>, policy: ChunkPolicy) -> Self {
        Self { client, policy }
    }

    /// Send the still-queued messages among `ids` to `backend`.
    ///
    /// Routing and gateway failures leave the messages Queued and are not
    /// errors. Only store failures are returned.
    pub async fn send_backend_chunk(
        &self,
        tx: &mut dyn StoreTransaction,
        routing: &Routing,
        ids: &[i64],
        backend: &str,
    ) -> Result<ChunkOutcome, StoreError> {
        let query = MessageQuery::with_ids(ids)
            .outgoing()
            .with_statuses(&[MessageStatus::Queued]);
        let mut messages = tx.find_messages(&query).await?;
        messages.sort_by_key(|m| ids.iter().position(|id| *id == m.id));

        let (messages, excluded) = self.policy.split(messages);
        if !excluded.is_empty() {
            let excluded_ids: Vec<i64> = excluded.iter().map(|m| m.id).collect();
            warn!(
                backend,
                ids = ?excluded_ids,
                "Skipping messages with non-numeric recipient identities"
            );
            metrics::counter!("relay.messages.filtered_total", "backend" => backend.to_string())
                .increment(excluded_ids.len() as u64);
        }

        let Some(first) = messages.first() else {
            warn!(backend, requested = ids.len(), "No deliverable messages in chunk");
            return Ok(ChunkOutcome::Skipped);
        };

        let text = first.text.clone();
        let recipients = messages
            .iter()
            .map(Message::identity)
            .collect::<Vec<_>>()
            .join(",");
        let chunk_ids: Vec<i64> = messages.iter().map(|m| m.id).collect();

        match self.deliver(routing, backend, &recipients, &text).await {
            Ok(status) if is_accepted(status) => {
                info!(backend, ids = ?chunk_ids, status, "SMS chunk sent");
                tx.update_status(&chunk_ids, MessageStatus::Sent).await?;
                metrics::counter!("relay.messages.sent_total", "backend" => backend.to_string())
                    .increment(chunk_ids.len() as u64);
                Ok(ChunkOutcome::Sent { ids: chunk_ids })
            }
            Ok(status) => {
                warn!(backend, ids = ?chunk_ids, status, "SMS chunk not accepted by gateway");
                tx.update_status(&chunk_ids, MessageStatus::Queued).await?;
                metrics::counter!("relay.messages.requeued_total", "backend" => backend.to_string())
                    .increment(chunk_ids.len() as u64);
                Ok(ChunkOutcome::Requeued {
                    ids: chunk_ids,
                    reason: format!("gateway returned status {}", status),
                })
            }
            Err(e) => {
                error!(backend, ids = ?chunk_ids, error = %e, "SMS chunk delivery failed");
                tx.update_status(&chunk_ids, MessageStatus::Queued).await?;
                metrics::counter!("relay.chunks.failed_total", "backend" => backend.to_string())
                    .increment(1);
                metrics::counter!("relay.messages.requeued_total", "backend" => backend.to_string())
                    .increment(chunk_ids.len() as u64);
                Ok(ChunkOutcome::Requeued {
                    ids: chunk_ids,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn deliver(
        &self,
        routing: &Routing,
        backend: &str,
        recipients: &str,
        text: &str,
    ) -> Result<u16, ChunkError> {
        let url = routing.build_url(backend, recipients, text)?;
        Ok(self.client.deliver(&url).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::mock::MockDeliveryClient;
    use crate::store::{MemoryMessageStore, MessageStore};
    use relay_common::RouterUrl;
    use std::collections::BTreeMap;

    fn routing() -> Routing {
        Routing::new(RouterUrl::Template(
            "http://gw/send?from=%(backend)s&to=%(recipient)s&text=%(text)s".to_string(),
        ))
    }

    fn sender(client: Arc<MockDeliveryClient>) -> ChunkSender {
        ChunkSender::new(client, ChunkPolicy::default())
    }

    #[tokio::test]
    async fn test_accepted_chunk_marks_sent() {
        let store = MemoryMessageStore::new();
        let a = store.queue_outgoing("256701000001", "kannel", "Hello", None);
        let b = store.queue_outgoing("256701000002", "kannel", "Hello", None);
        let client = Arc::new(MockDeliveryClient::new(202));

        let mut tx = store.begin().await.unwrap();
        let outcome = sender(client.clone())
            .send_backend_chunk(tx.as_mut(), &routing(), &[a, b], "kannel")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(outcome, ChunkOutcome::Sent { ids: vec![a, b] });
        assert_eq!(
            client.requests(),
            vec!["http://gw/send?from=kannel&to=256701000001%2C256701000002&text=Hello".to_string()]
        );
        assert_eq!(store.message(a).unwrap().status, MessageStatus::Sent);
        assert_eq!(store.message(b).unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_rejected_chunk_stays_queued() {
        let store = MemoryMessageStore::new();
        let a = store.queue_outgoing("256701000001", "kannel", "Hello", None);
        let client = Arc::new(MockDeliveryClient::new(500));

        let mut tx = store.begin().await.unwrap();
        let outcome = sender(client)
            .send_backend_chunk(tx.as_mut(), &routing(), &[a], "kannel")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(matches!(outcome, ChunkOutcome::Requeued { ref reason, .. } if reason.contains("500")));
        let message = store.message(a).unwrap();
        assert_eq!(message.status, MessageStatus::Queued);
        assert!(message.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_transport_error_stays_queued() {
        let store = MemoryMessageStore::new();
        let a = store.queue_outgoing("256701000001", "kannel", "Hello", None);
        let client = Arc::new(MockDeliveryClient::new(200));
        client.push_response(Err(DeliveryError::Timeout("15s elapsed".to_string())));

        let mut tx = store.begin().await.unwrap();
        let outcome = sender(client)
            .send_backend_chunk(tx.as_mut(), &routing(), &[a], "kannel")
            .await
            .unwrap();

        assert!(!outcome.is_sent());
        assert!(matches!(outcome, ChunkOutcome::Requeued { ref ids, .. } if ids == &vec![a]));
    }

    #[tokio::test]
    async fn test_missing_route_stays_queued_without_request() {
        let store = MemoryMessageStore::new();
        let a = store.queue_outgoing("256701000001", "yo", "Hello", None);
        let client = Arc::new(MockDeliveryClient::new(200));
        let mut routes = BTreeMap::new();
        routes.insert("kannel".to_string(), "http://k/?to=%(recipient)s".to_string());
        let routing = Routing::new(RouterUrl::PerBackend(routes));

        let mut tx = store.begin().await.unwrap();
        let outcome = sender(client.clone())
            .send_backend_chunk(tx.as_mut(), &routing, &[a], "yo")
            .await
            .unwrap();

        assert!(matches!(outcome, ChunkOutcome::Requeued { ref reason, .. } if reason.contains("'yo'")));
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_alphabetic_identities_are_excluded() {
        let store = MemoryMessageStore::new();
        let numeric = store.queue_outgoing("256701000001", "kannel", "Hi", None);
        let named = store.queue_outgoing("shortcode", "kannel", "Hi", None);
        let client = Arc::new(MockDeliveryClient::new(200));

        let mut tx = store.begin().await.unwrap();
        let outcome = sender(client.clone())
            .send_backend_chunk(tx.as_mut(), &routing(), &[numeric, named], "kannel")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(outcome, ChunkOutcome::Sent { ids: vec![numeric] });
        assert!(!client.requests()[0].contains("shortcode"));
        let skipped = store.message(named).unwrap();
        assert_eq!(skipped.status, MessageStatus::Queued);
        assert!(skipped.updated_at.is_none());
    }

    #[tokio::test]
    async fn test_only_alphabetic_identities_skips_request() {
        let store = MemoryMessageStore::new();
        let named = store.queue_outgoing("admin", "kannel", "Hi", None);
        let client = Arc::new(MockDeliveryClient::new(200));

        let mut tx = store.begin().await.unwrap();
        let outcome = sender(client.clone())
            .send_backend_chunk(tx.as_mut(), &routing(), &[named], "kannel")
            .await
            .unwrap();

        assert_eq!(outcome, ChunkOutcome::Skipped);
        assert_eq!(client.request_count(), 0);
    }

    #[test]
    fn test_policy_split_keeps_order() {
        let store = MemoryMessageStore::new();
        for identity in ["256701000001", "admin", "256701000002", "x1"] {
            store.queue_outgoing(identity, "kannel", "Hi", None);
        }
        let identities = |list: &[Message]| list.iter().map(|m| m.identity().to_string()).collect::<Vec<_>>();

        let (kept, excluded) = ChunkPolicy::default().split(store.messages());
        assert_eq!(identities(&kept), vec!["256701000001", "256701000002"]);
        assert_eq!(identities(&excluded), vec!["admin", "x1"]);

        let permissive = ChunkPolicy {
            exclude_alphabetic_identities: false,
        };
        let (kept, excluded) = permissive.split(store.messages());
        assert_eq!(kept.len(), 4);
        assert!(excluded.is_empty());
    }

    #[tokio::test]
    async fn test_filter_can_be_disabled() {
        let store = MemoryMessageStore::new();
        let named = store.queue_outgoing("admin", "kannel", "Hi", None);
        let client = Arc::new(MockDeliveryClient::new(200));
        let sender = ChunkSender::new(
            client.clone(),
            ChunkPolicy {
                exclude_alphabetic_identities: false,
            },
        );

        let mut tx = store.begin().await.unwrap();
        let outcome = sender
            .send_backend_chunk(tx.as_mut(), &routing(), &[named], "kannel")
            .await
            .unwrap();

        assert!(outcome.is_sent());
        assert!(client.requests()[0].contains("to=admin"));
    }

    #[tokio::test]
    async fn test_already_sent_messages_are_not_touched() {
        let store = MemoryMessageStore::new();
        let a = store.queue_outgoing("256701000001", "kannel", "Hi", None);
        store.set_status(a, MessageStatus::Sent);
        let client = Arc::new(MockDeliveryClient::new(500));

        let mut tx = store.begin().await.unwrap();
        let outcome = sender(client)
            .send_backend_chunk(tx.as_mut(), &routing(), &[a], "kannel")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(outcome, ChunkOutcome::Skipped);
        assert_eq!(store.message(a).unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = MemoryMessageStore::new();
        let a = store.queue_outgoing("256701000001", "kannel", "Hi", None);
        store.fail_updates(true);
        let client = Arc::new(MockDeliveryClient::new(200));

        let mut tx = store.begin().await.unwrap();
        let result = sender(client)
            .send_backend_chunk(tx.as_mut(), &routing(), &[a], "kannel")
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
