//! StoreScheduler scenarios against the in-memory store

use std::sync::Arc;
use std::time::Duration;

use relay_common::{BatchStatus, MessageStatus, RouterUrl};
use relay_dispatch::mock::{MockDeliveryClient, RecordingNotifier};
use relay_dispatch::store::MemoryMessageStore;
use relay_dispatch::{
    BatchingEngine, ChunkKey, ChunkOutcome, ChunkPolicy, ChunkSender, DeliveryError, PassOutcome,
    Routing, SchedulerConfig, StoreHandle, StoreScheduler,
};
use tokio_util::sync::CancellationToken;

const TEMPLATE: &str = "http://gw/cgi-bin/sendsms?from=%(backend)s&to=%(recipient)s&text=%(text)s";

fn routing() -> Routing {
    Routing::new(RouterUrl::Template(TEMPLATE.to_string()))
}

fn build(
    stores: Vec<(&str, Arc<MemoryMessageStore>)>,
    client: Arc<MockDeliveryClient>,
    notifier: Arc<RecordingNotifier>,
    key: ChunkKey,
) -> StoreScheduler {
    let handles = stores
        .into_iter()
        .map(|(name, store)| StoreHandle::new(name, store, routing()))
        .collect();
    StoreScheduler::new(
        SchedulerConfig {
            chunk_size: 400,
            poll_interval: Duration::from_millis(10),
        },
        handles,
        BatchingEngine::new(ChunkSender::new(client, ChunkPolicy::default()), key),
        notifier,
    )
}

#[tokio::test]
async fn test_batch_sent_then_closed() {
    let store = Arc::new(MemoryMessageStore::new());
    let batch = store.add_batch(Some("campaign"));
    let ids: Vec<i64> = ["256701000001", "256701000002", "256701000003"]
        .iter()
        .map(|identity| store.queue_outgoing(identity, "kannel", "Vote today", Some(batch)))
        .collect();
    let client = Arc::new(MockDeliveryClient::new(202));
    let scheduler = build(
        vec![("default", store.clone())],
        client.clone(),
        Arc::new(RecordingNotifier::new()),
        ChunkKey::BackendAndText,
    );

    let reports = scheduler.run_pass().await;
    assert_eq!(reports.len(), 1);
    let outcome = reports[0].result.as_ref().unwrap();
    assert_eq!(
        outcome,
        &PassOutcome::BatchChunk {
            batch_id: batch,
            outcomes: vec![ChunkOutcome::Sent { ids: ids.clone() }],
        }
    );
    assert_eq!(client.request_count(), 1);
    assert!(client.requests()[0].contains("to=256701000001%2C256701000002%2C256701000003"));
    for id in &ids {
        assert_eq!(store.message(*id).unwrap().status, MessageStatus::Sent);
    }
    // closure is only checked once no pending chunk remains
    assert_eq!(store.batch(batch).unwrap().status, BatchStatus::Queued);

    let reports = scheduler.run_pass().await;
    assert_eq!(
        reports[0].result.as_ref().unwrap(),
        &PassOutcome::BatchClosed { batch_id: batch }
    );
    assert_eq!(store.batch(batch).unwrap().status, BatchStatus::Sent);
    assert_eq!(client.request_count(), 1);
}

#[tokio::test]
async fn test_failed_delivery_retried_next_pass() {
    let store = Arc::new(MemoryMessageStore::new());
    let id = store.queue_outgoing("256701000001", "kannel", "Hello", None);
    let client = Arc::new(MockDeliveryClient::new(202));
    client.push_response(Ok(500));
    client.push_response(Err(DeliveryError::Unreachable("connection refused".to_string())));
    let scheduler = build(
        vec![("default", store.clone())],
        client.clone(),
        Arc::new(RecordingNotifier::new()),
        ChunkKey::BackendAndText,
    );

    for _ in 0..2 {
        let reports = scheduler.run_pass().await;
        assert!(matches!(
            reports[0].result.as_ref().unwrap(),
            PassOutcome::Individual(ChunkOutcome::Requeued { .. })
        ));
        assert_eq!(store.message(id).unwrap().status, MessageStatus::Queued);
    }

    let reports = scheduler.run_pass().await;
    assert_eq!(reports[0].result.as_ref().unwrap().sent_count(), 1);
    assert_eq!(store.message(id).unwrap().status, MessageStatus::Sent);

    // nothing left to do and nothing regresses
    let reports = scheduler.run_pass().await;
    assert_eq!(reports[0].result.as_ref().unwrap(), &PassOutcome::Idle);
    assert_eq!(store.message(id).unwrap().status, MessageStatus::Sent);
    assert_eq!(client.request_count(), 3);
}

#[tokio::test]
async fn test_distinct_texts_are_sent_separately() {
    let store = Arc::new(MemoryMessageStore::new());
    let batch = store.add_batch(None);
    store.queue_outgoing("256701000001", "kannel", "Hello Ann", Some(batch));
    store.queue_outgoing("256701000002", "kannel", "Hello Bob", Some(batch));
    let client = Arc::new(MockDeliveryClient::new(200));
    let scheduler = build(
        vec![("default", store.clone())],
        client.clone(),
        Arc::new(RecordingNotifier::new()),
        ChunkKey::BackendAndText,
    );

    scheduler.run_pass().await;

    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].ends_with("text=Hello+Ann"));
    assert!(requests[1].ends_with("text=Hello+Bob"));
}

#[tokio::test]
async fn test_backend_only_chunking_uses_first_text() {
    let store = Arc::new(MemoryMessageStore::new());
    let batch = store.add_batch(None);
    store.queue_outgoing("256701000001", "kannel", "Hello Ann", Some(batch));
    store.queue_outgoing("256701000002", "kannel", "Hello Bob", Some(batch));
    let client = Arc::new(MockDeliveryClient::new(200));
    let scheduler = build(
        vec![("default", store.clone())],
        client.clone(),
        Arc::new(RecordingNotifier::new()),
        ChunkKey::Backend,
    );

    scheduler.run_pass().await;

    let requests = client.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].ends_with("text=Hello+Ann"));
}

#[tokio::test]
async fn test_store_failure_is_isolated_and_notified() {
    let broken = Arc::new(MemoryMessageStore::new());
    let broken_id = broken.queue_outgoing("256701000001", "kannel", "Hi", None);
    broken.fail_updates(true);

    let healthy = Arc::new(MemoryMessageStore::new());
    let healthy_id = healthy.queue_outgoing("256701000002", "kannel", "Hi", None);

    let client = Arc::new(MockDeliveryClient::new(202));
    let notifier = Arc::new(RecordingNotifier::new());
    let scheduler = build(
        vec![("a_broken", broken.clone()), ("b_healthy", healthy.clone())],
        client.clone(),
        notifier.clone(),
        ChunkKey::BackendAndText,
    );

    let reports = scheduler.run_pass().await;
    assert_eq!(reports.len(), 2);

    let failure = reports[0].result.as_ref().unwrap_err();
    assert_eq!(failure.store, "a_broken");
    assert_eq!(broken.message(broken_id).unwrap().status, MessageStatus::Queued);

    assert_eq!(reports[1].result.as_ref().unwrap().sent_count(), 1);
    assert_eq!(healthy.message(healthy_id).unwrap().status, MessageStatus::Sent);

    let failures = notifier.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "a_broken");
    assert!(failures[0].1.contains("status updates disabled"));

    // the broken store recovers on a later pass
    broken.fail_updates(false);
    let reports = scheduler.run_pass().await;
    assert_eq!(reports[0].result.as_ref().unwrap().sent_count(), 1);
    assert_eq!(broken.message(broken_id).unwrap().status, MessageStatus::Sent);
}

#[tokio::test]
async fn test_batch_with_only_filtered_recipients_left_stays_open() {
    let store = Arc::new(MemoryMessageStore::new());
    let batch = store.add_batch(None);
    let numeric = store.queue_outgoing("256701000001", "kannel", "Hi", Some(batch));
    let named = store.queue_outgoing("admin", "kannel", "Hi", Some(batch));
    let client = Arc::new(MockDeliveryClient::new(202));
    let scheduler = build(
        vec![("default", store.clone())],
        client.clone(),
        Arc::new(RecordingNotifier::new()),
        ChunkKey::BackendAndText,
    );

    let reports = scheduler.run_pass().await;
    assert_eq!(reports[0].result.as_ref().unwrap().sent_count(), 1);
    assert_eq!(store.message(numeric).unwrap().status, MessageStatus::Sent);

    for _ in 0..2 {
        let reports = scheduler.run_pass().await;
        assert_eq!(
            reports[0].result.as_ref().unwrap(),
            &PassOutcome::BatchChunk {
                batch_id: batch,
                outcomes: vec![ChunkOutcome::Skipped],
            }
        );
    }
    assert_eq!(client.request_count(), 1);
    assert_eq!(store.message(named).unwrap().status, MessageStatus::Queued);
    assert_eq!(store.batch(batch).unwrap().status, BatchStatus::Queued);
}

#[tokio::test]
async fn test_disabled_notifier_is_not_called() {
    let broken = Arc::new(MemoryMessageStore::new());
    broken.queue_outgoing("256701000001", "kannel", "Hi", None);
    broken.fail_updates(true);

    let notifier = Arc::new(RecordingNotifier::disabled());
    let scheduler = build(
        vec![("broken", broken.clone())],
        Arc::new(MockDeliveryClient::new(202)),
        notifier.clone(),
        ChunkKey::BackendAndText,
    );

    let reports = scheduler.run_pass().await;
    assert!(reports[0].result.is_err());
    assert!(notifier.failures().is_empty());
}

#[tokio::test]
async fn test_run_stops_on_cancel() {
    let store = Arc::new(MemoryMessageStore::new());
    for i in 0..3 {
        store.queue_outgoing(&format!("25670100000{}", i), "kannel", "Hi", None);
    }
    let client = Arc::new(MockDeliveryClient::new(200));
    let scheduler = Arc::new(build(
        vec![("default", store.clone())],
        client.clone(),
        Arc::new(RecordingNotifier::new()),
        ChunkKey::BackendAndText,
    ));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while store.messages().iter().any(|m| m.status == MessageStatus::Queued) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("all messages should be sent");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler should stop after cancel")
        .unwrap();

    assert_eq!(client.request_count(), 3);
}
