//! Store scheduler
//!
//! Each pass visits every store in order. Per store, exactly one unit of work
//! is chosen:
//!
//! ```text
//! BatchesPending ──no batch──────────────────────────▶ NoBatchWork ─▶ IndividualFallback
//!       │ first queued batch
//!       ├── has queued outgoing ─▶ BatchChunkReady     (send up to chunk_size)
//!       ├── all members terminal ─▶ BatchAwaitingClose (mark batch Sent)
//!       └── otherwise ───────────────────────────────────────────────▶ IndividualFallback
//! ```
//!
//! The whole pass for a store runs in one transaction. A store error rolls it
//! back, notifies operators and moves on to the next store.

use std::sync::Arc;
use std::time::Duration;

use relay_common::{BatchStatus, Message, MessageStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batching::BatchingEngine;
use crate::chunk_sender::ChunkOutcome;
use crate::error::{StoreError, StorePassError};
use crate::notifier::Notifier;
use crate::store::{MessageQuery, MessageStore, StoreTransaction};
use crate::url_builder::Routing;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum batch messages sent per pass
    pub chunk_size: u32,
    /// Sleep between passes
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 400,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// A named store and the routing used for its messages
#[derive(Clone)]
pub struct StoreHandle {
    pub name: String,
    pub store: Arc<dyn MessageStore>,
    pub routing: Routing,
}

impl StoreHandle {
    pub fn new(name: impl Into<String>, store: Arc<dyn MessageStore>, routing: Routing) -> Self {
        Self {
            name: name.into(),
            store,
            routing,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreState {
    BatchesPending,
    BatchChunkReady { batch_id: i64, messages: Vec<Message> },
    BatchAwaitingClose { batch_id: i64 },
    NoBatchWork,
    IndividualFallback,
}

/// What a store pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    BatchChunk {
        batch_id: i64,
        outcomes: Vec<ChunkOutcome>,
    },
    BatchClosed {
        batch_id: i64,
    },
    Individual(ChunkOutcome),
    /// No queued outgoing message anywhere in the store
    Idle,
}

impl PassOutcome {
    /// Messages marked Sent during the pass
    pub fn sent_count(&self) -> usize {
        let count = |outcome: &ChunkOutcome| match outcome {
            ChunkOutcome::Sent { ids } => ids.len(),
            _ => 0,
        };
        match self {
            PassOutcome::BatchChunk { outcomes, .. } => outcomes.iter().map(count).sum(),
            PassOutcome::Individual(outcome) => count(outcome),
            _ => 0,
        }
    }
}

#[derive(Debug)]
pub struct StorePassReport {
    pub store: String,
    pub result: Result<PassOutcome, StorePassError>,
}

pub struct StoreScheduler {
    config: SchedulerConfig,
    stores: Vec<StoreHandle>,
    engine: BatchingEngine,
    notifier: Arc<dyn Notifier>,
}

impl StoreScheduler {
    pub fn new(
        config: SchedulerConfig,
        stores: Vec<StoreHandle>,
        engine: BatchingEngine,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            stores,
            engine,
            notifier,
        }
    }

    /// Pass after pass until `cancel` fires. A pass in progress is finished
    /// before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            stores = self.stores.len(),
            chunk_size = self.config.chunk_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Dispatcher started"
        );

        while !cancel.is_cancelled() {
            self.run_pass().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Dispatcher stopped");
    }

    /// Service every store once, in order
    pub async fn run_pass(&self) -> Vec<StorePassReport> {
        let mut reports = Vec::with_capacity(self.stores.len());
        for handle in &self.stores {
            let result = self.service_store(handle).await;
            reports.push(StorePassReport {
                store: handle.name.clone(),
                result,
            });
        }
        reports
    }

    pub async fn service_store(&self, handle: &StoreHandle) -> Result<PassOutcome, StorePassError> {
        debug!(store = %handle.name, "Servicing store");

        let result = match handle.store.begin().await {
            Ok(mut tx) => match self.drive(handle, tx.as_mut()).await {
                Ok(outcome) => tx.commit().await.map(|_| outcome),
                Err(e) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(store = %handle.name, error = %rollback_err, "Rollback failed");
                    }
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => {
                debug!(store = %handle.name, outcome = ?outcome, "Store pass committed");
                Ok(outcome)
            }
            Err(source) => {
                let err = StorePassError::new(handle.name.clone(), source);
                error!(store = %handle.name, error = %err.trace(), "Store pass failed, rolled back");
                metrics::counter!("relay.store_passes.failed_total", "store" => handle.name.clone())
                    .increment(1);
                if self.notifier.is_enabled() {
                    self.notifier.notify_store_failure(&err).await;
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        handle: &StoreHandle,
        tx: &mut dyn StoreTransaction,
    ) -> Result<PassOutcome, StoreError> {
        let mut state = StoreState::BatchesPending;

        loop {
            state = match state {
                StoreState::BatchesPending => self.inspect_batches(handle, &mut *tx).await?,

                StoreState::BatchChunkReady { batch_id, messages } => {
                    info!(store = %handle.name, batch_id, count = messages.len(), "Sending batch messages");
                    let outcomes = self
                        .engine
                        .send_all(&mut *tx, &handle.routing, &messages)
                        .await?;
                    return Ok(PassOutcome::BatchChunk { batch_id, outcomes });
                }

                StoreState::BatchAwaitingClose { batch_id } => {
                    tx.set_batch_status(batch_id, BatchStatus::Sent).await?;
                    info!(store = %handle.name, batch_id, "Batch closed");
                    metrics::counter!("relay.batches.closed_total", "store" => handle.name.clone())
                        .increment(1);
                    return Ok(PassOutcome::BatchClosed { batch_id });
                }

                StoreState::NoBatchWork => StoreState::IndividualFallback,

                StoreState::IndividualFallback => {
                    let next = tx
                        .find_messages(&MessageQuery::pending_outgoing().limit(1))
                        .await?;
                    if next.is_empty() {
                        return Ok(PassOutcome::Idle);
                    }

                    let outcome = self
                        .engine
                        .send_all(&mut *tx, &handle.routing, &next)
                        .await?
                        .into_iter()
                        .next();
                    return Ok(outcome.map_or(PassOutcome::Idle, PassOutcome::Individual));
                }
            };
        }
    }

    async fn inspect_batches(
        &self,
        handle: &StoreHandle,
        tx: &mut dyn StoreTransaction,
    ) -> Result<StoreState, StoreError> {
        let batches = tx.queued_batches().await?;
        let Some(batch) = batches.first() else {
            return Ok(StoreState::NoBatchWork);
        };
        info!(store = %handle.name, count = batches.len(), "Found queued batches");

        let pending = tx
            .find_messages(
                &MessageQuery::pending_outgoing()
                    .in_batch(batch.id)
                    .limit(self.config.chunk_size),
            )
            .await?;
        if !pending.is_empty() {
            return Ok(StoreState::BatchChunkReady {
                batch_id: batch.id,
                messages: pending,
            });
        }

        let total = tx.count_messages(&MessageQuery::batch(batch.id)).await?;
        let terminal = tx
            .count_messages(&MessageQuery::batch(batch.id).with_statuses(&MessageStatus::TERMINAL))
            .await?;
        if total == terminal {
            Ok(StoreState::BatchAwaitingClose { batch_id: batch.id })
        } else {
            debug!(
                store = %handle.name,
                batch_id = batch.id,
                total,
                terminal,
                "Batch waiting on non-terminal messages"
            );
            Ok(StoreState::IndividualFallback)
        }
    }
}
