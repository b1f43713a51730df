//! Outbox relay.
//!
//! Polls pending outbox rows and applies them to the search index in creation
//! order. A row that fails is retried on later passes and parked once it hits
//! `max_retries`. While a row for a document is failing, newer rows for the
//! same document are held back so the index never sees them out of order.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use domain::{OutboxMessage, SearchCommand};
use serde::Serialize;
use store::{OutboxRepository, Store, UnitOfWork};
use tokio_util::sync::CancellationToken;

use crate::error::{IndexError, Result};
use crate::index::SearchIndex;

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    /// Failed deliveries before a row is parked.
    pub max_retries: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 100,
            max_retries: 10,
        }
    }
}

/// What one relay pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub relayed: usize,
    pub failed: usize,
    /// Rows that failed for the last time. Also counted in `failed`.
    pub parked: usize,
    /// Rows skipped because an older row for the same document failed.
    pub held_back: usize,
}

pub struct OutboxRelay<S: Store, I: SearchIndex> {
    store: S,
    index: I,
    config: RelayConfig,
}

impl<S: Store, I: SearchIndex> OutboxRelay<S, I> {
    pub fn new(store: S, index: I, config: RelayConfig) -> Self {
        Self {
            store,
            index,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    /// Delivers one batch of pending rows.
    #[tracing::instrument(skip(self))]
    pub async fn relay_once(&self) -> Result<RelayReport> {
        let now = Utc::now();
        let mut report = RelayReport::default();
        let mut blocked: HashSet<(String, String)> = HashSet::new();

        let mut uow = self.store.begin().await?;
        let messages = uow.pending_outbox(self.config.batch_size).await?;

        for mut message in messages {
            let command = match message.command() {
                Ok(command) => command,
                Err(e) => {
                    // Retrying cannot fix a payload that does not decode.
                    message.last_error = Some(format!("undecodable payload: {e}"));
                    message.parked_at = Some(now);
                    report.failed += 1;
                    report.parked += 1;
                    metrics::counter!("outbox_messages_parked_total").increment(1);
                    tracing::error!(message_id = %message.id, error = %e, "outbox message parked");
                    uow.update_outbox(&message).await?;
                    continue;
                }
            };

            let key = (
                command.index().to_string(),
                command.document_id().to_string(),
            );
            if blocked.contains(&key) {
                report.held_back += 1;
                continue;
            }

            match self.apply(&command).await {
                Ok(()) => {
                    message.mark_processed(now);
                    report.relayed += 1;
                    metrics::counter!("outbox_messages_relayed_total").increment(1);
                }
                Err(e) => {
                    blocked.insert(key);
                    report.failed += 1;
                    metrics::counter!("outbox_messages_failed_total").increment(1);
                    if self.record_failure(&mut message, &e, now) {
                        report.parked += 1;
                    }
                }
            }

            uow.update_outbox(&message).await?;
        }

        uow.commit().await?;

        if report != RelayReport::default() {
            tracing::debug!(
                relayed = report.relayed,
                failed = report.failed,
                parked = report.parked,
                held_back = report.held_back,
                "relay pass finished"
            );
        }
        Ok(report)
    }

    /// Polls every `poll_interval` until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "outbox relay started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("outbox relay stopped");
                    return;
                }
            }

            if let Err(e) = self.relay_once().await {
                tracing::warn!(error = %e, "relay pass failed");
            }
        }
    }

    async fn apply(&self, command: &SearchCommand) -> std::result::Result<(), IndexError> {
        match command {
            SearchCommand::IndexDocument {
                index,
                document_id,
                document,
            } => self.index.index_document(index, document_id, document).await,
            SearchCommand::DeleteDocument { index, document_id } => {
                self.index.delete_document(index, document_id).await
            }
        }
    }

    fn record_failure(
        &self,
        message: &mut OutboxMessage,
        error: &IndexError,
        now: chrono::DateTime<Utc>,
    ) -> bool {
        let parked = message.record_failure(error.to_string(), self.config.max_retries, now);
        if parked {
            metrics::counter!("outbox_messages_parked_total").increment(1);
            tracing::error!(
                message_id = %message.id,
                event_type = %message.event_type,
                retry_count = message.retry_count,
                error = %error,
                "outbox message parked"
            );
        } else {
            tracing::warn!(
                message_id = %message.id,
                retry_count = message.retry_count,
                error = %error,
                "outbox delivery failed, will retry"
            );
        }
        parked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InMemorySearchIndex;
    use serde_json::json;
    use store::InMemoryStore;

    async fn enqueue(store: &InMemoryStore, payload: serde_json::Value) {
        let mut message = OutboxMessage::new(
            "Variant",
            Default::default(),
            &SearchCommand::DeleteDocument {
                index: "products".to_string(),
                document_id: "x".to_string(),
            },
            Utc::now(),
        )
        .unwrap();
        message.payload = payload;
        let mut uow = store.begin().await.unwrap();
        uow.enqueue_outbox(&message).await.unwrap();
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_parked_immediately() {
        let store = InMemoryStore::new();
        enqueue(&store, json!({"type": "Reindex"})).await;

        let relay = OutboxRelay::new(
            store.clone(),
            InMemorySearchIndex::new(),
            RelayConfig::default(),
        );
        let report = relay.relay_once().await.unwrap();

        assert_eq!(report.parked, 1);
        assert_eq!(report.relayed, 0);
        let rows = store.outbox().await;
        assert!(rows[0].parked_at.is_some());
        assert!(!rows[0].is_pending());
    }

    #[tokio::test]
    async fn test_empty_outbox_is_a_noop() {
        let relay = OutboxRelay::new(
            InMemoryStore::new(),
            InMemorySearchIndex::new(),
            RelayConfig::default(),
        );
        assert_eq!(relay.relay_once().await.unwrap(), RelayReport::default());
    }
}
