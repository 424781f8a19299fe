//! Consumer loop: turns each delivered message into an idempotent store
//! mutation and settles it with the broker according to the outcome.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use redwatch_core::RawNotice;
use redwatch_queue::{settle, AckDecision, QueueConfig, QueueConnection};
use redwatch_store::{NoticeStore, UpsertOutcome};
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "redwatch-consumer";

pub const CONSUMER_TAG: &str = "redwatch-consumer";

/// Terminal state of one message's processing.
///
/// `Received → Parsed → {Inserted | Updated | RejectedMalformed |
/// RejectedTransient}`; the non-terminal states exist only as control flow
/// inside [`process_payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Inserted,
    Updated,
    /// The payload can never be processed; retrying cannot change that.
    RejectedMalformed,
    /// The store write failed; redelivery is safe because the upsert is
    /// idempotent per name.
    RejectedTransient,
}

impl ProcessOutcome {
    pub fn ack_decision(self) -> AckDecision {
        match self {
            ProcessOutcome::Inserted | ProcessOutcome::Updated => AckDecision::Ack,
            ProcessOutcome::RejectedMalformed => AckDecision::Discard,
            ProcessOutcome::RejectedTransient => AckDecision::Requeue,
        }
    }
}

/// Decode one payload and apply the idempotent upsert. Never returns an
/// error: every failure collapses into an outcome so the caller always has
/// a settlement decision.
pub async fn process_payload(
    store: &dyn NoticeStore,
    payload: &[u8],
    now: DateTime<Utc>,
) -> ProcessOutcome {
    let notice: RawNotice = match serde_json::from_slice(payload) {
        Ok(notice) => notice,
        Err(err) => {
            warn!(error = %err, "discarding malformed payload");
            return ProcessOutcome::RejectedMalformed;
        }
    };

    if !notice.has_usable_name() {
        warn!("discarding payload without a usable name");
        return ProcessOutcome::RejectedMalformed;
    }

    match store.upsert(&notice, now).await {
        Ok(UpsertOutcome::Inserted) => {
            info!(name = %notice.name, "created notice");
            ProcessOutcome::Inserted
        }
        Ok(UpsertOutcome::Updated) => {
            info!(name = %notice.name, "updated notice");
            ProcessOutcome::Updated
        }
        Err(err) => {
            error!(name = %notice.name, error = %err, "store write failed, requeueing");
            ProcessOutcome::RejectedTransient
        }
    }
}

/// The blocking receive loop over one broker connection.
pub struct Consumer {
    queue: QueueConfig,
    store: Arc<dyn NoticeStore>,
}

impl Consumer {
    pub fn new(queue: QueueConfig, store: Arc<dyn NoticeStore>) -> Self {
        Self { queue, store }
    }

    /// Consume until the connection drops or `shutdown` fires. At most one
    /// message is in flight at a time, so processing is serialized and the
    /// upsert needs no locking within this instance. On shutdown the
    /// in-flight message is left unacked and redelivers on reconnect.
    ///
    /// A broker error makes this return `Err`; the supervisor is expected
    /// to restart the process.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let connection = QueueConnection::open(&self.queue)
            .await
            .context("connecting consumer to broker")?;
        let mut deliveries = connection
            .subscribe(CONSUMER_TAG)
            .await
            .context("subscribing to queue")?;
        info!(queue = %self.queue.queue_name, "consuming");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown requested, stopping consumer");
                    break;
                }
                next = deliveries.next() => {
                    let Some(delivery) = next else {
                        anyhow::bail!("delivery stream ended, broker connection lost");
                    };
                    let delivery = delivery.context("receiving delivery")?;
                    if delivery.redelivered {
                        info!("processing redelivered message");
                    }
                    let outcome =
                        process_payload(self.store.as_ref(), &delivery.data, Utc::now()).await;
                    settle(&delivery.acker, outcome.ack_decision())
                        .await
                        .context("settling delivery")?;
                }
            }
        }

        connection.close().await.context("closing consumer connection")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use redwatch_store::{MemoryNoticeStore, NoticeReader};

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, secs).single().unwrap()
    }

    #[test]
    fn outcomes_map_to_the_ack_protocol() {
        assert_eq!(ProcessOutcome::Inserted.ack_decision(), AckDecision::Ack);
        assert_eq!(ProcessOutcome::Updated.ack_decision(), AckDecision::Ack);
        assert_eq!(
            ProcessOutcome::RejectedMalformed.ack_decision(),
            AckDecision::Discard
        );
        assert_eq!(
            ProcessOutcome::RejectedTransient.ack_decision(),
            AckDecision::Requeue
        );
    }

    #[tokio::test]
    async fn first_delivery_inserts_second_updates() {
        let store = MemoryNoticeStore::new();
        let first = br#"{"name":"Jane Doe","age":"45","nationality":"FR","image_url":null,"scraped_at":"2024-01-01T00:00:00"}"#;
        let second = br#"{"name":"Jane Doe","age":"46","nationality":"FR","image_url":null,"scraped_at":"2024-01-01T00:05:00"}"#;

        let outcome = process_payload(&store, first, at(0)).await;
        assert_eq!(outcome, ProcessOutcome::Inserted);

        let rows = store.list_recent().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].created_at, rows[0].updated_at);

        let outcome = process_payload(&store, second, at(5)).await;
        assert_eq!(outcome, ProcessOutcome::Updated);

        let rows = store.list_recent().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].age.as_deref(), Some("46"));
        assert!(rows[0].updated_at > rows[0].created_at);
    }

    #[tokio::test]
    async fn non_json_payload_is_discarded_without_a_row() {
        let store = MemoryNoticeStore::new();
        let outcome = process_payload(&store, b"not json at all", at(0)).await;
        assert_eq!(outcome, ProcessOutcome::RejectedMalformed);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_name_is_discarded_without_a_row() {
        let store = MemoryNoticeStore::new();
        let payload = br#"{"age":"45","collected_at":"2024-01-01T00:00:00"}"#;
        let outcome = process_payload(&store, payload, at(0)).await;
        assert_eq!(outcome, ProcessOutcome::RejectedMalformed);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn blank_name_is_discarded_without_a_row() {
        let store = MemoryNoticeStore::new();
        let payload = br#"{"name":"  ","collected_at":"2024-01-01T00:00:00"}"#;
        let outcome = process_payload(&store, payload, at(0)).await;
        assert_eq!(outcome, ProcessOutcome::RejectedMalformed);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_outage_requeues_and_retry_converges_to_one_row() {
        let store = MemoryNoticeStore::new();
        let payload = br#"{"name":"Jane Doe","collected_at":"2024-01-01T00:00:00"}"#;

        store.set_failing(true);
        let outcome = process_payload(&store, payload, at(0)).await;
        assert_eq!(outcome, ProcessOutcome::RejectedTransient);
        assert!(store.list_recent().await.is_err());

        // Outage clears; the redelivered message lands exactly once.
        store.set_failing(false);
        let outcome = process_payload(&store, payload, at(1)).await;
        assert_eq!(outcome, ProcessOutcome::Inserted);
        let outcome = process_payload(&store, payload, at(2)).await;
        assert_eq!(outcome, ProcessOutcome::Updated);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sequential_messages_for_one_name_finish_in_order() {
        let store = MemoryNoticeStore::new();
        let m1 = br#"{"name":"A","age":"1","collected_at":"2024-01-01T00:00:00"}"#;
        let m2 = br#"{"name":"A","age":"2","collected_at":"2024-01-01T00:01:00"}"#;

        // With prefetch = 1 the loop awaits each settlement before the next
        // delivery; processing them back to back models that.
        process_payload(&store, m1, at(0)).await;
        process_payload(&store, m2, at(1)).await;

        let rows = store.list_recent().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].age.as_deref(), Some("2"));
        assert_eq!(rows[0].updated_at, at(1));
    }
}
