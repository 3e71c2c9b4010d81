use async_trait::async_trait;
use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use tally_core::{ReindexSink, VoucherMovement};
use tally_shared::models::events::{
    BatchSummaryEvent, OfferReindexEvent, VoucherMovedEvent, TOPIC_BATCH_SUMMARY, TOPIC_OFFER_REINDEX,
    TOPIC_VOUCHER_MOVED,
};

#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
}

impl EventProducer {
    pub fn new(brokers: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self { producer })
    }

    pub async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                info!(
                    "Sent message to {}/{}: partition {} offset {}",
                    topic, key, delivery.partition, delivery.offset
                );
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to send message to {}: {}", topic, e);
                Err(e)
            }
        }
    }

    /// One audit record per batch job and campaign.
    pub async fn publish_batch_summary(
        &self,
        job: &str,
        campaign_id: Option<Uuid>,
        dry_run: bool,
        counts: serde_json::Value,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let event = BatchSummaryEvent {
            job: job.to_string(),
            campaign_id,
            dry_run,
            counts,
            timestamp: Utc::now().timestamp(),
        };
        let key = campaign_id.map(|id| id.to_string()).unwrap_or_else(|| job.to_string());
        let payload = serde_json::to_string(&event)?;
        self.publish(TOPIC_BATCH_SUMMARY, &key, &payload).await?;
        Ok(())
    }
}

/// Forwards engine change signals to the search indexer over Kafka.
#[derive(Clone)]
pub struct KafkaReindexSink {
    producer: EventProducer,
}

impl KafkaReindexSink {
    pub fn new(producer: EventProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl ReindexSink for KafkaReindexSink {
    async fn offer_changed(&self, offer_id: Uuid, reason: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let event = OfferReindexEvent {
            offer_id,
            reason: reason.to_string(),
            timestamp: Utc::now().timestamp(),
        };
        let payload = serde_json::to_string(&event)?;
        self.producer
            .publish(TOPIC_OFFER_REINDEX, &offer_id.to_string(), &payload)
            .await?;
        Ok(())
    }

    async fn vouchers_moved(
        &self,
        movements: &[VoucherMovement],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        for movement in movements {
            let payload = serde_json::to_string(&moved_event(movement))?;
            self.producer
                .publish(TOPIC_VOUCHER_MOVED, &movement.voucher_id.to_string(), &payload)
                .await?;
        }
        Ok(())
    }
}

fn moved_event(movement: &VoucherMovement) -> VoucherMovedEvent {
    VoucherMovedEvent {
        voucher_id: movement.voucher_id,
        from_offer_id: movement.from_offer_id,
        to_offer_id: movement.to_offer_id,
        actor_user_id: movement.actor_user_id,
        remarks: movement.remarks.clone(),
        timestamp: movement.created_at.timestamp(),
    }
}
