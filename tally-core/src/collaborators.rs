use async_trait::async_trait;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::VoucherMovement;

/// Search/index collaborator: told which offers changed, owns the indexing.
#[async_trait]
pub trait ReindexSink: Send + Sync {
    async fn offer_changed(
        &self,
        offer_id: Uuid,
        reason: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Movement rows just committed. Sinks that only index offers ignore them.
    async fn vouchers_moved(
        &self,
        _movements: &[VoucherMovement],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// Media collaborator: copies named collections from a campaign to an offer.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn copy_collections(
        &self,
        campaign_id: Uuid,
        offer_id: Uuid,
        collections: &[String],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Media store for deployments where assets are copied out of band.
pub struct NoopMediaStore;

#[async_trait]
impl MediaStore for NoopMediaStore {
    async fn copy_collections(
        &self,
        _campaign_id: Uuid,
        _offer_id: Uuid,
        _collections: &[String],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// Keeps every reindex signal in memory.
#[derive(Default)]
pub struct RecordingReindexSink {
    signals: Mutex<Vec<(Uuid, String)>>,
    moved: Mutex<Vec<Uuid>>,
}

impl RecordingReindexSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<(Uuid, String)> {
        self.signals.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn offers(&self) -> Vec<Uuid> {
        self.signals().into_iter().map(|(id, _)| id).collect()
    }

    /// Ids of moved vouchers, in the order they were reported.
    pub fn moved_vouchers(&self) -> Vec<Uuid> {
        self.moved.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReindexSink for RecordingReindexSink {
    async fn offer_changed(
        &self,
        offer_id: Uuid,
        reason: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.signals
            .lock()
            .map_err(|e| e.to_string())?
            .push((offer_id, reason.to_string()));
        Ok(())
    }

    async fn vouchers_moved(
        &self,
        movements: &[VoucherMovement],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.moved
            .lock()
            .map_err(|e| e.to_string())?
            .extend(movements.iter().map(|m| m.voucher_id));
        Ok(())
    }
}
