use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use tally_catalog::OfferTemplate;
use tally_core::{
    EngineError, EngineResult, InventoryRepository, MediaStore, Offer, ReindexSink, Schedule, Voucher,
};

use crate::codes::CodeGenerator;

const MAX_CODE_ATTEMPTS: usize = 3;

/// Turns schedules into sellable offers with their voucher batch.
pub struct OfferMaterializer {
    repo: Arc<dyn InventoryRepository>,
    media: Arc<dyn MediaStore>,
    reindex: Arc<dyn ReindexSink>,
    codes: CodeGenerator,
}

impl OfferMaterializer {
    pub fn new(
        repo: Arc<dyn InventoryRepository>,
        media: Arc<dyn MediaStore>,
        reindex: Arc<dyn ReindexSink>,
    ) -> Self {
        Self {
            repo,
            media,
            reindex,
            codes: CodeGenerator::new(),
        }
    }

    /// Materialize the stored schedule `schedule_id`.
    pub async fn materialize(&self, schedule_id: Uuid, now: DateTime<Utc>) -> EngineResult<Offer> {
        let schedule = self
            .repo
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| EngineError::not_found("schedule", schedule_id))?;
        self.materialize_schedule(&schedule, now).await
    }

    /// One offer plus `schedule.quantity` fresh vouchers.
    pub async fn materialize_schedule(&self, schedule: &Schedule, now: DateTime<Utc>) -> EngineResult<Offer> {
        self.create(schedule, schedule.quantity, now).await
    }

    /// An offer without vouchers of its own, filled afterwards by moves.
    pub async fn attach(&self, schedule: &Schedule, now: DateTime<Utc>) -> EngineResult<Offer> {
        self.create(schedule, 0, now).await
    }

    async fn create(&self, schedule: &Schedule, voucher_count: i64, now: DateTime<Utc>) -> EngineResult<Offer> {
        if schedule.window.is_elapsed(now) {
            return Err(EngineError::WindowElapsed(schedule.id));
        }
        if voucher_count < 0 {
            return Err(EngineError::Validation(format!(
                "schedule {} has negative quantity {}",
                schedule.id, voucher_count
            )));
        }
        if !self.repo.offers_for_schedule(schedule.id).await?.is_empty() {
            return Err(EngineError::AlreadyMaterialized(schedule.id));
        }

        let campaign = self.repo.get_campaign(schedule.campaign_id).await?.ok_or_else(|| {
            EngineError::OrphanedReference(format!(
                "schedule {} references missing campaign {}",
                schedule.id, schedule.campaign_id
            ))
        })?;
        let template = OfferTemplate::from_campaign(&campaign);
        let offer = template.offer_for(schedule, voucher_count, now);

        let mut attempt = 1;
        loop {
            let vouchers: Vec<Voucher> = self
                .codes
                .batch(voucher_count as usize)
                .into_iter()
                .map(|code| Voucher::new(campaign.id, offer.id, code, now))
                .collect();

            match self.repo.materialize_offer(&offer, &vouchers).await {
                Ok(()) => break,
                Err(EngineError::DuplicateCode(code)) if attempt < MAX_CODE_ATTEMPTS => {
                    warn!(schedule_id = %schedule.id, code = %code, attempt, "Voucher code collision, regenerating batch");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if schedule.status != offer.status && schedule.status.can_transition_to(offer.status) {
            self.repo.set_schedule_status(schedule.id, offer.status).await?;
        }

        info!(
            campaign_id = %campaign.id,
            schedule_id = %schedule.id,
            offer_id = %offer.id,
            vouchers = voucher_count,
            status = %offer.status,
            "Materialized offer"
        );

        if let Err(e) = self
            .media
            .copy_collections(campaign.id, offer.id, &template.media_collections)
            .await
        {
            warn!(offer_id = %offer.id, "Media copy failed: {}", e);
        }
        notify_offer(self.reindex.as_ref(), offer.id, "materialized").await;

        Ok(offer)
    }
}

/// Reindex failures never undo committed inventory changes; they are logged.
pub(crate) async fn notify_offer(sink: &dyn ReindexSink, offer_id: Uuid, reason: &str) {
    if let Err(e) = sink.offer_changed(offer_id, reason).await {
        warn!(offer_id = %offer_id, reason, "Reindex signal failed: {}", e);
    }
}

pub(crate) async fn notify_moves(sink: &dyn ReindexSink, movements: &[tally_core::VoucherMovement]) {
    if movements.is_empty() {
        return;
    }
    if let Err(e) = sink.vouchers_moved(movements).await {
        warn!(count = movements.len(), "Movement notification failed: {}", e);
    }
}
