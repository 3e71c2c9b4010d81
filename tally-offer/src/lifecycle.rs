use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use tally_core::{EngineError, EngineResult, InventoryRepository, Offer, OfferStatus, ReindexSink, Window};

use crate::materializer::notify_offer;

/// Status for an offer placed in `window` at `now`, never moving backwards
/// from `current`. An archived offer stays archived.
pub fn rederive_status(
    current: OfferStatus,
    window: &Window,
    publish_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> OfferStatus {
    let derived = OfferStatus::for_window(window, publish_at, now);
    if current.can_transition_to(derived) {
        derived
    } else {
        current
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LifecycleReport {
    pub published: Vec<Uuid>,
    pub archived: Vec<Uuid>,
}

/// Keeps offer status (and the schedule mirror) in step with the clock and
/// with stock.
pub struct OfferLifecycle {
    repo: Arc<dyn InventoryRepository>,
    reindex: Arc<dyn ReindexSink>,
}

impl OfferLifecycle {
    pub fn new(repo: Arc<dyn InventoryRepository>, reindex: Arc<dyn ReindexSink>) -> Self {
        Self { repo, reindex }
    }

    async fn target_status(&self, offer: &Offer, now: DateTime<Utc>) -> EngineResult<OfferStatus> {
        let status = rederive_status(offer.status, &offer.window, offer.publish_at, now);
        if status == OfferStatus::Archived {
            return Ok(status);
        }
        let vouchers = self.repo.list_vouchers(offer.id).await?;
        let sold_out = !vouchers.is_empty() && vouchers.iter().all(|v| v.is_owned());
        Ok(if sold_out { OfferStatus::Archived } else { status })
    }

    /// Applies the status the offer should have at `now`. Returns the new
    /// status when it changed.
    pub async fn sync_offer(&self, offer_id: Uuid, now: DateTime<Utc>) -> EngineResult<Option<OfferStatus>> {
        let offer = self
            .repo
            .get_offer(offer_id)
            .await?
            .ok_or_else(|| EngineError::not_found("offer", offer_id))?;

        let target = self.target_status(&offer, now).await?;
        if target == offer.status {
            return Ok(None);
        }
        self.apply(&offer, target).await?;
        Ok(Some(target))
    }

    pub async fn sync_campaign(&self, campaign_id: Uuid, now: DateTime<Utc>) -> EngineResult<LifecycleReport> {
        let mut report = LifecycleReport::default();
        for offer in self.repo.list_offers(campaign_id).await? {
            let target = self.target_status(&offer, now).await?;
            if target == offer.status {
                continue;
            }
            self.apply(&offer, target).await?;
            match target {
                OfferStatus::Published => report.published.push(offer.id),
                OfferStatus::Archived => report.archived.push(offer.id),
                OfferStatus::Draft => {}
            }
        }
        if !report.published.is_empty() || !report.archived.is_empty() {
            info!(
                campaign_id = %campaign_id,
                published = report.published.len(),
                archived = report.archived.len(),
                "Offer statuses synced"
            );
        }
        Ok(report)
    }

    /// Manual archive. Irreversible.
    pub async fn archive(&self, offer_id: Uuid) -> EngineResult<()> {
        let offer = self
            .repo
            .get_offer(offer_id)
            .await?
            .ok_or_else(|| EngineError::not_found("offer", offer_id))?;
        if offer.status != OfferStatus::Archived {
            self.apply(&offer, OfferStatus::Archived).await?;
        }
        Ok(())
    }

    async fn apply(&self, offer: &Offer, status: OfferStatus) -> EngineResult<()> {
        self.repo.update_offer_status(offer.id, status).await?;
        mirror_schedule(self.repo.as_ref(), offer.schedule_id, status).await?;
        debug!(offer_id = %offer.id, from = %offer.status, to = %status, "Offer status changed");
        notify_offer(self.reindex.as_ref(), offer.id, status.as_str()).await;
        Ok(())
    }
}

/// Copies an offer's status onto its schedule when the schedule can follow.
pub(crate) async fn mirror_schedule(
    repo: &dyn InventoryRepository,
    schedule_id: Uuid,
    status: OfferStatus,
) -> EngineResult<()> {
    match repo.get_schedule(schedule_id).await? {
        Some(schedule) if schedule.status != status && schedule.status.can_transition_to(status) => {
            repo.set_schedule_status(schedule_id, status).await
        }
        _ => Ok(()),
    }
}
