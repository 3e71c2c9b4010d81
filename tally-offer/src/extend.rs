use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use tally_catalog::{PlanRequest, SchedulePlan, SchedulePlanner};
use tally_core::{EngineError, EngineResult, InventoryRepository, RunMode, Schedule};

use crate::materializer::OfferMaterializer;

/// Operator request to add selling windows to a campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtendRequest {
    pub total_quantity: i64,
    pub per_window_quantity: i64,
    pub window_days: Option<i64>,
    pub gap_minutes: Option<i64>,
    pub max_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtendReport {
    pub campaign_id: Uuid,
    pub dry_run: bool,
    pub plan: SchedulePlan,
    pub schedules: Vec<Uuid>,
    pub offers: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtendDefaults {
    pub window_days: i64,
    pub gap_minutes: i64,
    pub max_days: Option<i64>,
}

impl Default for ExtendDefaults {
    fn default() -> Self {
        Self {
            window_days: 3,
            gap_minutes: 0,
            max_days: None,
        }
    }
}

pub struct ScheduleExtender {
    repo: Arc<dyn InventoryRepository>,
    materializer: Arc<OfferMaterializer>,
    defaults: ExtendDefaults,
}

impl ScheduleExtender {
    pub fn new(
        repo: Arc<dyn InventoryRepository>,
        materializer: Arc<OfferMaterializer>,
        defaults: ExtendDefaults,
    ) -> Self {
        Self {
            repo,
            materializer,
            defaults,
        }
    }

    /// Plans new windows after the campaign's last one and, in apply mode,
    /// stores each schedule and materializes its offer.
    ///
    /// A budgeted campaign never gets more unsold vouchers than its
    /// agreement leaves room for.
    pub async fn extend(
        &self,
        sku: &str,
        request: &ExtendRequest,
        now: DateTime<Utc>,
        mode: RunMode,
    ) -> EngineResult<ExtendReport> {
        let campaign = self
            .repo
            .find_campaign_by_sku(sku)
            .await?
            .ok_or_else(|| EngineError::not_found("campaign", sku))?;

        if let Some(agreement) = campaign.agreement_quantity {
            let tally = self.repo.campaign_tally(campaign.id).await?;
            let room = agreement - tally.live();
            if request.total_quantity > room {
                return Err(EngineError::BudgetExceeded {
                    campaign_id: campaign.id,
                    requested: request.total_quantity,
                    available: room.max(0),
                });
            }
        }

        let plan_request = PlanRequest::from_days(
            request.total_quantity,
            request.per_window_quantity,
            request.window_days.unwrap_or(self.defaults.window_days),
            request.gap_minutes.unwrap_or(self.defaults.gap_minutes),
            request.max_days.or(self.defaults.max_days),
        )?;
        let plan = SchedulePlanner::plan_for_campaign(self.repo.as_ref(), campaign.id, &plan_request, now).await?;

        let mut report = ExtendReport {
            campaign_id: campaign.id,
            dry_run: mode.is_dry_run(),
            plan,
            schedules: Vec::new(),
            offers: Vec::new(),
        };
        if mode.is_dry_run() {
            return Ok(report);
        }

        for planned in &report.plan.windows {
            let schedule = Schedule::new(campaign.id, planned.window, planned.quantity, now);
            self.repo.insert_schedule(&schedule).await?;
            let offer = self.materializer.materialize_schedule(&schedule, now).await?;
            report.schedules.push(schedule.id);
            report.offers.push(offer.id);
        }

        info!(
            campaign_id = %campaign.id,
            sku = %campaign.sku,
            schedules = report.schedules.len(),
            vouchers = report.plan.scheduled_quantity(),
            "Campaign extended"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tally_catalog::draft_campaign;
    use tally_core::collaborators::{NoopMediaStore, RecordingReindexSink};
    use tally_core::InMemoryInventory;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    async fn extender(agreement: Option<i64>) -> (Arc<InMemoryInventory>, ScheduleExtender) {
        let repo = Arc::new(InMemoryInventory::new());
        let campaign = draft_campaign("ESCAPE-ROOM", Uuid::new_v4(), agreement, day(0));
        repo.insert_campaign(&campaign).await.unwrap();
        let materializer = Arc::new(OfferMaterializer::new(
            repo.clone(),
            Arc::new(NoopMediaStore),
            Arc::new(RecordingReindexSink::new()),
        ));
        let extender = ScheduleExtender::new(repo.clone(), materializer, ExtendDefaults::default());
        (repo, extender)
    }

    fn request(total: i64, per_window: i64) -> ExtendRequest {
        ExtendRequest {
            total_quantity: total,
            per_window_quantity: per_window,
            window_days: None,
            gap_minutes: None,
            max_days: None,
        }
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (repo, extender) = extender(Some(10)).await;
        let report = extender
            .extend("ESCAPE-ROOM", &request(10, 4), day(0), RunMode::DryRun)
            .await
            .unwrap();
        assert_eq!(report.plan.windows.len(), 3);
        assert!(repo.list_schedules(report.campaign_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_materializes_every_window() {
        let (repo, extender) = extender(Some(10)).await;
        let report = extender
            .extend("ESCAPE-ROOM", &request(10, 4), day(0), RunMode::Apply)
            .await
            .unwrap();
        assert_eq!(report.offers.len(), 3);
        assert_eq!(repo.campaign_tally(report.campaign_id).await.unwrap().free, 10);

        let err = extender
            .extend("ESCAPE-ROOM", &request(1, 4), day(0), RunMode::Apply)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BudgetExceeded { available: 0, .. }));
    }

    #[tokio::test]
    async fn test_unknown_sku() {
        let (_repo, extender) = extender(None).await;
        let err = extender
            .extend("NOPE", &request(1, 1), day(0), RunMode::Apply)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "campaign", .. }));
    }

    #[tokio::test]
    async fn test_oversized_window_is_a_validation_error() {
        let (repo, extender) = extender(Some(10)).await;
        let mut oversized = request(2, 1);
        oversized.window_days = Some(200_000_000);
        let err = extender
            .extend("ESCAPE-ROOM", &oversized, day(0), RunMode::Apply)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let campaign = repo.find_campaign_by_sku("ESCAPE-ROOM").await.unwrap().unwrap();
        assert!(repo.list_schedules(campaign.id).await.unwrap().is_empty());
    }
}
