//! Moving unsold vouchers out of lapsed windows.
//!
//! Two entry points share the same move primitive. The automatic form
//! rolls every still-free voucher of a campaign's elapsed offers into freshly
//! planned windows, capped at the campaign's remaining budget and committed
//! one voucher at a time. The operator form transfers a fixed count between
//! two named offers in a single atomic unit guarded by the budget check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use tally_catalog::{PlanRequest, SchedulePlan, SchedulePlanner};
use tally_core::invariants::{check_budget, remaining_budget};
use tally_core::{
    BudgetGuard, EngineError, EngineResult, InventoryRepository, OfferStatus, ReindexSink, RunMode,
    Schedule, Voucher, VoucherMove,
};

use crate::lifecycle::mirror_schedule;
use crate::materializer::{notify_moves, notify_offer, OfferMaterializer};

pub const AUTO_MOVED_REMARK: &str = "Auto Moved";
pub const TRANSFER_REMARK: &str = "Redistribution";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedistributionConfig {
    pub window_quantity: i64,
    pub window_days: i64,
    pub window_gap_minutes: i64,
    pub max_days: Option<i64>,
}

impl Default for RedistributionConfig {
    fn default() -> Self {
        Self {
            window_quantity: 100,
            window_days: 3,
            window_gap_minutes: 0,
            max_days: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Unbounded,
    NoElapsedSchedule,
    ActiveScheduleExists,
    BudgetExhausted,
    NothingToMove,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedistributionReport {
    pub campaign_id: Uuid,
    pub dry_run: bool,
    pub skipped: Option<SkipReason>,
    pub remaining_budget: Option<i64>,
    pub free_in_elapsed: i64,
    pub plan: Option<SchedulePlan>,
    pub offers_created: Vec<Uuid>,
    pub moved: i64,
    pub rejected: i64,
    pub archived_offers: Vec<Uuid>,
}

impl RedistributionReport {
    fn new(campaign_id: Uuid, mode: RunMode) -> Self {
        Self {
            campaign_id,
            dry_run: mode.is_dry_run(),
            skipped: None,
            remaining_budget: None,
            free_in_elapsed: 0,
            plan: None,
            offers_created: Vec::new(),
            moved: 0,
            rejected: 0,
            archived_offers: Vec::new(),
        }
    }

    fn skip(mut self, reason: SkipReason) -> Self {
        self.skipped = Some(reason);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RedistributionRun {
    pub reports: Vec<RedistributionReport>,
    pub failures: Vec<CampaignFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignFailure {
    pub campaign_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRequest {
    pub from_offer_id: Uuid,
    pub to_offer_id: Uuid,
    pub count: i64,
    pub actor_user_id: Option<Uuid>,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferReport {
    pub campaign_id: Uuid,
    pub from_offer_id: Uuid,
    pub to_offer_id: Uuid,
    pub requested: i64,
    pub moved: i64,
    pub dry_run: bool,
    pub voucher_ids: Vec<Uuid>,
}

pub struct RedistributionEngine {
    repo: Arc<dyn InventoryRepository>,
    materializer: Arc<OfferMaterializer>,
    reindex: Arc<dyn ReindexSink>,
    config: RedistributionConfig,
}

impl RedistributionEngine {
    pub fn new(
        repo: Arc<dyn InventoryRepository>,
        materializer: Arc<OfferMaterializer>,
        reindex: Arc<dyn ReindexSink>,
        config: RedistributionConfig,
    ) -> Self {
        Self {
            repo,
            materializer,
            reindex,
            config,
        }
    }

    /// Redistribute one campaign.
    pub async fn redistribute(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
        mode: RunMode,
    ) -> EngineResult<RedistributionReport> {
        let campaign = self
            .repo
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| EngineError::not_found("campaign", campaign_id))?;
        let mut report = RedistributionReport::new(campaign_id, mode);

        let Some(agreement) = campaign.agreement_quantity else {
            return Ok(report.skip(SkipReason::Unbounded));
        };

        let schedules = self.repo.list_schedules(campaign_id).await?;
        if !schedules.iter().any(|s| s.window.is_elapsed(now)) {
            return Ok(report.skip(SkipReason::NoElapsedSchedule));
        }
        if schedules.iter().any(|s| s.is_active() && !s.window.is_elapsed(now)) {
            return Ok(report.skip(SkipReason::ActiveScheduleExists));
        }

        let tally = self.repo.campaign_tally(campaign_id).await?;
        let remaining = remaining_budget(Some(agreement), tally.owned).unwrap_or(0);
        report.remaining_budget = Some(remaining);

        let mut free = self.repo.free_vouchers_in_elapsed_offers(campaign_id, now).await?;
        report.free_in_elapsed = free.len() as i64;

        if remaining <= 0 {
            return Ok(report.skip(SkipReason::BudgetExhausted));
        }
        if free.is_empty() {
            if mode == RunMode::Apply {
                report.archived_offers = self.archive_emptied(campaign_id, now).await?;
            }
            return Ok(report.skip(SkipReason::NothingToMove));
        }

        free.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let carry = remaining.min(free.len() as i64);
        free.truncate(carry as usize);

        let latest_until = schedules.iter().map(|s| s.window.available_until).max();
        let request = PlanRequest::from_days(
            carry,
            self.config.window_quantity,
            self.config.window_days,
            self.config.window_gap_minutes,
            self.config.max_days,
        )?;
        let plan = SchedulePlanner::plan(&request, latest_until, now)?;
        report.plan = Some(plan.clone());

        if mode.is_dry_run() {
            info!(
                campaign_id = %campaign_id,
                windows = plan.windows.len(),
                vouchers = plan.scheduled_quantity(),
                "Redistribution dry run"
            );
            return Ok(report);
        }

        let mut pending = free.into_iter();
        for planned in &plan.windows {
            let chunk: Vec<Voucher> = pending.by_ref().take(planned.quantity as usize).collect();
            let schedule = Schedule::new(campaign_id, planned.window, chunk.len() as i64, now);
            self.repo.insert_schedule(&schedule).await?;
            let offer = self.materializer.attach(&schedule, now).await?;
            report.offers_created.push(offer.id);

            let mut movements = Vec::with_capacity(chunk.len());
            for voucher in chunk {
                let mv = VoucherMove {
                    voucher_id: voucher.id,
                    from_offer_id: voucher.merchant_offer_id,
                    to_offer_id: offer.id,
                    actor_user_id: Some(campaign.owner_user_id),
                    remarks: AUTO_MOVED_REMARK.to_string(),
                };
                match self.repo.move_vouchers(&[mv], None, now).await {
                    Ok(mut moved) => {
                        report.moved += 1;
                        movements.append(&mut moved);
                    }
                    Err(EngineError::Storage(e)) => {
                        error!(campaign_id = %campaign_id, voucher_id = %voucher.id, "Voucher move failed: {}", e);
                        return Err(EngineError::Storage(e));
                    }
                    Err(e) => {
                        warn!(campaign_id = %campaign_id, voucher_id = %voucher.id, "Voucher move rejected: {}", e);
                        report.rejected += 1;
                    }
                }
            }
            notify_moves(self.reindex.as_ref(), &movements).await;
            notify_offer(self.reindex.as_ref(), offer.id, "redistributed").await;
        }

        report.archived_offers = self.archive_emptied(campaign_id, now).await?;
        info!(
            campaign_id = %campaign_id,
            moved = report.moved,
            rejected = report.rejected,
            offers_created = report.offers_created.len(),
            archived = report.archived_offers.len(),
            "Redistribution applied"
        );
        Ok(report)
    }

    /// Every budgeted campaign, one at a time. A failing campaign is logged
    /// and the run goes on.
    pub async fn redistribute_all(&self, now: DateTime<Utc>, mode: RunMode) -> EngineResult<RedistributionRun> {
        let mut run = RedistributionRun::default();
        for campaign in self.repo.list_campaigns().await? {
            if campaign.agreement_quantity.is_none() {
                continue;
            }
            match self.redistribute(campaign.id, now, mode).await {
                Ok(report) => run.reports.push(report),
                Err(e) => {
                    warn!(campaign_id = %campaign.id, "Redistribution failed: {}", e);
                    run.failures.push(CampaignFailure {
                        campaign_id: campaign.id,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(run)
    }

    /// Operator transfer of `count` unsold vouchers between two offers of one
    /// campaign. All of them move, or none does.
    pub async fn transfer(
        &self,
        request: &TransferRequest,
        now: DateTime<Utc>,
        mode: RunMode,
    ) -> EngineResult<TransferReport> {
        if request.count < 1 {
            return Err(EngineError::Validation(format!(
                "transfer count must be positive, got {}",
                request.count
            )));
        }
        if request.from_offer_id == request.to_offer_id {
            return Err(EngineError::Validation("source and destination offer are the same".to_string()));
        }

        let source = self
            .repo
            .get_offer(request.from_offer_id)
            .await?
            .ok_or_else(|| EngineError::not_found("offer", request.from_offer_id))?;
        let target = self
            .repo
            .get_offer(request.to_offer_id)
            .await?
            .ok_or_else(|| EngineError::not_found("offer", request.to_offer_id))?;
        if source.campaign_id != target.campaign_id {
            return Err(EngineError::Validation(format!(
                "offers {} and {} belong to different campaigns",
                source.id, target.id
            )));
        }
        if target.status == OfferStatus::Archived || target.window.is_elapsed(now) {
            return Err(EngineError::Validation(format!(
                "offer {} can no longer be sold and cannot receive vouchers",
                target.id
            )));
        }
        let campaign = self
            .repo
            .get_campaign(source.campaign_id)
            .await?
            .ok_or_else(|| EngineError::not_found("campaign", source.campaign_id))?;

        let mut free: Vec<Voucher> = self
            .repo
            .list_vouchers(source.id)
            .await?
            .into_iter()
            .filter(|v| v.is_free())
            .collect();
        if (free.len() as i64) < request.count {
            return Err(EngineError::OutOfStock {
                offer_id: source.id,
                requested: request.count,
                available: free.len() as i64,
            });
        }
        free.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        free.truncate(request.count as usize);

        let mut report = TransferReport {
            campaign_id: campaign.id,
            from_offer_id: source.id,
            to_offer_id: target.id,
            requested: request.count,
            moved: 0,
            dry_run: mode.is_dry_run(),
            voucher_ids: free.iter().map(|v| v.id).collect(),
        };

        if mode.is_dry_run() {
            let tally = self.repo.campaign_tally(campaign.id).await?;
            check_budget(campaign.id, campaign.agreement_quantity, tally.owned, request.count)?;
            return Ok(report);
        }

        let remarks = request.remarks.clone().unwrap_or_else(|| TRANSFER_REMARK.to_string());
        let moves: Vec<VoucherMove> = free
            .iter()
            .map(|v| VoucherMove {
                voucher_id: v.id,
                from_offer_id: source.id,
                to_offer_id: target.id,
                actor_user_id: request.actor_user_id,
                remarks: remarks.clone(),
            })
            .collect();
        let guard = BudgetGuard {
            campaign_id: campaign.id,
            requested: request.count,
        };

        let movements = self.repo.move_vouchers(&moves, Some(guard), now).await.map_err(|e| {
            warn!(
                campaign_id = %campaign.id,
                from_offer_id = %source.id,
                to_offer_id = %target.id,
                "Transfer rejected: {}",
                e
            );
            e
        })?;
        report.moved = movements.len() as i64;

        notify_moves(self.reindex.as_ref(), &movements).await;
        notify_offer(self.reindex.as_ref(), source.id, "transfer_source").await;
        notify_offer(self.reindex.as_ref(), target.id, "transfer_target").await;
        info!(
            campaign_id = %campaign.id,
            from_offer_id = %source.id,
            to_offer_id = %target.id,
            moved = report.moved,
            "Vouchers transferred"
        );
        Ok(report)
    }

    /// Archives elapsed offers left without a free voucher.
    async fn archive_emptied(&self, campaign_id: Uuid, now: DateTime<Utc>) -> EngineResult<Vec<Uuid>> {
        let mut archived = Vec::new();
        for offer in self.repo.list_offers(campaign_id).await? {
            if offer.status == OfferStatus::Archived || !offer.window.is_elapsed(now) {
                continue;
            }
            let vouchers = self.repo.list_vouchers(offer.id).await?;
            if vouchers.iter().any(|v| v.is_free()) {
                continue;
            }
            self.repo.update_offer_status(offer.id, OfferStatus::Archived).await?;
            mirror_schedule(self.repo.as_ref(), offer.schedule_id, OfferStatus::Archived).await?;
            notify_offer(self.reindex.as_ref(), offer.id, "archived").await;
            archived.push(offer.id);
        }
        Ok(archived)
    }
}
