//! Periodic consistency passes. Every pass is idempotent and supports a dry
//! run that reports the same findings without acting on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use tally_catalog::find_duplicate_schedules;
use tally_core::{
    EngineError, EngineResult, InventoryRepository, Offer, ReindexSink, RunMode, Schedule, VoucherMove,
};

use crate::lifecycle::rederive_status;
use crate::materializer::{notify_moves, notify_offer, OfferMaterializer};

pub const MERGE_REMARK: &str = "Duplicate Merge";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    MergeDuplicates,
    MissingOffers,
    BudgetDrift,
    OrphanedOffers,
    Conservation,
}

impl Pass {
    /// Canonical order: merges first so repaired offers are not duplicated.
    pub const ALL: [Pass; 5] = [
        Pass::MergeDuplicates,
        Pass::OrphanedOffers,
        Pass::MissingOffers,
        Pass::BudgetDrift,
        Pass::Conservation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Pass::MergeDuplicates => "merge_duplicates",
            Pass::MissingOffers => "missing_offers",
            Pass::BudgetDrift => "budget_drift",
            Pass::OrphanedOffers => "orphaned_offers",
            Pass::Conservation => "conservation",
        }
    }
}

impl FromStr for Pass {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pass::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| EngineError::Validation(format!("unknown reconciliation pass: {}", s)))
    }
}

/// One detected inconsistency and what was (or would be) done about it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub pass: Pass,
    pub campaign_id: Uuid,
    pub subject_id: Option<Uuid>,
    pub detail: String,
    pub action: Option<String>,
    pub applied: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReconcileReport {
    pub dry_run: bool,
    pub campaigns: usize,
    pub findings: Vec<Finding>,
    pub failures: Vec<String>,
}

impl ReconcileReport {
    pub fn count(&self, pass: Pass) -> usize {
        self.findings.iter().filter(|f| f.pass == pass).count()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub auto_correct_budget: bool,
}

pub struct Reconciler {
    repo: Arc<dyn InventoryRepository>,
    materializer: Arc<OfferMaterializer>,
    reindex: Arc<dyn ReindexSink>,
    config: ReconcileConfig,
}

struct FindingLog {
    pass: Pass,
    campaign_id: Uuid,
    applied: bool,
    findings: Vec<Finding>,
}

impl FindingLog {
    fn new(pass: Pass, campaign_id: Uuid, mode: RunMode) -> Self {
        Self {
            pass,
            campaign_id,
            applied: !mode.is_dry_run(),
            findings: Vec::new(),
        }
    }

    fn push(&mut self, subject_id: Option<Uuid>, detail: String, action: Option<String>) {
        warn!(
            pass = self.pass.as_str(),
            campaign_id = %self.campaign_id,
            subject_id = ?subject_id,
            "{}",
            detail
        );
        let applied = self.applied && action.is_some();
        self.findings.push(Finding {
            pass: self.pass,
            campaign_id: self.campaign_id,
            subject_id,
            detail,
            action,
            applied,
        });
    }
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn InventoryRepository>,
        materializer: Arc<OfferMaterializer>,
        reindex: Arc<dyn ReindexSink>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            repo,
            materializer,
            reindex,
            config,
        }
    }

    /// Runs `passes` in canonical order over every campaign. Failures are
    /// collected per campaign and pass; the run continues.
    pub async fn run(&self, passes: &[Pass], now: DateTime<Utc>, mode: RunMode) -> EngineResult<ReconcileReport> {
        let campaigns = self.repo.list_campaigns().await?;
        let mut report = ReconcileReport {
            dry_run: mode.is_dry_run(),
            campaigns: campaigns.len(),
            ..Default::default()
        };

        for campaign in &campaigns {
            for pass in Pass::ALL.into_iter().filter(|p| passes.contains(p)) {
                match self.run_pass(pass, campaign.id, now, mode).await {
                    Ok(mut findings) => report.findings.append(&mut findings),
                    Err(e) => {
                        warn!(campaign_id = %campaign.id, pass = pass.as_str(), "Reconciliation pass failed: {}", e);
                        report
                            .failures
                            .push(format!("{} on campaign {}: {}", pass.as_str(), campaign.id, e));
                    }
                }
            }
        }

        info!(
            campaigns = report.campaigns,
            findings = report.findings.len(),
            failures = report.failures.len(),
            dry_run = report.dry_run,
            "Reconciliation finished"
        );
        Ok(report)
    }

    pub async fn run_pass(
        &self,
        pass: Pass,
        campaign_id: Uuid,
        now: DateTime<Utc>,
        mode: RunMode,
    ) -> EngineResult<Vec<Finding>> {
        match pass {
            Pass::MergeDuplicates => self.merge_duplicates(campaign_id, now, mode).await,
            Pass::MissingOffers => self.repair_missing_offers(campaign_id, now, mode).await,
            Pass::BudgetDrift => self.repair_budget_drift(campaign_id, now, mode).await,
            Pass::OrphanedOffers => self.fix_orphaned_offers(campaign_id, now, mode).await,
            Pass::Conservation => self.audit_conservation(campaign_id).await,
        }
    }

    /// Folds schedules sharing a window into the earliest-created one.
    ///
    /// Offers of the duplicates are repointed at the primary; their free
    /// vouchers move into the primary's offer. An emptied offer is deleted
    /// unless it has sold vouchers, and a duplicate schedule is deleted once
    /// nothing references it.
    pub async fn merge_duplicates(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
        mode: RunMode,
    ) -> EngineResult<Vec<Finding>> {
        let mut log = FindingLog::new(Pass::MergeDuplicates, campaign_id, mode);
        let schedules = self.repo.list_schedules(campaign_id).await?;

        for group in find_duplicate_schedules(&schedules) {
            let primary = &group.primary;
            let mut target: Option<Offer> = self.repo.offers_for_schedule(primary.id).await?.into_iter().next();

            for duplicate in &group.duplicates {
                let conflict = EngineError::ScheduleConflict {
                    campaign_id,
                    detail: format!("schedule {} duplicates {} on {}", duplicate.id, primary.id, group.window),
                };

                let offers = self.repo.offers_for_schedule(duplicate.id).await?;
                if offers.is_empty() {
                    log.push(
                        Some(duplicate.id),
                        conflict.to_string(),
                        Some(format!("delete schedule {}", duplicate.id)),
                    );
                }
                for offer in offers {
                    let status = rederive_status(offer.status, &primary.window, primary.publish_at, now);
                    log.push(
                        Some(offer.id),
                        conflict.to_string(),
                        Some(format!("repoint offer {} to schedule {}", offer.id, primary.id)),
                    );
                    if !mode.is_dry_run() {
                        self.repo.repoint_offer(offer.id, primary.id, primary.window, status).await?;
                    }

                    if target.is_none() {
                        target = Some(offer);
                        continue;
                    }
                    if let Some(merge_into) = &target {
                        self.fold_into(&mut log, &offer, merge_into, now, mode).await?;
                    }
                }

                if !mode.is_dry_run() && self.repo.delete_schedule_if_unreferenced(duplicate.id).await? {
                    info!(campaign_id = %campaign_id, schedule_id = %duplicate.id, "Deleted duplicate schedule");
                }
            }
        }
        Ok(log.findings)
    }

    async fn fold_into(
        &self,
        log: &mut FindingLog,
        offer: &Offer,
        target: &Offer,
        now: DateTime<Utc>,
        mode: RunMode,
    ) -> EngineResult<()> {
        let free: Vec<_> = self
            .repo
            .list_vouchers(offer.id)
            .await?
            .into_iter()
            .filter(|v| v.is_free())
            .collect();
        if !free.is_empty() {
            log.push(
                Some(offer.id),
                format!("offer {} holds {} free vouchers of a duplicate schedule", offer.id, free.len()),
                Some(format!("move {} vouchers to offer {}", free.len(), target.id)),
            );
        }
        if mode.is_dry_run() {
            return Ok(());
        }

        let moves: Vec<VoucherMove> = free
            .iter()
            .map(|v| VoucherMove {
                voucher_id: v.id,
                from_offer_id: offer.id,
                to_offer_id: target.id,
                actor_user_id: None,
                remarks: MERGE_REMARK.to_string(),
            })
            .collect();
        if !moves.is_empty() {
            let movements = self.repo.move_vouchers(&moves, None, now).await?;
            notify_moves(self.reindex.as_ref(), &movements).await;
            notify_offer(self.reindex.as_ref(), target.id, "merged").await;
        }

        match self.repo.delete_offer_if_unsold(offer.id, now).await? {
            Some(deleted) => {
                info!(offer_id = %offer.id, vouchers_deleted = deleted, "Deleted duplicate offer");
                notify_offer(self.reindex.as_ref(), offer.id, "deleted").await;
            }
            None => {
                info!(offer_id = %offer.id, "Kept duplicate offer with sold vouchers");
                notify_offer(self.reindex.as_ref(), offer.id, "repointed").await;
            }
        }
        Ok(())
    }

    /// Gives every active future schedule without an offer its offer.
    pub async fn repair_missing_offers(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
        mode: RunMode,
    ) -> EngineResult<Vec<Finding>> {
        let mut log = FindingLog::new(Pass::MissingOffers, campaign_id, mode);
        for schedule in self.repo.list_schedules(campaign_id).await? {
            if !schedule.is_active() || schedule.window.is_elapsed(now) {
                continue;
            }
            if !self.repo.offers_for_schedule(schedule.id).await?.is_empty() {
                continue;
            }
            log.push(
                Some(schedule.id),
                format!("schedule {} on {} has no offer", schedule.id, schedule.window),
                Some(format!("materialize {} vouchers", schedule.quantity)),
            );
            if !mode.is_dry_run() {
                self.materializer.materialize_schedule(&schedule, now).await?;
            }
        }
        Ok(log.findings)
    }

    /// Compares the owned count against the agreement quantity.
    pub async fn repair_budget_drift(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
        mode: RunMode,
    ) -> EngineResult<Vec<Finding>> {
        let mut log = FindingLog::new(Pass::BudgetDrift, campaign_id, mode);
        let campaign = self
            .repo
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| EngineError::not_found("campaign", campaign_id))?;
        let Some(agreement) = campaign.agreement_quantity else {
            return Ok(log.findings);
        };
        let tally = self.repo.campaign_tally(campaign_id).await?;

        if tally.owned > agreement {
            let action = self
                .config
                .auto_correct_budget
                .then(|| format!("set agreement quantity to {}", tally.owned));
            log.push(
                Some(campaign_id),
                format!("owned {} exceeds agreement quantity {}", tally.owned, agreement),
                action.clone(),
            );
            if action.is_some() && !mode.is_dry_run() {
                self.repo
                    .update_agreement_quantity(campaign_id, Some(tally.owned), now)
                    .await?;
            }
            return Ok(log.findings);
        }

        let schedules = self.repo.list_schedules(campaign_id).await?;
        let all_elapsed = !schedules.is_empty() && schedules.iter().all(|s| s.window.is_elapsed(now));
        if all_elapsed && tally.live() != agreement {
            log.push(
                Some(campaign_id),
                format!(
                    "live vouchers {} (owned {}, free {}, held {}) differ from agreement quantity {}",
                    tally.live(),
                    tally.owned,
                    tally.free,
                    tally.held,
                    agreement
                ),
                None,
            );
        }
        Ok(log.findings)
    }

    /// Offers whose schedule is gone get one back: a stored schedule with the
    /// same window if one is free, otherwise a schedule rebuilt from the
    /// offer itself.
    pub async fn fix_orphaned_offers(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
        mode: RunMode,
    ) -> EngineResult<Vec<Finding>> {
        let mut log = FindingLog::new(Pass::OrphanedOffers, campaign_id, mode);
        let mut schedules = self.repo.list_schedules(campaign_id).await?;
        let known: HashSet<Uuid> = schedules.iter().map(|s| s.id).collect();

        let mut claimed: HashSet<Uuid> = HashSet::new();
        for schedule in &schedules {
            if !self.repo.offers_for_schedule(schedule.id).await?.is_empty() {
                claimed.insert(schedule.id);
            }
        }

        for offer in self.repo.list_offers(campaign_id).await? {
            if known.contains(&offer.schedule_id) {
                continue;
            }
            let orphan = EngineError::OrphanedReference(format!(
                "offer {} references missing schedule {}",
                offer.id, offer.schedule_id
            ));

            let reusable = schedules
                .iter()
                .find(|s| s.window == offer.window && s.is_active() && !claimed.contains(&s.id))
                .cloned();
            match reusable {
                Some(schedule) => {
                    log.push(
                        Some(offer.id),
                        orphan.to_string(),
                        Some(format!("repoint to schedule {}", schedule.id)),
                    );
                    if !mode.is_dry_run() {
                        let status = rederive_status(offer.status, &schedule.window, schedule.publish_at, now);
                        self.repo.repoint_offer(offer.id, schedule.id, schedule.window, status).await?;
                    }
                    claimed.insert(schedule.id);
                }
                None => {
                    let mut schedule = Schedule::new(campaign_id, offer.window, offer.quantity, now);
                    schedule.publish_at = offer.publish_at;
                    schedule.status = offer.status;
                    log.push(
                        Some(offer.id),
                        orphan.to_string(),
                        Some(format!("recreate schedule {} from offer window", schedule.id)),
                    );
                    if !mode.is_dry_run() {
                        self.repo.insert_schedule(&schedule).await?;
                        self.repo
                            .repoint_offer(offer.id, schedule.id, schedule.window, offer.status)
                            .await?;
                    }
                    claimed.insert(schedule.id);
                    schedules.push(schedule);
                }
            }
            if !mode.is_dry_run() {
                notify_offer(self.reindex.as_ref(), offer.id, "orphan_fixed").await;
            }
        }
        Ok(log.findings)
    }

    /// Report-only audit of the voucher ledger.
    pub async fn audit_conservation(&self, campaign_id: Uuid) -> EngineResult<Vec<Finding>> {
        let mut log = FindingLog::new(Pass::Conservation, campaign_id, RunMode::DryRun);
        let offers: HashSet<Uuid> = self
            .repo
            .list_offers(campaign_id)
            .await?
            .into_iter()
            .map(|o| o.id)
            .collect();

        let mut last_move: HashMap<Uuid, Uuid> = HashMap::new();
        let mut movements = self.repo.list_movements(campaign_id).await?;
        movements.sort_by_key(|m| m.created_at);
        for movement in movements {
            last_move.insert(movement.voucher_id, movement.to_offer_id);
        }

        for voucher in self.repo.list_campaign_vouchers(campaign_id).await? {
            if !offers.contains(&voucher.merchant_offer_id) {
                log.push(
                    Some(voucher.id),
                    format!("voucher {} sits in missing offer {}", voucher.id, voucher.merchant_offer_id),
                    None,
                );
            }
            if let Some(to_offer_id) = last_move.get(&voucher.id) {
                if *to_offer_id != voucher.merchant_offer_id {
                    log.push(
                        Some(voucher.id),
                        format!(
                            "voucher {} is in offer {} but its last movement went to {}",
                            voucher.id, voucher.merchant_offer_id, to_offer_id
                        ),
                        None,
                    );
                }
            }
            if let Some(claim_id) = voucher.held_by_claim_id {
                let pending = self
                    .repo
                    .get_claim(claim_id)
                    .await?
                    .is_some_and(|c| c.status == tally_core::ClaimStatus::AwaitPayment);
                if !pending {
                    log.push(
                        Some(voucher.id),
                        format!("voucher {} is held by claim {} which is not pending", voucher.id, claim_id),
                        None,
                    );
                }
            }
        }
        Ok(log.findings)
    }
}
