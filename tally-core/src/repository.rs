use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::invariants::CampaignTally;
use crate::models::{
    Campaign, Claim, Offer, OfferStatus, Schedule, Transaction, Voucher, VoucherMovement, Window,
};

/// One requested change of a voucher's owning offer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoucherMove {
    pub voucher_id: Uuid,
    pub from_offer_id: Uuid,
    pub to_offer_id: Uuid,
    pub actor_user_id: Option<Uuid>,
    pub remarks: String,
}

/// Budget check evaluated under the campaign row lock, inside the same
/// atomic unit as the moves it guards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BudgetGuard {
    pub campaign_id: Uuid,
    pub requested: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimRequest {
    pub offer_id: Uuid,
    pub user_id: Uuid,
    pub quantity: i64,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseOutcome {
    pub claim: Claim,
    /// Vouchers handed back to the free pool by this call.
    pub freed: i64,
    /// True when the claim had already failed before this call.
    pub already_released: bool,
}

/// Persistence boundary of the engine.
///
/// Methods documented as atomic must either apply completely or not at all;
/// the Postgres implementation wraps each in one database transaction with
/// row locks, the in-memory implementation holds its state lock throughout.
#[async_trait]
pub trait InventoryRepository: Send + Sync {
    // Campaigns

    async fn insert_campaign(&self, campaign: &Campaign) -> EngineResult<()>;

    async fn get_campaign(&self, id: Uuid) -> EngineResult<Option<Campaign>>;

    async fn find_campaign_by_sku(&self, sku: &str) -> EngineResult<Option<Campaign>>;

    async fn list_campaigns(&self) -> EngineResult<Vec<Campaign>>;

    async fn update_agreement_quantity(
        &self,
        campaign_id: Uuid,
        agreement_quantity: Option<i64>,
        now: DateTime<Utc>,
    ) -> EngineResult<()>;

    // Schedules

    async fn insert_schedule(&self, schedule: &Schedule) -> EngineResult<()>;

    async fn get_schedule(&self, id: Uuid) -> EngineResult<Option<Schedule>>;

    /// Ordered by `created_at`, then id.
    async fn list_schedules(&self, campaign_id: Uuid) -> EngineResult<Vec<Schedule>>;

    async fn latest_schedule_end(&self, campaign_id: Uuid) -> EngineResult<Option<DateTime<Utc>>>;

    async fn set_schedule_status(&self, schedule_id: Uuid, status: OfferStatus) -> EngineResult<()>;

    /// Atomic. Deletes the schedule only when no offer references it.
    async fn delete_schedule_if_unreferenced(&self, schedule_id: Uuid) -> EngineResult<bool>;

    // Offers

    async fn get_offer(&self, id: Uuid) -> EngineResult<Option<Offer>>;

    /// Ordered by `created_at`, then id.
    async fn list_offers(&self, campaign_id: Uuid) -> EngineResult<Vec<Offer>>;

    async fn offers_for_schedule(&self, schedule_id: Uuid) -> EngineResult<Vec<Offer>>;

    /// Atomic. Inserts the offer and its voucher batch; fails with
    /// `AlreadyMaterialized` when the schedule already has an offer.
    async fn materialize_offer(&self, offer: &Offer, vouchers: &[Voucher]) -> EngineResult<()>;

    async fn update_offer_status(&self, offer_id: Uuid, status: OfferStatus) -> EngineResult<()>;

    /// Points an offer at another schedule and copies that schedule's window.
    async fn repoint_offer(
        &self,
        offer_id: Uuid,
        schedule_id: Uuid,
        window: Window,
        status: OfferStatus,
    ) -> EngineResult<()>;

    /// Atomic. Deletes the offer when none of its vouchers is owned or held,
    /// together with its remaining never-owned vouchers (recorded as
    /// deletions). Returns the number of vouchers deleted, or `None` when
    /// the offer was kept.
    async fn delete_offer_if_unsold(&self, offer_id: Uuid, now: DateTime<Utc>) -> EngineResult<Option<i64>>;

    // Vouchers

    async fn get_voucher(&self, id: Uuid) -> EngineResult<Option<Voucher>>;

    async fn list_vouchers(&self, offer_id: Uuid) -> EngineResult<Vec<Voucher>>;

    async fn list_campaign_vouchers(&self, campaign_id: Uuid) -> EngineResult<Vec<Voucher>>;

    async fn campaign_tally(&self, campaign_id: Uuid) -> EngineResult<CampaignTally>;

    /// Free vouchers whose current offer's window has elapsed at `now`.
    async fn free_vouchers_in_elapsed_offers(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<Voucher>>;

    /// Atomic. The single path that changes `merchant_offer_id`: every move
    /// is validated, applied and logged, or none is.
    async fn move_vouchers(
        &self,
        moves: &[VoucherMove],
        guard: Option<BudgetGuard>,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<VoucherMovement>>;

    async fn list_movements(&self, campaign_id: Uuid) -> EngineResult<Vec<VoucherMovement>>;

    // Claims

    /// Atomic. Locks `quantity` free vouchers of the offer, holds them for a
    /// new claim and opens its pending transaction.
    async fn reserve_vouchers(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<(Claim, Transaction)>;

    async fn get_claim(&self, id: Uuid) -> EngineResult<Option<Claim>>;

    async fn get_transaction(&self, id: Uuid) -> EngineResult<Option<Transaction>>;

    /// Atomic. Marks the claim and its transaction successful and makes the
    /// held vouchers owned.
    async fn confirm_claim(&self, claim_id: Uuid, now: DateTime<Utc>) -> EngineResult<Claim>;

    /// Atomic. Marks the claim failed and frees whatever `may_release`
    /// allows. Idempotent.
    async fn release_claim(&self, claim_id: Uuid, now: DateTime<Utc>) -> EngineResult<ReleaseOutcome>;

    /// Pending claims created before `cutoff`, oldest first.
    async fn list_pending_claims_before(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Claim>>;

    async fn pending_claim_count(&self, offer_id: Uuid) -> EngineResult<i64>;
}
