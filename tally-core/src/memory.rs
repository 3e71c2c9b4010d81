//! In-memory `InventoryRepository`.
//!
//! A single async mutex plays the part of the database transaction: every
//! method validates first and mutates only once nothing can fail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::invariants::{check_budget, ensure_claimable, ensure_movable, may_release, CampaignTally};
use crate::models::{
    Campaign, Claim, ClaimStatus, Offer, OfferStatus, Schedule, Transaction, TransactionStatus,
    Voucher, VoucherMovement, Window,
};
use crate::repository::{BudgetGuard, ClaimRequest, InventoryRepository, ReleaseOutcome, VoucherMove};

#[derive(Default)]
struct State {
    campaigns: Vec<Campaign>,
    schedules: Vec<Schedule>,
    offers: Vec<Offer>,
    vouchers: Vec<Voucher>,
    movements: Vec<VoucherMovement>,
    claims: Vec<Claim>,
    transactions: Vec<Transaction>,
    deleted_vouchers: HashMap<Uuid, i64>,
}

impl State {
    fn campaign(&self, id: Uuid) -> EngineResult<&Campaign> {
        self.campaigns
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::not_found("campaign", id))
    }

    fn offer(&self, id: Uuid) -> EngineResult<&Offer> {
        self.offers
            .iter()
            .find(|o| o.id == id)
            .ok_or_else(|| EngineError::not_found("offer", id))
    }

    fn offer_mut(&mut self, id: Uuid) -> EngineResult<&mut Offer> {
        self.offers
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| EngineError::not_found("offer", id))
    }

    fn voucher(&self, id: Uuid) -> EngineResult<&Voucher> {
        self.vouchers
            .iter()
            .find(|v| v.id == id)
            .ok_or_else(|| EngineError::not_found("voucher", id))
    }

    fn voucher_mut(&mut self, id: Uuid) -> EngineResult<&mut Voucher> {
        self.vouchers
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| EngineError::not_found("voucher", id))
    }

    fn claim_index(&self, id: Uuid) -> EngineResult<usize> {
        self.claims
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| EngineError::not_found("claim", id))
    }

    fn transaction_mut(&mut self, id: Uuid) -> EngineResult<&mut Transaction> {
        self.transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| EngineError::not_found("transaction", id))
    }

    fn owned_count(&self, campaign_id: Uuid) -> i64 {
        self.vouchers
            .iter()
            .filter(|v| v.campaign_id == campaign_id && v.is_owned())
            .count() as i64
    }
}

#[derive(Default)]
pub struct InMemoryInventory {
    state: Mutex<State>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes a schedule even while offers still point at it, the way a
    /// hand-edited table can end up. Reconciliation repairs the fallout.
    pub async fn purge_schedule(&self, schedule_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let before = state.schedules.len();
        state.schedules.retain(|s| s.id != schedule_id);
        state.schedules.len() < before
    }
}

#[async_trait]
impl InventoryRepository for InMemoryInventory {
    async fn insert_campaign(&self, campaign: &Campaign) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        if state.campaigns.iter().any(|c| c.id == campaign.id || c.sku == campaign.sku) {
            return Err(EngineError::Validation(format!("campaign {} already exists", campaign.sku)));
        }
        state.campaigns.push(campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> EngineResult<Option<Campaign>> {
        let state = self.state.lock().await;
        Ok(state.campaigns.iter().find(|c| c.id == id).cloned())
    }

    async fn find_campaign_by_sku(&self, sku: &str) -> EngineResult<Option<Campaign>> {
        let state = self.state.lock().await;
        Ok(state.campaigns.iter().find(|c| c.sku == sku).cloned())
    }

    async fn list_campaigns(&self) -> EngineResult<Vec<Campaign>> {
        let state = self.state.lock().await;
        let mut campaigns = state.campaigns.clone();
        campaigns.sort_by_key(|c| c.created_at);
        Ok(campaigns)
    }

    async fn update_agreement_quantity(
        &self,
        campaign_id: Uuid,
        agreement_quantity: Option<i64>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let campaign = state
            .campaigns
            .iter_mut()
            .find(|c| c.id == campaign_id)
            .ok_or_else(|| EngineError::not_found("campaign", campaign_id))?;
        campaign.agreement_quantity = agreement_quantity;
        campaign.updated_at = now;
        Ok(())
    }

    async fn insert_schedule(&self, schedule: &Schedule) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.campaign(schedule.campaign_id)?;
        state.schedules.push(schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> EngineResult<Option<Schedule>> {
        let state = self.state.lock().await;
        Ok(state.schedules.iter().find(|s| s.id == id).cloned())
    }

    async fn list_schedules(&self, campaign_id: Uuid) -> EngineResult<Vec<Schedule>> {
        let state = self.state.lock().await;
        let mut schedules: Vec<Schedule> = state
            .schedules
            .iter()
            .filter(|s| s.campaign_id == campaign_id)
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(schedules)
    }

    async fn latest_schedule_end(&self, campaign_id: Uuid) -> EngineResult<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state
            .schedules
            .iter()
            .filter(|s| s.campaign_id == campaign_id)
            .map(|s| s.window.available_until)
            .max())
    }

    async fn set_schedule_status(&self, schedule_id: Uuid, status: OfferStatus) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let schedule = state
            .schedules
            .iter_mut()
            .find(|s| s.id == schedule_id)
            .ok_or_else(|| EngineError::not_found("schedule", schedule_id))?;
        schedule.status = schedule.status.transition(status)?;
        Ok(())
    }

    async fn delete_schedule_if_unreferenced(&self, schedule_id: Uuid) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        if state.offers.iter().any(|o| o.schedule_id == schedule_id) {
            return Ok(false);
        }
        let before = state.schedules.len();
        state.schedules.retain(|s| s.id != schedule_id);
        Ok(state.schedules.len() < before)
    }

    async fn get_offer(&self, id: Uuid) -> EngineResult<Option<Offer>> {
        let state = self.state.lock().await;
        Ok(state.offers.iter().find(|o| o.id == id).cloned())
    }

    async fn list_offers(&self, campaign_id: Uuid) -> EngineResult<Vec<Offer>> {
        let state = self.state.lock().await;
        let mut offers: Vec<Offer> = state
            .offers
            .iter()
            .filter(|o| o.campaign_id == campaign_id)
            .cloned()
            .collect();
        offers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(offers)
    }

    async fn offers_for_schedule(&self, schedule_id: Uuid) -> EngineResult<Vec<Offer>> {
        let state = self.state.lock().await;
        Ok(state
            .offers
            .iter()
            .filter(|o| o.schedule_id == schedule_id)
            .cloned()
            .collect())
    }

    async fn materialize_offer(&self, offer: &Offer, vouchers: &[Voucher]) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        if !state.schedules.iter().any(|s| s.id == offer.schedule_id) {
            return Err(EngineError::OrphanedReference(format!(
                "offer {} references missing schedule {}",
                offer.id, offer.schedule_id
            )));
        }
        if state.offers.iter().any(|o| o.schedule_id == offer.schedule_id) {
            return Err(EngineError::AlreadyMaterialized(offer.schedule_id));
        }

        let existing: HashSet<&str> = state.vouchers.iter().map(|v| v.code.as_str()).collect();
        let mut batch = HashSet::new();
        for voucher in vouchers {
            if voucher.merchant_offer_id != offer.id || voucher.campaign_id != offer.campaign_id {
                return Err(EngineError::Validation(format!(
                    "voucher {} does not belong to offer {}",
                    voucher.id, offer.id
                )));
            }
            if existing.contains(voucher.code.as_str()) || !batch.insert(voucher.code.as_str()) {
                return Err(EngineError::DuplicateCode(voucher.code.clone()));
            }
        }

        state.offers.push(offer.clone());
        state.vouchers.extend(vouchers.iter().cloned());
        Ok(())
    }

    async fn update_offer_status(&self, offer_id: Uuid, status: OfferStatus) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let offer = state.offer_mut(offer_id)?;
        offer.status = offer.status.transition(status)?;
        Ok(())
    }

    async fn repoint_offer(
        &self,
        offer_id: Uuid,
        schedule_id: Uuid,
        window: Window,
        status: OfferStatus,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        if !state.schedules.iter().any(|s| s.id == schedule_id) {
            return Err(EngineError::not_found("schedule", schedule_id));
        }
        let offer = state.offer_mut(offer_id)?;
        let status = offer.status.transition(status)?;
        offer.schedule_id = schedule_id;
        offer.window = window;
        offer.status = status;
        Ok(())
    }

    async fn delete_offer_if_unsold(&self, offer_id: Uuid, _now: DateTime<Utc>) -> EngineResult<Option<i64>> {
        let mut state = self.state.lock().await;
        let campaign_id = state.offer(offer_id)?.campaign_id;
        let blocked = state
            .vouchers
            .iter()
            .any(|v| v.merchant_offer_id == offer_id && !v.is_free());
        let pending = state
            .claims
            .iter()
            .any(|c| c.offer_id == offer_id && c.status == ClaimStatus::AwaitPayment);
        if blocked || pending {
            return Ok(None);
        }

        let before = state.vouchers.len();
        state.vouchers.retain(|v| v.merchant_offer_id != offer_id);
        let deleted = (before - state.vouchers.len()) as i64;
        *state.deleted_vouchers.entry(campaign_id).or_insert(0) += deleted;
        state.offers.retain(|o| o.id != offer_id);
        Ok(Some(deleted))
    }

    async fn get_voucher(&self, id: Uuid) -> EngineResult<Option<Voucher>> {
        let state = self.state.lock().await;
        Ok(state.vouchers.iter().find(|v| v.id == id).cloned())
    }

    async fn list_vouchers(&self, offer_id: Uuid) -> EngineResult<Vec<Voucher>> {
        let state = self.state.lock().await;
        Ok(state
            .vouchers
            .iter()
            .filter(|v| v.merchant_offer_id == offer_id)
            .cloned()
            .collect())
    }

    async fn list_campaign_vouchers(&self, campaign_id: Uuid) -> EngineResult<Vec<Voucher>> {
        let state = self.state.lock().await;
        Ok(state
            .vouchers
            .iter()
            .filter(|v| v.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn campaign_tally(&self, campaign_id: Uuid) -> EngineResult<CampaignTally> {
        let state = self.state.lock().await;
        let deleted = state.deleted_vouchers.get(&campaign_id).copied().unwrap_or(0);
        Ok(CampaignTally::from_vouchers(
            state.vouchers.iter().filter(|v| v.campaign_id == campaign_id),
            deleted,
        ))
    }

    async fn free_vouchers_in_elapsed_offers(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<Voucher>> {
        let state = self.state.lock().await;
        let elapsed: HashSet<Uuid> = state
            .offers
            .iter()
            .filter(|o| o.campaign_id == campaign_id && o.window.is_elapsed(now))
            .map(|o| o.id)
            .collect();
        Ok(state
            .vouchers
            .iter()
            .filter(|v| v.is_free() && elapsed.contains(&v.merchant_offer_id))
            .cloned()
            .collect())
    }

    async fn move_vouchers(
        &self,
        moves: &[VoucherMove],
        guard: Option<BudgetGuard>,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<VoucherMovement>> {
        let mut state = self.state.lock().await;

        if let Some(guard) = guard {
            let agreement = state.campaign(guard.campaign_id)?.agreement_quantity;
            check_budget(guard.campaign_id, agreement, state.owned_count(guard.campaign_id), guard.requested)?;
        }

        let mut seen = HashSet::new();
        for mv in moves {
            if !seen.insert(mv.voucher_id) {
                return Err(EngineError::Validation(format!("voucher {} listed twice", mv.voucher_id)));
            }
            let voucher = state.voucher(mv.voucher_id)?;
            ensure_movable(voucher, mv.from_offer_id, mv.to_offer_id)?;
            let target = state.offer(mv.to_offer_id)?;
            if target.campaign_id != voucher.campaign_id {
                return Err(EngineError::Validation(format!(
                    "offer {} belongs to another campaign than voucher {}",
                    target.id, voucher.id
                )));
            }
        }

        let mut movements = Vec::with_capacity(moves.len());
        for mv in moves {
            state.voucher_mut(mv.voucher_id)?.merchant_offer_id = mv.to_offer_id;
            if let Ok(source) = state.offer_mut(mv.from_offer_id) {
                source.remaining_quantity = (source.remaining_quantity - 1).max(0);
            }
            state.offer_mut(mv.to_offer_id)?.remaining_quantity += 1;

            let movement = VoucherMovement {
                id: Uuid::new_v4(),
                voucher_id: mv.voucher_id,
                from_offer_id: mv.from_offer_id,
                to_offer_id: mv.to_offer_id,
                actor_user_id: mv.actor_user_id,
                remarks: mv.remarks.clone(),
                created_at: now,
            };
            state.movements.push(movement.clone());
            movements.push(movement);
        }
        Ok(movements)
    }

    async fn list_movements(&self, campaign_id: Uuid) -> EngineResult<Vec<VoucherMovement>> {
        let state = self.state.lock().await;
        let vouchers: HashSet<Uuid> = state
            .vouchers
            .iter()
            .filter(|v| v.campaign_id == campaign_id)
            .map(|v| v.id)
            .collect();
        let offers: HashSet<Uuid> = state
            .offers
            .iter()
            .filter(|o| o.campaign_id == campaign_id)
            .map(|o| o.id)
            .collect();
        Ok(state
            .movements
            .iter()
            .filter(|m| vouchers.contains(&m.voucher_id) || offers.contains(&m.to_offer_id))
            .cloned()
            .collect())
    }

    async fn reserve_vouchers(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<(Claim, Transaction)> {
        let mut state = self.state.lock().await;
        let offer = state.offer(request.offer_id)?.clone();
        ensure_claimable(&offer, request.quantity, now)?;

        let picked: Vec<Uuid> = state
            .vouchers
            .iter()
            .filter(|v| v.merchant_offer_id == offer.id && v.is_free())
            .take(request.quantity as usize)
            .map(|v| v.id)
            .collect();
        if (picked.len() as i64) < request.quantity {
            return Err(EngineError::OutOfStock {
                offer_id: offer.id,
                requested: request.quantity,
                available: picked.len() as i64,
            });
        }

        let claim = Claim {
            id: Uuid::new_v4(),
            offer_id: offer.id,
            campaign_id: offer.campaign_id,
            user_id: request.user_id,
            transaction_id: Uuid::new_v4(),
            voucher_ids: picked.clone(),
            quantity: request.quantity,
            status: ClaimStatus::AwaitPayment,
            created_at: now,
            updated_at: now,
        };
        let transaction = Transaction {
            id: claim.transaction_id,
            claim_id: claim.id,
            user_id: request.user_id,
            amount_cents: request.amount_cents,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        for voucher_id in &picked {
            state.voucher_mut(*voucher_id)?.held_by_claim_id = Some(claim.id);
        }
        let offer = state.offer_mut(offer.id)?;
        offer.remaining_quantity = (offer.remaining_quantity - request.quantity).max(0);
        state.claims.push(claim.clone());
        state.transactions.push(transaction.clone());
        Ok((claim, transaction))
    }

    async fn get_claim(&self, id: Uuid) -> EngineResult<Option<Claim>> {
        let state = self.state.lock().await;
        Ok(state.claims.iter().find(|c| c.id == id).cloned())
    }

    async fn get_transaction(&self, id: Uuid) -> EngineResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn confirm_claim(&self, claim_id: Uuid, now: DateTime<Utc>) -> EngineResult<Claim> {
        let mut state = self.state.lock().await;
        let index = state.claim_index(claim_id)?;
        let claim = state.claims[index].clone();
        if claim.status == ClaimStatus::Success {
            return Ok(claim);
        }
        claim.status.transition(ClaimStatus::Success)?;

        for voucher_id in &claim.voucher_ids {
            let voucher = state.voucher(*voucher_id)?;
            if voucher.is_owned() || voucher.held_by_claim_id != Some(claim.id) {
                return Err(EngineError::Validation(format!(
                    "voucher {} is no longer held by claim {}",
                    voucher.id, claim.id
                )));
            }
        }

        for voucher_id in &claim.voucher_ids {
            let voucher = state.voucher_mut(*voucher_id)?;
            voucher.owned_by_id = Some(claim.user_id);
            voucher.owned_at = Some(now);
            voucher.held_by_claim_id = None;
        }
        let transaction = state.transaction_mut(claim.transaction_id)?;
        transaction.status = transaction.status.transition(TransactionStatus::Success)?;
        transaction.updated_at = now;

        let stored = &mut state.claims[index];
        stored.status = ClaimStatus::Success;
        stored.updated_at = now;
        Ok(stored.clone())
    }

    async fn release_claim(&self, claim_id: Uuid, now: DateTime<Utc>) -> EngineResult<ReleaseOutcome> {
        let mut state = self.state.lock().await;
        let index = state.claim_index(claim_id)?;
        let claim = state.claims[index].clone();
        if claim.status == ClaimStatus::Failed {
            return Ok(ReleaseOutcome {
                claim,
                freed: 0,
                already_released: true,
            });
        }
        claim.status.transition(ClaimStatus::Failed)?;

        let mut releasable = Vec::new();
        for voucher_id in &claim.voucher_ids {
            let voucher = state.voucher(*voucher_id)?;
            if may_release(voucher, &claim, &state.claims) {
                releasable.push(*voucher_id);
            }
        }

        for voucher_id in &releasable {
            state.voucher_mut(*voucher_id)?.held_by_claim_id = None;
        }
        let freed = releasable.len() as i64;
        if let Ok(offer) = state.offer_mut(claim.offer_id) {
            offer.remaining_quantity += freed;
        }
        if let Ok(transaction) = state.transaction_mut(claim.transaction_id) {
            transaction.status = transaction.status.transition(TransactionStatus::Failed)?;
            transaction.updated_at = now;
        }

        let stored = &mut state.claims[index];
        stored.status = ClaimStatus::Failed;
        stored.updated_at = now;
        Ok(ReleaseOutcome {
            claim: stored.clone(),
            freed,
            already_released: false,
        })
    }

    async fn list_pending_claims_before(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Claim>> {
        let state = self.state.lock().await;
        let mut claims: Vec<Claim> = state
            .claims
            .iter()
            .filter(|c| c.status == ClaimStatus::AwaitPayment && c.created_at < cutoff)
            .cloned()
            .collect();
        claims.sort_by_key(|c| c.created_at);
        Ok(claims)
    }

    async fn pending_claim_count(&self, offer_id: Uuid) -> EngineResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .claims
            .iter()
            .filter(|c| c.offer_id == offer_id && c.status == ClaimStatus::AwaitPayment)
            .count() as i64)
    }
}
