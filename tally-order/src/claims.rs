use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use tally_core::{
    Claim, ClaimRequest, EngineError, EngineResult, InventoryRepository, ReindexSink, ReleaseOutcome,
    Transaction, TransactionStatus,
};
use tally_offer::OfferLifecycle;

/// Reservation boundary between buyers and the voucher pool.
pub struct ClaimManager {
    repo: Arc<dyn InventoryRepository>,
    lifecycle: Arc<OfferLifecycle>,
    reindex: Arc<dyn ReindexSink>,
}

impl ClaimManager {
    pub fn new(
        repo: Arc<dyn InventoryRepository>,
        lifecycle: Arc<OfferLifecycle>,
        reindex: Arc<dyn ReindexSink>,
    ) -> Self {
        Self {
            repo,
            lifecycle,
            reindex,
        }
    }

    /// Holds `quantity` free vouchers of the offer for `user_id` and opens the
    /// pending transaction. Never reserves fewer than asked.
    pub async fn claim(
        &self,
        offer_id: Uuid,
        user_id: Uuid,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<(Claim, Transaction)> {
        let offer = self
            .repo
            .get_offer(offer_id)
            .await?
            .ok_or_else(|| EngineError::not_found("offer", offer_id))?;
        let unit_price = offer.discounted_price_cents.unwrap_or(offer.price_cents);
        // A total that does not fit in i64 is far past any stock the offer holds.
        let amount_cents = unit_price.checked_mul(quantity).ok_or(EngineError::OutOfStock {
            offer_id,
            requested: quantity,
            available: offer.remaining_quantity,
        })?;
        let request = ClaimRequest {
            offer_id,
            user_id,
            quantity,
            amount_cents,
        };

        match self.repo.reserve_vouchers(&request, now).await {
            Ok((claim, transaction)) => {
                info!(
                    claim_id = %claim.id,
                    offer_id = %offer_id,
                    quantity,
                    "Vouchers reserved"
                );
                self.signal(offer_id, "claimed").await;
                Ok((claim, transaction))
            }
            Err(e @ EngineError::OutOfStock { .. }) => {
                warn!(offer_id = %offer_id, user_id = %user_id, "{}", e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Payment succeeded: vouchers become owned for good.
    pub async fn confirm(&self, claim_id: Uuid, now: DateTime<Utc>) -> EngineResult<Claim> {
        let claim = self.repo.confirm_claim(claim_id, now).await?;
        info!(claim_id = %claim.id, offer_id = %claim.offer_id, "Claim confirmed");
        if let Err(e) = self.lifecycle.sync_offer(claim.offer_id, now).await {
            warn!(offer_id = %claim.offer_id, "Status sync after confirm failed: {}", e);
        }
        Ok(claim)
    }

    /// Payment failed or timed out. Safe to call repeatedly.
    pub async fn release(&self, claim_id: Uuid, now: DateTime<Utc>) -> EngineResult<ReleaseOutcome> {
        let outcome = self.repo.release_claim(claim_id, now).await?;
        if !outcome.already_released {
            info!(
                claim_id = %claim_id,
                offer_id = %outcome.claim.offer_id,
                freed = outcome.freed,
                "Claim released"
            );
        }
        if outcome.freed > 0 {
            self.signal(outcome.claim.offer_id, "released").await;
        }
        Ok(outcome)
    }

    /// Reacts to a payment gateway status for the claim's transaction.
    pub async fn on_transaction_status(
        &self,
        transaction_id: Uuid,
        status: TransactionStatus,
        now: DateTime<Utc>,
    ) -> EngineResult<Claim> {
        let transaction = self
            .repo
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| EngineError::not_found("transaction", transaction_id))?;

        match status {
            TransactionStatus::Success => self.confirm(transaction.claim_id, now).await,
            TransactionStatus::Failed => Ok(self.release(transaction.claim_id, now).await?.claim),
            TransactionStatus::Pending => self
                .repo
                .get_claim(transaction.claim_id)
                .await?
                .ok_or_else(|| EngineError::not_found("claim", transaction.claim_id)),
        }
    }

    async fn signal(&self, offer_id: Uuid, reason: &str) {
        if let Err(e) = self.reindex.offer_changed(offer_id, reason).await {
            warn!(offer_id = %offer_id, "Reindex signal failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{day, Fixture};
    use std::collections::HashSet;
    use tally_core::{ClaimStatus, OfferStatus};

    #[tokio::test]
    async fn test_claim_confirm_makes_vouchers_owned() {
        let f = Fixture::new(2).await;
        let user = Uuid::new_v4();

        let (claim, transaction) = f.claims.claim(f.offer.id, user, 2, day(1)).await.unwrap();
        assert_eq!(claim.status, ClaimStatus::AwaitPayment);
        assert_eq!(transaction.amount_cents, 2 * 1500);

        let confirmed = f.claims.confirm(claim.id, day(1)).await.unwrap();
        assert_eq!(confirmed.status, ClaimStatus::Success);
        let vouchers = f.repo.list_vouchers(f.offer.id).await.unwrap();
        assert!(vouchers.iter().all(|v| v.owned_by_id == Some(user)));

        // Sold out offers archive themselves.
        let offer = f.repo.get_offer(f.offer.id).await.unwrap().unwrap();
        assert_eq!(offer.status, OfferStatus::Archived);

        let again = f.claims.confirm(claim.id, day(1)).await.unwrap();
        assert_eq!(again.status, ClaimStatus::Success);
    }

    #[tokio::test]
    async fn test_claim_beyond_stock_is_rejected_whole() {
        let f = Fixture::new(3).await;
        let err = f.claims.claim(f.offer.id, Uuid::new_v4(), 4, day(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::OutOfStock { requested: 4, available: 3, .. }));
        assert_eq!(f.repo.campaign_tally(f.offer.campaign_id).await.unwrap().free, 3);
    }

    #[tokio::test]
    async fn test_overflowing_quantity_is_out_of_stock() {
        let f = Fixture::new(3).await;
        let err = f
            .claims
            .claim(f.offer.id, Uuid::new_v4(), i64::MAX / 1000, day(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OutOfStock { available: 3, .. }));
        assert_eq!(f.repo.campaign_tally(f.offer.campaign_id).await.unwrap().free, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_buyers_split_last_vouchers() {
        const STOCK: i64 = 3;
        const BUYERS: usize = 12;
        let f = Fixture::new(STOCK).await;

        let mut handles = Vec::with_capacity(BUYERS);
        for _ in 0..BUYERS {
            let claims = f.claims.clone();
            let offer_id = f.offer.id;
            handles.push(tokio::spawn(async move {
                claims.claim(offer_id, Uuid::new_v4(), 1, day(1)).await
            }));
        }

        let mut won = Vec::new();
        let mut sold_out = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok((claim, _)) => won.push(claim),
                Err(EngineError::OutOfStock { .. }) => sold_out += 1,
                Err(e) => panic!("unexpected claim error: {}", e),
            }
        }
        assert_eq!(won.len() as i64, STOCK);
        assert_eq!(sold_out, BUYERS - STOCK as usize);

        let held: Vec<Uuid> = won.iter().flat_map(|c| c.voucher_ids.iter().copied()).collect();
        let distinct: HashSet<Uuid> = held.iter().copied().collect();
        assert_eq!(distinct.len(), held.len());

        let tally = f.repo.campaign_tally(f.offer.campaign_id).await.unwrap();
        assert_eq!(tally.held, STOCK);
        assert_eq!(tally.free, 0);
        let offer = f.repo.get_offer(f.offer.id).await.unwrap().unwrap();
        assert_eq!(offer.remaining_quantity, 0);
    }

    #[tokio::test]
    async fn test_release_restores_stock_once() {
        let f = Fixture::new(3).await;
        let (claim, _) = f.claims.claim(f.offer.id, Uuid::new_v4(), 2, day(1)).await.unwrap();

        let first = f.claims.release(claim.id, day(1)).await.unwrap();
        assert_eq!(first.freed, 2);
        let second = f.claims.release(claim.id, day(1)).await.unwrap();
        assert!(second.already_released);
        assert_eq!(second.freed, 0);

        let offer = f.repo.get_offer(f.offer.id).await.unwrap().unwrap();
        assert_eq!(offer.remaining_quantity, 3);
    }

    #[tokio::test]
    async fn test_late_confirm_after_release_rejected() {
        let f = Fixture::new(1).await;
        let (claim, _) = f.claims.claim(f.offer.id, Uuid::new_v4(), 1, day(1)).await.unwrap();
        f.claims.release(claim.id, day(1)).await.unwrap();

        let err = f.claims.confirm(claim.id, day(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { entity: "claim", .. }));
        assert!(f.repo.list_vouchers(f.offer.id).await.unwrap()[0].is_free());
    }

    #[tokio::test]
    async fn test_gateway_status_drives_claim() {
        let f = Fixture::new(2).await;
        let (paid, paid_tx) = f.claims.claim(f.offer.id, Uuid::new_v4(), 1, day(1)).await.unwrap();
        let (lost, lost_tx) = f.claims.claim(f.offer.id, Uuid::new_v4(), 1, day(1)).await.unwrap();

        let pending = f
            .claims
            .on_transaction_status(paid_tx.id, TransactionStatus::Pending, day(1))
            .await
            .unwrap();
        assert_eq!(pending.id, paid.id);
        assert_eq!(pending.status, ClaimStatus::AwaitPayment);

        let success = f
            .claims
            .on_transaction_status(paid_tx.id, TransactionStatus::Success, day(1))
            .await
            .unwrap();
        assert_eq!(success.status, ClaimStatus::Success);

        let failed = f
            .claims
            .on_transaction_status(lost_tx.id, TransactionStatus::Failed, day(1))
            .await
            .unwrap();
        assert_eq!(failed.id, lost.id);
        assert_eq!(failed.status, ClaimStatus::Failed);

        let stored = f.repo.get_transaction(lost_tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
    }
}
