//! Checks that guard the voucher conservation invariant.
//!
//! Every store implementation runs these inside its atomic unit so the
//! in-memory and Postgres backends reject exactly the same operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{Claim, ClaimStatus, Offer, Voucher};

/// Units a budgeted campaign can still sell. `None` when unbounded.
pub fn remaining_budget(agreement_quantity: Option<i64>, owned: i64) -> Option<i64> {
    agreement_quantity.map(|agreed| agreed - owned)
}

/// Accepts iff `agreement_quantity - owned >= requested`.
pub fn check_budget(
    campaign_id: Uuid,
    agreement_quantity: Option<i64>,
    owned: i64,
    requested: i64,
) -> EngineResult<()> {
    match remaining_budget(agreement_quantity, owned) {
        Some(available) if available < requested => Err(EngineError::BudgetExceeded {
            campaign_id,
            requested,
            available: available.max(0),
        }),
        _ => Ok(()),
    }
}

/// A voucher may change offer only while nobody owns or holds it, and only
/// from the offer the caller believes it sits in.
pub fn ensure_movable(voucher: &Voucher, from_offer_id: Uuid, to_offer_id: Uuid) -> EngineResult<()> {
    if voucher.is_owned() {
        return Err(EngineError::MoveOnOwnedVoucher { voucher_id: voucher.id });
    }
    if let Some(claim_id) = voucher.held_by_claim_id {
        return Err(EngineError::VoucherHeld {
            voucher_id: voucher.id,
            claim_id,
        });
    }
    if voucher.merchant_offer_id != from_offer_id {
        return Err(EngineError::Validation(format!(
            "voucher {} sits in offer {}, not {}",
            voucher.id, voucher.merchant_offer_id, from_offer_id
        )));
    }
    if from_offer_id == to_offer_id {
        return Err(EngineError::Validation(format!(
            "voucher {} already belongs to offer {}",
            voucher.id, to_offer_id
        )));
    }
    Ok(())
}

pub fn ensure_claimable(offer: &Offer, quantity: i64, now: DateTime<Utc>) -> EngineResult<()> {
    if quantity < 1 {
        return Err(EngineError::Validation(format!("claim quantity must be positive, got {}", quantity)));
    }
    if !offer.is_claimable(now) {
        return Err(EngineError::Validation(format!(
            "offer {} is not on sale (status {}, window {})",
            offer.id, offer.status, offer.window
        )));
    }
    Ok(())
}

/// Whether releasing `claim` may hand `voucher` back to the free pool.
///
/// A voucher that is owned, held by another claim, or covered by some other
/// successful claim stays where it is.
pub fn may_release(voucher: &Voucher, claim: &Claim, other_claims: &[Claim]) -> bool {
    if voucher.is_owned() {
        return false;
    }
    if voucher.held_by_claim_id.is_some_and(|holder| holder != claim.id) {
        return false;
    }
    !other_claims.iter().any(|other| {
        other.id != claim.id && other.status == ClaimStatus::Success && other.voucher_ids.contains(&voucher.id)
    })
}

/// Campaign-wide counts recomputed from the voucher table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignTally {
    pub owned: i64,
    pub free: i64,
    pub held: i64,
    pub deleted: i64,
}

impl CampaignTally {
    pub fn from_vouchers<'a>(vouchers: impl IntoIterator<Item = &'a Voucher>, deleted: i64) -> Self {
        let mut tally = CampaignTally {
            deleted,
            ..Default::default()
        };
        for voucher in vouchers {
            if voucher.is_owned() {
                tally.owned += 1;
            } else if voucher.is_held() {
                tally.held += 1;
            } else {
                tally.free += 1;
            }
        }
        tally
    }

    pub fn live(&self) -> i64 {
        self.owned + self.free + self.held
    }

    pub fn created(&self) -> i64 {
        self.live() + self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClaimStatus, Voucher};

    fn voucher(offer_id: Uuid) -> Voucher {
        Voucher::new(Uuid::new_v4(), offer_id, "ABCDEFGHJKLM".to_string(), Utc::now())
    }

    fn claim(status: ClaimStatus, voucher_ids: Vec<Uuid>) -> Claim {
        let now = Utc::now();
        Claim {
            id: Uuid::new_v4(),
            offer_id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            quantity: voucher_ids.len() as i64,
            voucher_ids,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_budget_check_boundary() {
        let campaign_id = Uuid::new_v4();
        assert!(check_budget(campaign_id, Some(10), 3, 7).is_ok());
        let err = check_budget(campaign_id, Some(10), 3, 8).unwrap_err();
        assert_eq!(
            err,
            EngineError::BudgetExceeded {
                campaign_id,
                requested: 8,
                available: 7
            }
        );
        // Unbounded campaigns accept anything
        assert!(check_budget(campaign_id, None, 1_000, 1_000).is_ok());
    }

    #[test]
    fn test_owned_voucher_never_movable() {
        let from = Uuid::new_v4();
        let mut v = voucher(from);
        v.owned_by_id = Some(Uuid::new_v4());
        assert_eq!(
            ensure_movable(&v, from, Uuid::new_v4()).unwrap_err(),
            EngineError::MoveOnOwnedVoucher { voucher_id: v.id }
        );
    }

    #[test]
    fn test_held_and_misplaced_vouchers_rejected() {
        let from = Uuid::new_v4();
        let mut v = voucher(from);
        assert!(ensure_movable(&v, Uuid::new_v4(), Uuid::new_v4()).is_err());
        assert!(ensure_movable(&v, from, from).is_err());

        v.held_by_claim_id = Some(Uuid::new_v4());
        assert!(matches!(
            ensure_movable(&v, from, Uuid::new_v4()),
            Err(EngineError::VoucherHeld { .. })
        ));
    }

    #[test]
    fn test_release_double_check() {
        let mut v = voucher(Uuid::new_v4());
        let failing = claim(ClaimStatus::AwaitPayment, vec![v.id]);
        v.held_by_claim_id = Some(failing.id);
        assert!(may_release(&v, &failing, &[failing.clone()]));

        // A separate claim on the same voucher already succeeded
        let winner = claim(ClaimStatus::Success, vec![v.id]);
        assert!(!may_release(&v, &failing, &[failing.clone(), winner]));

        // Held by someone else
        v.held_by_claim_id = Some(Uuid::new_v4());
        assert!(!may_release(&v, &failing, &[]));
    }

    #[test]
    fn test_tally_counts() {
        let offer = Uuid::new_v4();
        let mut owned = voucher(offer);
        owned.owned_by_id = Some(Uuid::new_v4());
        let mut held = voucher(offer);
        held.held_by_claim_id = Some(Uuid::new_v4());
        let free = voucher(offer);

        let tally = CampaignTally::from_vouchers([&owned, &held, &free], 2);
        assert_eq!(tally.owned, 1);
        assert_eq!(tally.held, 1);
        assert_eq!(tally.free, 1);
        assert_eq!(tally.live(), 3);
        assert_eq!(tally.created(), 5);
    }
}
