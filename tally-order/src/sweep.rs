use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use tally_core::{EngineError, EngineResult, InventoryRepository, RunMode};

use crate::claims::ClaimManager;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SweepReport {
    pub dry_run: bool,
    pub expired: Vec<Uuid>,
    pub released: i64,
    pub freed: i64,
    pub failures: Vec<String>,
}

/// Releases claims whose payment never arrived.
pub struct ClaimSweeper {
    repo: Arc<dyn InventoryRepository>,
    claims: Arc<ClaimManager>,
    timeout: Duration,
}

impl ClaimSweeper {
    pub fn new(repo: Arc<dyn InventoryRepository>, claims: Arc<ClaimManager>, timeout: Duration) -> Self {
        Self { repo, claims, timeout }
    }

    pub fn from_minutes(repo: Arc<dyn InventoryRepository>, claims: Arc<ClaimManager>, minutes: i64) -> Self {
        Self::new(repo, claims, Duration::try_minutes(minutes).unwrap_or(Duration::MAX))
    }

    /// Every claim pending since before `now - timeout`, released one at a
    /// time. A failing release is recorded and the sweep moves on.
    pub async fn sweep_expired(&self, now: DateTime<Utc>, mode: RunMode) -> EngineResult<SweepReport> {
        let cutoff = now.checked_sub_signed(self.timeout).ok_or_else(|| {
            EngineError::Validation(format!("claim timeout of {} is out of range", self.timeout))
        })?;
        let expired = self.repo.list_pending_claims_before(cutoff).await?;

        let mut report = SweepReport {
            dry_run: mode.is_dry_run(),
            expired: expired.iter().map(|c| c.id).collect(),
            ..Default::default()
        };
        if mode.is_dry_run() {
            return Ok(report);
        }

        for claim in expired {
            match self.claims.release(claim.id, now).await {
                Ok(outcome) => {
                    if !outcome.already_released {
                        report.released += 1;
                    }
                    report.freed += outcome.freed;
                }
                Err(e) => {
                    warn!(claim_id = %claim.id, "Failed to release expired claim: {}", e);
                    report.failures.push(format!("{}: {}", claim.id, e));
                }
            }
        }

        if !report.expired.is_empty() {
            info!(
                released = report.released,
                freed = report.freed,
                failures = report.failures.len(),
                "Expired claims swept"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{day, Fixture};

    #[tokio::test]
    async fn test_sweep_releases_only_stale_claims() {
        let f = Fixture::new(4).await;
        let (stale, _) = f.claims.claim(f.offer.id, Uuid::new_v4(), 2, day(1)).await.unwrap();
        let fresh_at = day(1) + Duration::minutes(50);
        let (fresh, _) = f.claims.claim(f.offer.id, Uuid::new_v4(), 1, fresh_at).await.unwrap();

        let sweeper = ClaimSweeper::from_minutes(f.repo.clone(), f.claims.clone(), 30);
        let now = day(1) + Duration::minutes(60);

        let dry = sweeper.sweep_expired(now, RunMode::DryRun).await.unwrap();
        assert_eq!(dry.expired, vec![stale.id]);
        assert_eq!(dry.released, 0);

        let report = sweeper.sweep_expired(now, RunMode::Apply).await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(report.freed, 2);

        let tally = f.repo.campaign_tally(f.offer.campaign_id).await.unwrap();
        assert_eq!((tally.free, tally.held), (3, 1));
        assert_eq!(
            f.repo.get_claim(fresh.id).await.unwrap().unwrap().status,
            tally_core::ClaimStatus::AwaitPayment
        );

        let again = sweeper.sweep_expired(now, RunMode::Apply).await.unwrap();
        assert!(again.expired.is_empty());
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_is_rejected() {
        let f = Fixture::new(1).await;
        f.claims.claim(f.offer.id, Uuid::new_v4(), 1, day(1)).await.unwrap();

        let sweeper = ClaimSweeper::from_minutes(f.repo.clone(), f.claims.clone(), i64::MAX);
        let err = sweeper.sweep_expired(day(2), RunMode::Apply).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(f.repo.campaign_tally(f.offer.campaign_id).await.unwrap().held, 1);
    }
}
