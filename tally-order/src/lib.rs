pub mod claims;
pub mod sweep;
pub mod orchestrator;

pub use claims::ClaimManager;
pub use sweep::{ClaimSweeper, SweepReport};
pub use orchestrator::{parse_gateway_status, PaymentNotification, PaymentOrchestrator};

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Arc;
    use uuid::Uuid;

    use tally_catalog::draft_campaign;
    use tally_core::collaborators::{NoopMediaStore, RecordingReindexSink};
    use tally_core::{InMemoryInventory, InventoryRepository, Offer, Schedule, Window};
    use tally_offer::{OfferLifecycle, OfferMaterializer};

    use crate::claims::ClaimManager;

    pub fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    pub struct Fixture {
        pub repo: Arc<InMemoryInventory>,
        pub claims: Arc<ClaimManager>,
        pub offer: Offer,
    }

    impl Fixture {
        /// Published offer on `[day0, day3)` with `vouchers` free units at 15.00 each.
        pub async fn new(vouchers: i64) -> Self {
            let repo = Arc::new(InMemoryInventory::new());
            let sink = Arc::new(RecordingReindexSink::new());
            let mut campaign = draft_campaign("COFFEE", Uuid::new_v4(), Some(100), day(0));
            campaign.price_cents = 2500;
            campaign.discounted_price_cents = Some(1500);
            repo.insert_campaign(&campaign).await.unwrap();

            let schedule = Schedule::new(campaign.id, Window::new(day(0), day(3)).unwrap(), vouchers, day(0));
            repo.insert_schedule(&schedule).await.unwrap();
            let offer = OfferMaterializer::new(repo.clone(), Arc::new(NoopMediaStore), sink.clone())
                .materialize(schedule.id, day(0))
                .await
                .unwrap();

            let lifecycle = Arc::new(OfferLifecycle::new(repo.clone(), sink.clone()));
            let claims = Arc::new(ClaimManager::new(repo.clone(), lifecycle, sink));
            Self { repo, claims, offer }
        }
    }
}
