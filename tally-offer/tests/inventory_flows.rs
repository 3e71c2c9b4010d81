use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;

use tally_catalog::draft_campaign;
use tally_core::collaborators::{NoopMediaStore, RecordingReindexSink};
use tally_core::{
    Campaign, ClaimRequest, EngineError, InMemoryInventory, InventoryRepository, Offer, OfferStatus, RunMode,
    Schedule, Window,
};
use tally_offer::reconciliation::MERGE_REMARK;
use tally_offer::redistribution::AUTO_MOVED_REMARK;
use tally_offer::{
    OfferLifecycle, OfferMaterializer, Pass, ReconcileConfig, Reconciler, RedistributionConfig,
    RedistributionEngine, SkipReason, TransferRequest,
};

fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(n)
}

fn window(from: i64, to: i64) -> Window {
    Window::new(day(from), day(to)).unwrap()
}

struct Harness {
    repo: Arc<InMemoryInventory>,
    sink: Arc<RecordingReindexSink>,
    materializer: Arc<OfferMaterializer>,
    engine: RedistributionEngine,
    reconciler: Reconciler,
    lifecycle: OfferLifecycle,
}

impl Harness {
    fn new(auto_correct_budget: bool) -> Self {
        let repo = Arc::new(InMemoryInventory::new());
        let sink = Arc::new(RecordingReindexSink::new());
        let materializer = Arc::new(OfferMaterializer::new(
            repo.clone(),
            Arc::new(NoopMediaStore),
            sink.clone(),
        ));
        let engine = RedistributionEngine::new(
            repo.clone(),
            materializer.clone(),
            sink.clone(),
            RedistributionConfig::default(),
        );
        let reconciler = Reconciler::new(
            repo.clone(),
            materializer.clone(),
            sink.clone(),
            ReconcileConfig { auto_correct_budget },
        );
        let lifecycle = OfferLifecycle::new(repo.clone(), sink.clone());
        Self {
            repo,
            sink,
            materializer,
            engine,
            reconciler,
            lifecycle,
        }
    }

    async fn campaign(&self, sku: &str, agreement: Option<i64>) -> Campaign {
        let campaign = draft_campaign(sku, Uuid::new_v4(), agreement, day(0));
        self.repo.insert_campaign(&campaign).await.unwrap();
        campaign
    }

    async fn schedule(&self, campaign: &Campaign, window: Window, quantity: i64, created: DateTime<Utc>) -> Schedule {
        let schedule = Schedule::new(campaign.id, window, quantity, created);
        self.repo.insert_schedule(&schedule).await.unwrap();
        schedule
    }

    async fn offer(&self, schedule: &Schedule, now: DateTime<Utc>) -> Offer {
        self.materializer.materialize(schedule.id, now).await.unwrap()
    }

    /// Claims and pays for `quantity` vouchers of `offer` in one go.
    async fn sell(&self, offer: &Offer, quantity: i64, now: DateTime<Utc>) {
        let request = ClaimRequest {
            offer_id: offer.id,
            user_id: Uuid::new_v4(),
            quantity,
            amount_cents: 0,
        };
        let (claim, _) = self.repo.reserve_vouchers(&request, now).await.unwrap();
        self.repo.confirm_claim(claim.id, now).await.unwrap();
    }

    async fn counts(&self, offer_id: Uuid) -> (usize, usize) {
        let vouchers = self.repo.list_vouchers(offer_id).await.unwrap();
        let owned = vouchers.iter().filter(|v| v.is_owned()).count();
        let free = vouchers.iter().filter(|v| v.is_free()).count();
        (owned, free)
    }
}

#[tokio::test]
async fn test_elapsed_window_rolls_unsold_vouchers_forward() {
    let h = Harness::new(false);
    let campaign = h.campaign("BRUNCH", Some(10)).await;
    let s1 = h.schedule(&campaign, window(0, 3), 5, day(0)).await;
    let o1 = h.offer(&s1, day(0)).await;
    for _ in 0..3 {
        h.sell(&o1, 1, day(1)).await;
    }

    let report = h.engine.redistribute(campaign.id, day(3), RunMode::Apply).await.unwrap();
    assert_eq!(report.skipped, None);
    assert_eq!(report.remaining_budget, Some(7));
    assert_eq!(report.moved, 2);
    assert_eq!(report.offers_created.len(), 1);
    assert_eq!(report.archived_offers, vec![o1.id]);

    let o2 = h.repo.get_offer(report.offers_created[0]).await.unwrap().unwrap();
    assert_eq!(o2.window, window(3, 6));
    assert_eq!(h.counts(o2.id).await, (0, 2));
    assert_eq!(o2.remaining_quantity, 2);
    assert_eq!(h.counts(o1.id).await, (3, 0));
    let o1 = h.repo.get_offer(o1.id).await.unwrap().unwrap();
    assert_eq!(o1.status, OfferStatus::Archived);

    let movements = h.repo.list_movements(campaign.id).await.unwrap();
    assert_eq!(movements.len(), 2);
    assert!(movements.iter().all(|m| m.from_offer_id == o1.id
        && m.to_offer_id == o2.id
        && m.remarks == AUTO_MOVED_REMARK
        && m.actor_user_id == Some(campaign.owner_user_id)));
    assert_eq!(h.sink.moved_vouchers().len(), 2);

    let tally = h.repo.campaign_tally(campaign.id).await.unwrap();
    assert_eq!((tally.owned, tally.free, tally.held), (3, 2, 0));

    let again = h.engine.redistribute(campaign.id, day(3), RunMode::Apply).await.unwrap();
    assert_eq!(again.skipped, Some(SkipReason::ActiveScheduleExists));
    assert_eq!(h.repo.list_movements(campaign.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_redistribution_carries_at_most_remaining_budget() {
    let h = Harness::new(false);
    let campaign = h.campaign("CINEMA", Some(4)).await;
    let s1 = h.schedule(&campaign, window(0, 3), 6, day(0)).await;
    let o1 = h.offer(&s1, day(0)).await;
    h.sell(&o1, 2, day(1)).await;

    let dry = h.engine.redistribute(campaign.id, day(4), RunMode::DryRun).await.unwrap();
    let plan = dry.plan.unwrap();
    assert_eq!(plan.scheduled_quantity(), 2);
    assert_eq!(plan.windows[0].window.available_at, day(4));
    assert!(h.repo.list_movements(campaign.id).await.unwrap().is_empty());
    assert_eq!(h.repo.list_schedules(campaign.id).await.unwrap().len(), 1);

    let report = h.engine.redistribute(campaign.id, day(4), RunMode::Apply).await.unwrap();
    assert_eq!(report.free_in_elapsed, 4);
    assert_eq!(report.moved, 2);
    // Two unsold vouchers exceed the budget and stay behind.
    assert_eq!(h.counts(o1.id).await, (2, 2));
    assert!(report.archived_offers.is_empty());
}

#[tokio::test]
async fn test_redistribution_skips_exhausted_and_unbounded() {
    let h = Harness::new(false);
    let sold = h.campaign("SOLD", Some(2)).await;
    let s = h.schedule(&sold, window(0, 3), 3, day(0)).await;
    let o = h.offer(&s, day(0)).await;
    h.sell(&o, 2, day(1)).await;
    let unbounded = h.campaign("OPEN", None).await;

    let run = h.engine.redistribute_all(day(5), RunMode::Apply).await.unwrap();
    assert!(run.failures.is_empty());
    assert_eq!(run.reports.len(), 1);
    assert_eq!(run.reports[0].skipped, Some(SkipReason::BudgetExhausted));

    let report = h.engine.redistribute(unbounded.id, day(5), RunMode::Apply).await.unwrap();
    assert_eq!(report.skipped, Some(SkipReason::Unbounded));
}

#[tokio::test]
async fn test_transfer_is_budget_guarded_and_atomic() {
    let h = Harness::new(false);
    let campaign = h.campaign("SPA", Some(4)).await;
    let s1 = h.schedule(&campaign, window(0, 3), 5, day(0)).await;
    let o1 = h.offer(&s1, day(0)).await;
    let s2 = h.schedule(&campaign, window(3, 6), 0, day(0)).await;
    let o2 = h.materializer.attach(&s2, day(0)).await.unwrap();
    h.sell(&o1, 3, day(1)).await;

    let request = |count| TransferRequest {
        from_offer_id: o1.id,
        to_offer_id: o2.id,
        count,
        actor_user_id: Some(campaign.owner_user_id),
        remarks: None,
    };

    let err = h.engine.transfer(&request(2), day(2), RunMode::Apply).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::BudgetExceeded {
            campaign_id: campaign.id,
            requested: 2,
            available: 1
        }
    );
    assert_eq!(h.counts(o1.id).await, (3, 2));
    assert!(h.repo.list_movements(campaign.id).await.unwrap().is_empty());

    let err = h.engine.transfer(&request(3), day(2), RunMode::Apply).await.unwrap_err();
    assert!(matches!(err, EngineError::OutOfStock { available: 2, .. }));

    let dry = h.engine.transfer(&request(1), day(2), RunMode::DryRun).await.unwrap();
    assert_eq!((dry.moved, dry.voucher_ids.len()), (0, 1));

    let report = h.engine.transfer(&request(1), day(2), RunMode::Apply).await.unwrap();
    assert_eq!(report.moved, 1);
    assert_eq!(h.counts(o2.id).await, (0, 1));
    assert_eq!(h.repo.get_offer(o2.id).await.unwrap().unwrap().remaining_quantity, 1);
    let movements = h.repo.list_movements(campaign.id).await.unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].remarks, "Redistribution");
}

#[tokio::test]
async fn test_transfer_refuses_unsellable_destination() {
    let h = Harness::new(false);
    let campaign = h.campaign("SAUNA", Some(10)).await;
    let s1 = h.schedule(&campaign, window(0, 3), 4, day(0)).await;
    let o1 = h.offer(&s1, day(0)).await;
    let lapsed = h.schedule(&campaign, window(0, 1), 0, day(0)).await;
    let lapsed = h.materializer.attach(&lapsed, day(0)).await.unwrap();
    let closed = h.schedule(&campaign, window(3, 6), 0, day(0)).await;
    let closed = h.materializer.attach(&closed, day(0)).await.unwrap();
    h.lifecycle.archive(closed.id).await.unwrap();

    for target in [lapsed.id, closed.id] {
        let request = TransferRequest {
            from_offer_id: o1.id,
            to_offer_id: target,
            count: 1,
            actor_user_id: None,
            remarks: None,
        };
        let err = h.engine.transfer(&request, day(2), RunMode::Apply).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
    assert_eq!(h.counts(o1.id).await, (0, 4));
    assert!(h.repo.list_movements(campaign.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_schedules_merge_into_earliest() {
    let h = Harness::new(false);
    let campaign = h.campaign("TASTING", Some(20)).await;
    let s3 = h.schedule(&campaign, window(5, 8), 4, day(0)).await;
    let s4 = h.schedule(&campaign, window(5, 8), 4, day(0) + Duration::hours(1)).await;
    let o3 = h.offer(&s3, day(0)).await;
    let o4 = h.offer(&s4, day(0)).await;

    h.lifecycle.sync_campaign(campaign.id, day(5)).await.unwrap();
    h.sell(&o4, 2, day(5)).await;

    let dry = h.reconciler.merge_duplicates(campaign.id, day(6), RunMode::DryRun).await.unwrap();
    assert!(!dry.is_empty());
    assert!(dry.iter().all(|f| !f.applied));
    assert_eq!(h.counts(o4.id).await, (2, 2));

    h.reconciler.merge_duplicates(campaign.id, day(6), RunMode::Apply).await.unwrap();

    assert_eq!(h.counts(o3.id).await, (0, 6));
    assert_eq!(h.counts(o4.id).await, (2, 0));
    let o4 = h.repo.get_offer(o4.id).await.unwrap().expect("offer with sold vouchers is kept");
    assert_eq!(o4.schedule_id, s3.id);
    assert_eq!(o4.window, s3.window);
    assert!(h.repo.get_schedule(s4.id).await.unwrap().is_none());

    let movements = h.repo.list_movements(campaign.id).await.unwrap();
    assert_eq!(movements.len(), 2);
    assert!(movements.iter().all(|m| m.to_offer_id == o3.id && m.remarks == MERGE_REMARK));

    let second = h.reconciler.merge_duplicates(campaign.id, day(6), RunMode::Apply).await.unwrap();
    assert!(second.is_empty());
    assert_eq!(h.repo.list_movements(campaign.id).await.unwrap().len(), 2);
    assert_eq!(h.counts(o3.id).await, (0, 6));
}

#[tokio::test]
async fn test_unsold_duplicate_offer_is_deleted() {
    let h = Harness::new(false);
    let campaign = h.campaign("YOGA", Some(20)).await;
    let s1 = h.schedule(&campaign, window(5, 8), 3, day(0)).await;
    let s2 = h.schedule(&campaign, window(5, 8), 3, day(1)).await;
    let o1 = h.offer(&s1, day(1)).await;
    let o2 = h.offer(&s2, day(1)).await;

    h.reconciler.merge_duplicates(campaign.id, day(2), RunMode::Apply).await.unwrap();

    assert!(h.repo.get_offer(o2.id).await.unwrap().is_none());
    assert_eq!(h.counts(o1.id).await, (0, 6));
    let tally = h.repo.campaign_tally(campaign.id).await.unwrap();
    assert_eq!(tally.created(), 6);
    assert_eq!(tally.deleted, 0);
}

#[tokio::test]
async fn test_missing_offers_and_orphans_are_repaired() {
    let h = Harness::new(false);
    let campaign = h.campaign("BOWLING", Some(20)).await;
    let future = h.schedule(&campaign, window(4, 7), 3, day(0)).await;
    let _elapsed = h.schedule(&campaign, window(0, 1), 3, day(0)).await;
    let s = h.schedule(&campaign, window(1, 4), 2, day(0)).await;
    let orphan = h.offer(&s, day(0)).await;
    assert!(h.repo.purge_schedule(s.id).await);

    let report = h
        .reconciler
        .run(&[Pass::MissingOffers, Pass::OrphanedOffers], day(2), RunMode::DryRun)
        .await
        .unwrap();
    assert_eq!(report.count(Pass::MissingOffers), 1);
    assert_eq!(report.count(Pass::OrphanedOffers), 1);
    assert!(h.repo.offers_for_schedule(future.id).await.unwrap().is_empty());

    let report = h.reconciler.run(&Pass::ALL, day(2), RunMode::Apply).await.unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(h.repo.offers_for_schedule(future.id).await.unwrap().len(), 1);
    let repaired = h.repo.get_offer(orphan.id).await.unwrap().unwrap();
    let schedule = h.repo.get_schedule(repaired.schedule_id).await.unwrap().unwrap();
    assert_eq!(schedule.window, orphan.window);
    assert_eq!(report.count(Pass::Conservation), 0);

    let again = h.reconciler.run(&Pass::ALL, day(2), RunMode::Apply).await.unwrap();
    assert_eq!(again.count(Pass::MissingOffers), 0);
    assert_eq!(again.count(Pass::OrphanedOffers), 0);
}

#[tokio::test]
async fn test_overselling_corrects_agreement_when_enabled() {
    let h = Harness::new(true);
    let campaign = h.campaign("GOLF", Some(2)).await;
    let s = h.schedule(&campaign, window(0, 3), 3, day(0)).await;
    let o = h.offer(&s, day(0)).await;
    h.sell(&o, 3, day(1)).await;

    let dry = h.reconciler.repair_budget_drift(campaign.id, day(1), RunMode::DryRun).await.unwrap();
    assert_eq!(dry.len(), 1);
    assert_eq!(h.repo.get_campaign(campaign.id).await.unwrap().unwrap().agreement_quantity, Some(2));

    let findings = h.reconciler.repair_budget_drift(campaign.id, day(1), RunMode::Apply).await.unwrap();
    assert!(findings[0].applied);
    assert_eq!(h.repo.get_campaign(campaign.id).await.unwrap().unwrap().agreement_quantity, Some(3));
    assert!(h
        .reconciler
        .repair_budget_drift(campaign.id, day(1), RunMode::Apply)
        .await
        .unwrap()
        .is_empty());
}
