use std::sync::Arc;

use tally_core::{InventoryRepository, MediaStore, ReindexSink};
use tally_offer::{
    ExtendDefaults, OfferLifecycle, OfferMaterializer, ReconcileConfig, Reconciler, RedistributionConfig,
    RedistributionEngine, ScheduleExtender,
};
use tally_order::{ClaimManager, ClaimSweeper, PaymentOrchestrator};
use tally_store::app_config::InventoryConfig;
use tally_store::{EventProducer, RedisClient};

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub expiration: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn InventoryRepository>,
    pub materializer: Arc<OfferMaterializer>,
    pub lifecycle: Arc<OfferLifecycle>,
    pub claims: Arc<ClaimManager>,
    pub payments: Arc<PaymentOrchestrator>,
    pub sweeper: Arc<ClaimSweeper>,
    pub redistribution: Arc<RedistributionEngine>,
    pub reconciler: Arc<Reconciler>,
    pub extender: Arc<ScheduleExtender>,
    /// Absent in tests; the rate limiter and batch locks are skipped then.
    pub redis: Option<Arc<RedisClient>>,
    pub events: Option<Arc<EventProducer>>,
    pub auth: AuthConfig,
    pub inventory: InventoryConfig,
    pub rate_limit_per_minute: i64,
}

impl AppState {
    /// Wires every engine component over one repository.
    pub fn new(
        repo: Arc<dyn InventoryRepository>,
        media: Arc<dyn MediaStore>,
        reindex: Arc<dyn ReindexSink>,
        inventory: InventoryConfig,
        auth: AuthConfig,
    ) -> Self {
        let materializer = Arc::new(OfferMaterializer::new(repo.clone(), media, reindex.clone()));
        let lifecycle = Arc::new(OfferLifecycle::new(repo.clone(), reindex.clone()));
        let claims = Arc::new(ClaimManager::new(repo.clone(), lifecycle.clone(), reindex.clone()));
        let payments = Arc::new(PaymentOrchestrator::new(claims.clone()));
        let sweeper = Arc::new(ClaimSweeper::from_minutes(
            repo.clone(),
            claims.clone(),
            inventory.claim_timeout_minutes,
        ));
        let redistribution = Arc::new(RedistributionEngine::new(
            repo.clone(),
            materializer.clone(),
            reindex.clone(),
            RedistributionConfig {
                window_quantity: inventory.redistribution_window_quantity,
                window_days: inventory.window_days,
                window_gap_minutes: inventory.window_gap_minutes,
                max_days: inventory.max_days,
            },
        ));
        let reconciler = Arc::new(Reconciler::new(
            repo.clone(),
            materializer.clone(),
            reindex,
            ReconcileConfig {
                auto_correct_budget: inventory.auto_correct_budget,
            },
        ));
        let extender = Arc::new(ScheduleExtender::new(
            repo.clone(),
            materializer.clone(),
            ExtendDefaults {
                window_days: inventory.window_days,
                gap_minutes: inventory.window_gap_minutes,
                max_days: inventory.max_days,
            },
        ));

        Self {
            repo,
            materializer,
            lifecycle,
            claims,
            payments,
            sweeper,
            redistribution,
            reconciler,
            extender,
            redis: None,
            events: None,
            auth,
            inventory,
            rate_limit_per_minute: 120,
        }
    }

    pub fn with_redis(mut self, redis: Arc<RedisClient>, rate_limit_per_minute: i64) -> Self {
        self.redis = Some(redis);
        self.rate_limit_per_minute = rate_limit_per_minute;
        self
    }

    pub fn with_events(mut self, events: Arc<EventProducer>) -> Self {
        self.events = Some(events);
        self
    }

    /// Publishes a batch summary when Kafka is wired. Failures are logged only.
    pub async fn publish_summary(
        &self,
        job: &str,
        campaign_id: Option<uuid::Uuid>,
        dry_run: bool,
        counts: serde_json::Value,
    ) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(e) = events.publish_batch_summary(job, campaign_id, dry_run, counts).await {
            tracing::warn!(job, "Failed to publish batch summary: {}", e);
        }
    }
}
