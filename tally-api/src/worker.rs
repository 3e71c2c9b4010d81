use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use tally_core::RunMode;
use tally_offer::{Pass, RedistributionReport};
use tally_store::app_config::WorkerConfig;

use crate::state::AppState;

pub const BATCH_JOB: &str = "campaign_batch";

/// What one periodic pass did to one campaign.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CampaignBatchSummary {
    pub campaign_id: Uuid,
    pub published: usize,
    pub archived: usize,
    pub findings: usize,
    pub redistribution: Option<RedistributionReport>,
    pub failures: Vec<String>,
}

/// Spawns the claim sweep and the campaign batch loops.
pub fn start_background_workers(state: AppState, config: WorkerConfig) {
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(config.sweep_interval_seconds.max(1)));
        info!("Claim sweep worker started");
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_state.sweeper.sweep_expired(Utc::now(), RunMode::Apply).await {
                error!("Claim sweep failed: {}", e);
            }
        }
    });

    tokio::spawn(async move {
        let holder = format!("worker-{}", Uuid::new_v4());
        let mut ticker = interval(Duration::from_secs(config.batch_interval_seconds.max(1)));
        info!(holder = %holder, "Campaign batch worker started");
        loop {
            ticker.tick().await;
            run_batch(&state, &holder, Utc::now()).await;
        }
    });
}

/// One sequential pass over every campaign. Returns how many were processed.
pub async fn run_batch(state: &AppState, holder: &str, now: DateTime<Utc>) -> usize {
    let campaigns = match state.repo.list_campaigns().await {
        Ok(campaigns) => campaigns,
        Err(e) => {
            error!("Batch could not list campaigns: {}", e);
            return 0;
        }
    };

    let mut processed = 0;
    for campaign in campaigns {
        if let Some(redis) = &state.redis {
            match redis
                .acquire_batch_lock(BATCH_JOB, campaign.id, holder, state.inventory.batch_lock_seconds)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    info!(campaign_id = %campaign.id, "Campaign batch held by another worker, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(campaign_id = %campaign.id, "Batch lock unavailable, skipping: {}", e);
                    continue;
                }
            }
        }

        let summary = run_campaign_batch(state, campaign.id, now).await;
        processed += 1;
        state
            .publish_summary(
                BATCH_JOB,
                Some(campaign.id),
                false,
                serde_json::to_value(&summary).unwrap_or_default(),
            )
            .await;

        if let Some(redis) = &state.redis {
            if let Err(e) = redis.release_batch_lock(BATCH_JOB, campaign.id, holder).await {
                warn!(campaign_id = %campaign.id, "Failed to release batch lock: {}", e);
            }
        }
    }
    processed
}

/// Status sync, reconciliation, then redistribution for one campaign.
/// Each step's failure is recorded and the next step still runs.
pub async fn run_campaign_batch(state: &AppState, campaign_id: Uuid, now: DateTime<Utc>) -> CampaignBatchSummary {
    let mut summary = CampaignBatchSummary {
        campaign_id,
        ..Default::default()
    };

    match state.lifecycle.sync_campaign(campaign_id, now).await {
        Ok(report) => {
            summary.published = report.published.len();
            summary.archived = report.archived.len();
        }
        Err(e) => summary.failures.push(format!("lifecycle: {}", e)),
    }

    for pass in Pass::ALL {
        match state.reconciler.run_pass(pass, campaign_id, now, RunMode::Apply).await {
            Ok(findings) => summary.findings += findings.len(),
            Err(e) => summary.failures.push(format!("{}: {}", pass.as_str(), e)),
        }
    }

    match state.redistribution.redistribute(campaign_id, now, RunMode::Apply).await {
        Ok(report) => summary.redistribution = Some(report),
        Err(e) => summary.failures.push(format!("redistribute: {}", e)),
    }

    if summary.failures.is_empty() {
        info!(
            campaign_id = %campaign_id,
            findings = summary.findings,
            "Campaign batch finished"
        );
    } else {
        warn!(
            campaign_id = %campaign_id,
            failures = summary.failures.len(),
            "Campaign batch finished with failures"
        );
    }
    summary
}
