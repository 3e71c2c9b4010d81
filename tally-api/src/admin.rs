use axum::{
    extract::{Path, State},
    middleware,
    routing::post,
    Extension, Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use tally_core::RunMode;
use tally_offer::{
    ExtendReport, ExtendRequest, Pass, ReconcileReport, RedistributionReport, RedistributionRun, TransferReport,
    TransferRequest,
};

use crate::error::AppError;
use crate::middleware::auth::{has_permission, PERMISSION_APPLY};
use crate::middleware::{admin_auth_middleware, AdminClaims};
use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ExtendBody {
    pub total_quantity: i64,
    pub per_window_quantity: i64,
    pub window_days: Option<i64>,
    pub gap_minutes: Option<i64>,
    pub max_days: Option<i64>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub struct TransferBody {
    pub from_offer_id: Uuid,
    pub to_offer_id: Uuid,
    pub count: i64,
    pub remarks: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub struct RedistributeBody {
    /// One campaign, or every campaign when absent.
    pub campaign_id: Option<Uuid>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileBody {
    /// Defaults to every pass.
    pub passes: Option<Vec<Pass>>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub struct DryRunBody {
    #[serde(default)]
    pub dry_run: bool,
}

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/v1/admin/campaigns/{sku}/schedules", post(extend_schedules))
        .route("/v1/admin/transfers", post(transfer_vouchers))
        .route("/v1/admin/redistribute", post(redistribute))
        .route("/v1/admin/reconcile", post(reconcile))
        .route("/v1/admin/orphans", post(fix_orphans))
        .route_layer(middleware::from_fn_with_state(state, admin_auth_middleware))
}

/// Dry runs are open to every admin; applying needs the apply permission.
fn run_mode(admin: &AdminClaims, dry_run: bool) -> Result<RunMode, AppError> {
    let mode = RunMode::from_dry_run(dry_run);
    if !mode.is_dry_run() && !has_permission(admin, PERMISSION_APPLY) {
        return Err(AppError::AuthorizationError(format!(
            "{} is required to apply changes",
            PERMISSION_APPLY
        )));
    }
    Ok(mode)
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/admin/campaigns/{sku}/schedules
async fn extend_schedules(
    State(state): State<AppState>,
    Path(sku): Path<String>,
    Extension(admin): Extension<AdminClaims>,
    Json(body): Json<ExtendBody>,
) -> Result<Json<ExtendReport>, AppError> {
    let mode = run_mode(&admin, body.dry_run)?;
    let request = ExtendRequest {
        total_quantity: body.total_quantity,
        per_window_quantity: body.per_window_quantity,
        window_days: body.window_days,
        gap_minutes: body.gap_minutes,
        max_days: body.max_days,
    };
    let report = state.extender.extend(&sku, &request, Utc::now(), mode).await?;

    state
        .publish_summary(
            "extend_schedules",
            Some(report.campaign_id),
            report.dry_run,
            json!({ "schedules": report.schedules.len(), "offers": report.offers.len() }),
        )
        .await;
    Ok(Json(report))
}

/// POST /v1/admin/transfers
async fn transfer_vouchers(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminClaims>,
    Json(body): Json<TransferBody>,
) -> Result<Json<TransferReport>, AppError> {
    let mode = run_mode(&admin, body.dry_run)?;
    let request = TransferRequest {
        from_offer_id: body.from_offer_id,
        to_offer_id: body.to_offer_id,
        count: body.count,
        actor_user_id: admin.user_id(),
        remarks: body.remarks,
    };
    let report = state.redistribution.transfer(&request, Utc::now(), mode).await?;

    state
        .publish_summary(
            "transfer",
            Some(report.campaign_id),
            report.dry_run,
            json!({ "requested": report.requested, "moved": report.moved }),
        )
        .await;
    Ok(Json(report))
}

/// POST /v1/admin/redistribute
async fn redistribute(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminClaims>,
    Json(body): Json<RedistributeBody>,
) -> Result<Json<RedistributionRun>, AppError> {
    let mode = run_mode(&admin, body.dry_run)?;
    let now = Utc::now();

    let run = match body.campaign_id {
        Some(campaign_id) => RedistributionRun {
            reports: vec![state.redistribution.redistribute(campaign_id, now, mode).await?],
            failures: Vec::new(),
        },
        None => state.redistribution.redistribute_all(now, mode).await?,
    };
    if !run.failures.is_empty() {
        tracing::warn!(failures = run.failures.len(), "Redistribution finished with failures");
    }

    publish_redistribution(&state, &run.reports).await;
    Ok(Json(run))
}

async fn publish_redistribution(state: &AppState, reports: &[RedistributionReport]) {
    for report in reports {
        state
            .publish_summary(
                "redistribute",
                Some(report.campaign_id),
                report.dry_run,
                json!({
                    "skipped": report.skipped,
                    "moved": report.moved,
                    "rejected": report.rejected,
                    "offers_created": report.offers_created.len(),
                }),
            )
            .await;
    }
}

/// POST /v1/admin/reconcile
async fn reconcile(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminClaims>,
    Json(body): Json<ReconcileBody>,
) -> Result<Json<ReconcileReport>, AppError> {
    let mode = run_mode(&admin, body.dry_run)?;
    let passes = body.passes.unwrap_or_else(|| Pass::ALL.to_vec());
    let report = state.reconciler.run(&passes, Utc::now(), mode).await?;
    publish_reconcile(&state, "reconcile", &report).await;
    Ok(Json(report))
}

/// POST /v1/admin/orphans
async fn fix_orphans(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminClaims>,
    Json(body): Json<DryRunBody>,
) -> Result<Json<ReconcileReport>, AppError> {
    let mode = run_mode(&admin, body.dry_run)?;
    let report = state
        .reconciler
        .run(&[Pass::OrphanedOffers], Utc::now(), mode)
        .await?;
    publish_reconcile(&state, "orphans", &report).await;
    Ok(Json(report))
}

async fn publish_reconcile(state: &AppState, job: &str, report: &ReconcileReport) {
    let counts: serde_json::Map<String, Value> = Pass::ALL
        .into_iter()
        .map(|pass| (pass.as_str().to_string(), json!(report.count(pass))))
        .collect();
    state
        .publish_summary(job, None, report.dry_run, Value::Object(counts))
        .await;
}
