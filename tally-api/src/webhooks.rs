use axum::{extract::State, routing::post, Json, Router};
use chrono::Utc;

use tally_core::Claim;
use tally_order::PaymentNotification;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/webhooks/payments", post(handle_payment_webhook))
}

/// POST /v1/webhooks/payments
/// Payment gateway status update for a claim's transaction.
async fn handle_payment_webhook(
    State(state): State<AppState>,
    Json(payload): Json<PaymentNotification>,
) -> Result<Json<Claim>, AppError> {
    tracing::info!(
        "Received payment webhook: {} for transaction {}",
        payload.status,
        payload.transaction_id
    );
    let claim = state.payments.process_notification(&payload, Utc::now()).await?;
    Ok(Json(claim))
}
