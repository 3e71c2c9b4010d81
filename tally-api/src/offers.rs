use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tally_core::{Claim, EngineError, Offer, Transaction};

use crate::error::AppError;
use crate::middleware::{customer_auth_middleware, CustomerClaims};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ClaimBody {
    #[serde(default = "one")]
    pub quantity: i64,
}

fn one() -> i64 {
    1
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub claim: Claim,
    pub transaction: Transaction,
}

pub fn routes(state: AppState) -> Router<AppState> {
    let claims = Router::new()
        .route("/v1/offers/{id}/claims", post(claim_offer))
        .route_layer(middleware::from_fn_with_state(state, customer_auth_middleware));

    Router::new().route("/v1/offers/{id}", get(get_offer)).merge(claims)
}

/// GET /v1/offers/{id}
async fn get_offer(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Offer>, AppError> {
    let offer = state
        .repo
        .get_offer(id)
        .await?
        .ok_or_else(|| EngineError::not_found("offer", id))?;
    Ok(Json(offer))
}

/// POST /v1/offers/{id}/claims
async fn claim_offer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(customer): Extension<CustomerClaims>,
    Json(body): Json<ClaimBody>,
) -> Result<(StatusCode, Json<ClaimResponse>), AppError> {
    let user_id = customer
        .user_id()
        .ok_or_else(|| AppError::AuthenticationError("token subject is not a user id".to_string()))?;

    let (claim, transaction) = state.claims.claim(id, user_id, body.quantity, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(ClaimResponse { claim, transaction })))
}
