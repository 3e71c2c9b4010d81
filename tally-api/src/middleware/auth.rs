use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::AppState;

pub const PERMISSION_APPLY: &str = "inventory:apply";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CustomerClaims {
    /// Buyer's user id.
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

impl CustomerClaims {
    pub fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminClaims {
    pub sub: String,
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub exp: usize,
}

impl AdminClaims {
    pub fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }
}

fn bearer_token(req: &Request) -> Result<&str, StatusCode> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)
}

pub async fn customer_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token_data = decode::<CustomerClaims>(
        bearer_token(&req)?,
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| StatusCode::UNAUTHORIZED)?;

    if token_data.claims.role != "CUSTOMER" {
        return Err(StatusCode::FORBIDDEN);
    }

    req.extensions_mut().insert(token_data.claims);
    Ok(next.run(req).await)
}

pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token_data = decode::<AdminClaims>(
        bearer_token(&req)?,
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| StatusCode::UNAUTHORIZED)?;

    if token_data.claims.role != "ADMIN" && token_data.claims.role != "SUPER_ADMIN" {
        return Err(StatusCode::FORBIDDEN);
    }

    req.extensions_mut().insert(token_data.claims);
    Ok(next.run(req).await)
}

pub fn has_permission(claims: &AdminClaims, permission: &str) -> bool {
    claims.role == "SUPER_ADMIN" || claims.permissions.iter().any(|p| p == permission)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin(role: &str, permissions: &[&str]) -> AdminClaims {
        AdminClaims {
            sub: Uuid::new_v4().to_string(),
            email: "ops@example.com".to_string(),
            role: role.to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            exp: 0,
        }
    }

    #[test]
    fn test_apply_permission() {
        assert!(has_permission(&admin("SUPER_ADMIN", &[]), PERMISSION_APPLY));
        assert!(has_permission(&admin("ADMIN", &[PERMISSION_APPLY]), PERMISSION_APPLY));
        assert!(!has_permission(&admin("ADMIN", &["inventory:read"]), PERMISSION_APPLY));
    }
}
