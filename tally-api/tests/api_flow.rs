use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use tally_api::middleware::auth::PERMISSION_APPLY;
use tally_api::middleware::{AdminClaims, CustomerClaims};
use tally_api::{app, worker, AppState, AuthConfig};
use tally_catalog::draft_campaign;
use tally_core::{
    Campaign, InMemoryInventory, InventoryRepository, NoopMediaStore, Offer, RecordingReindexSink, Schedule, Window,
};
use tally_store::app_config::InventoryConfig;

const SECRET: &str = "test-secret";

struct TestApp {
    state: AppState,
    repo: Arc<InMemoryInventory>,
    router: Router,
}

impl TestApp {
    fn new() -> Self {
        let repo = Arc::new(InMemoryInventory::new());
        let state = AppState::new(
            repo.clone(),
            Arc::new(NoopMediaStore),
            Arc::new(RecordingReindexSink::new()),
            InventoryConfig::default(),
            AuthConfig {
                secret: SECRET.to_string(),
                expiration: 3600,
            },
        );
        let router = app(state.clone());
        Self { state, repo, router }
    }

    async fn campaign(&self, sku: &str, agreement: Option<i64>, at: DateTime<Utc>) -> Campaign {
        let mut campaign = draft_campaign(sku, Uuid::new_v4(), agreement, at);
        campaign.price_cents = 4000;
        campaign.discounted_price_cents = Some(2500);
        self.repo.insert_campaign(&campaign).await.unwrap();
        campaign
    }

    async fn offer(&self, campaign: &Campaign, from: DateTime<Utc>, to: DateTime<Utc>, qty: i64, at: DateTime<Utc>) -> Offer {
        let schedule = Schedule::new(campaign.id, Window::new(from, to).unwrap(), qty, at);
        self.repo.insert_schedule(&schedule).await.unwrap();
        self.state.materializer.materialize(schedule.id, at).await.unwrap()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }
}

fn token<T: Serialize>(claims: &T) -> String {
    encode(&Header::default(), claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

fn expiry() -> usize {
    (Utc::now() + Duration::hours(1)).timestamp() as usize
}

fn customer_token(user_id: Uuid) -> String {
    token(&CustomerClaims {
        sub: user_id.to_string(),
        role: "CUSTOMER".to_string(),
        exp: expiry(),
    })
}

fn admin_token(permissions: &[&str]) -> String {
    token(&AdminClaims {
        sub: Uuid::new_v4().to_string(),
        email: "ops@example.com".to_string(),
        role: "ADMIN".to_string(),
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
        exp: expiry(),
    })
}

fn post(uri: &str, bearer: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(bearer) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", bearer));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_claim_then_payment_webhook() {
    let t = TestApp::new();
    let now = Utc::now();
    let campaign = t.campaign("SPA-DAY", Some(20), now).await;
    let offer = t.offer(&campaign, now - Duration::days(1), now + Duration::days(2), 3, now).await;
    let buyer = Uuid::new_v4();

    let (status, body) = t
        .send(post(
            &format!("/v1/offers/{}/claims", offer.id),
            Some(&customer_token(buyer)),
            json!({ "quantity": 2 }),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["claim"]["status"], "await_payment");
    assert_eq!(body["transaction"]["amount_cents"], 5000);
    let transaction_id = body["transaction"]["id"].as_str().unwrap().to_string();

    let (status, body) = t.send(get(&format!("/v1/offers/{}", offer.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remaining_quantity"], 1);

    let (status, body) = t
        .send(post(
            "/v1/webhooks/payments",
            None,
            json!({ "transaction_id": transaction_id, "status": "settlement", "reference": null }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let owned = t
        .repo
        .list_vouchers(offer.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|v| v.owned_by_id == Some(buyer))
        .count();
    assert_eq!(owned, 2);
}

#[tokio::test]
async fn test_claim_needs_customer_token_and_stock() {
    let t = TestApp::new();
    let now = Utc::now();
    let campaign = t.campaign("KARAOKE", None, now).await;
    let offer = t.offer(&campaign, now - Duration::days(1), now + Duration::days(2), 1, now).await;
    let uri = format!("/v1/offers/{}/claims", offer.id);

    let (status, _) = t.send(post(&uri, None, json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = t
        .send(post(&uri, Some(&customer_token(Uuid::new_v4())), json!({ "quantity": 2 })))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("Out of stock"));

    let (status, _) = t.send(get(&format!("/v1/offers/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_transfer_permissions_and_budget() {
    let t = TestApp::new();
    let now = Utc::now();
    let campaign = t.campaign("BOWLING", Some(3), now).await;
    let from = t.offer(&campaign, now - Duration::days(1), now + Duration::days(2), 5, now).await;
    let to = t.offer(&campaign, now + Duration::days(2), now + Duration::days(5), 0, now).await;

    let transfer = |count: i64, dry_run: bool| {
        json!({
            "from_offer_id": from.id,
            "to_offer_id": to.id,
            "count": count,
            "dry_run": dry_run,
        })
    };

    // Customer tokens do not pass the admin gate.
    let (status, _) = t
        .send(post("/v1/admin/transfers", Some(&customer_token(Uuid::new_v4())), transfer(1, true)))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let reader = admin_token(&[]);
    let (status, body) = t.send(post("/v1/admin/transfers", Some(&reader), transfer(2, true))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dry_run"], true);
    assert_eq!(body["moved"], 0);

    let (status, _) = t.send(post("/v1/admin/transfers", Some(&reader), transfer(2, false))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let operator = admin_token(&[PERMISSION_APPLY]);
    let (status, _) = t.send(post("/v1/admin/transfers", Some(&operator), transfer(4, false))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(t.repo.list_vouchers(to.id).await.unwrap().is_empty());

    let (status, body) = t.send(post("/v1/admin/transfers", Some(&operator), transfer(2, false))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["moved"], 2);
    assert_eq!(t.repo.list_vouchers(to.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_admin_extend_and_reconcile() {
    let t = TestApp::new();
    let now = Utc::now();
    t.campaign("PAINTBALL", Some(10), now).await;
    let operator = admin_token(&[PERMISSION_APPLY]);

    let (status, body) = t
        .send(post(
            "/v1/admin/campaigns/PAINTBALL/schedules",
            Some(&operator),
            json!({ "total_quantity": 6, "per_window_quantity": 4, "dry_run": true }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"]["windows"].as_array().unwrap().len(), 2);
    assert!(body["schedules"].as_array().unwrap().is_empty());

    let (status, body) = t
        .send(post(
            "/v1/admin/campaigns/PAINTBALL/schedules",
            Some(&operator),
            json!({ "total_quantity": 6, "per_window_quantity": 4 }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["offers"].as_array().unwrap().len(), 2);

    let (status, _) = t
        .send(post(
            "/v1/admin/campaigns/PAINTBALL/schedules",
            Some(&operator),
            json!({ "total_quantity": 5, "per_window_quantity": 5 }),
        ))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = t
        .send(post(
            "/v1/admin/campaigns/NO-SUCH-SKU/schedules",
            Some(&operator),
            json!({ "total_quantity": 1, "per_window_quantity": 1 }),
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = t
        .send(post(
            "/v1/admin/reconcile",
            Some(&admin_token(&[])),
            json!({ "passes": ["conservation", "budget_drift"], "dry_run": true }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dry_run"], true);
    assert!(body["findings"].as_array().unwrap().is_empty());

    let (status, body) = t
        .send(post("/v1/admin/orphans", Some(&operator), json!({ "dry_run": false })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["campaigns"], 1);
}

#[tokio::test]
async fn test_batch_worker_rolls_elapsed_campaign_forward() {
    let t = TestApp::new();
    let day = |n: i64| Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(n);
    let campaign = t.campaign("ZIPLINE", Some(10), day(0)).await;
    let first = t.offer(&campaign, day(0), day(3), 5, day(0)).await;

    let summary = worker::run_campaign_batch(&t.state, campaign.id, day(3)).await;
    assert!(summary.failures.is_empty(), "{:?}", summary.failures);
    assert_eq!(summary.archived, 1);
    let report = summary.redistribution.unwrap();
    assert_eq!(report.moved, 5);
    assert_eq!(report.offers_created.len(), 1);
    assert!(t.repo.list_vouchers(first.id).await.unwrap().is_empty());

    // Nothing left to do on the next tick.
    assert_eq!(worker::run_batch(&t.state, "test-worker", day(3)).await, 1);
    let offers = t.repo.list_offers(campaign.id).await.unwrap();
    assert_eq!(offers.len(), 2);
}
