//! Postgres `InventoryRepository`.
//!
//! Each atomic method runs in one database transaction. Rows it validates are
//! locked `FOR UPDATE` first; the claim path picks vouchers with
//! `SKIP LOCKED` so concurrent buyers of one offer do not queue behind each
//! other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction as PgTransaction};
use std::collections::{HashMap, HashSet};
use tracing::error;
use uuid::Uuid;

use tally_core::invariants::{check_budget, ensure_claimable, ensure_movable, may_release, CampaignTally};
use tally_core::{
    BudgetGuard, Campaign, Claim, ClaimRequest, ClaimStatus, EngineError, EngineResult, InventoryRepository,
    Offer, OfferStatus, ReleaseOutcome, Schedule, Transaction, TransactionStatus, Voucher, VoucherMove,
    VoucherMovement, Window,
};

const VOUCHER_CODE_CONSTRAINT: &str = "vouchers_code_key";

fn storage(e: sqlx::Error) -> EngineError {
    if let sqlx::Error::Database(db) = &e {
        if db.constraint() == Some(VOUCHER_CODE_CONSTRAINT) {
            return EngineError::DuplicateCode(db.message().to_string());
        }
    }
    error!("Database error: {}", e);
    EngineError::Storage(e.to_string())
}

#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: Uuid,
    sku: String,
    merchant_id: Uuid,
    owner_user_id: Uuid,
    title: String,
    description: Option<String>,
    price_cents: i64,
    discounted_price_cents: Option<i64>,
    expiry_days: Option<i32>,
    media_collections: Vec<String>,
    agreement_quantity: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CampaignRow> for Campaign {
    fn from(row: CampaignRow) -> Self {
        Campaign {
            id: row.id,
            sku: row.sku,
            merchant_id: row.merchant_id,
            owner_user_id: row.owner_user_id,
            title: row.title,
            description: row.description,
            price_cents: row.price_cents,
            discounted_price_cents: row.discounted_price_cents,
            expiry_days: row.expiry_days,
            media_collections: row.media_collections,
            agreement_quantity: row.agreement_quantity,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: Uuid,
    campaign_id: Uuid,
    available_at: DateTime<Utc>,
    available_until: DateTime<Utc>,
    publish_at: DateTime<Utc>,
    quantity: i64,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ScheduleRow> for Schedule {
    type Error = EngineError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        Ok(Schedule {
            id: row.id,
            campaign_id: row.campaign_id,
            window: Window::new(row.available_at, row.available_until)?,
            publish_at: row.publish_at,
            quantity: row.quantity,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OfferRow {
    id: Uuid,
    campaign_id: Uuid,
    schedule_id: Uuid,
    title: String,
    description: Option<String>,
    price_cents: i64,
    discounted_price_cents: Option<i64>,
    expiry_days: Option<i32>,
    available_at: DateTime<Utc>,
    available_until: DateTime<Utc>,
    publish_at: DateTime<Utc>,
    quantity: i64,
    remaining_quantity: i64,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<OfferRow> for Offer {
    type Error = EngineError;

    fn try_from(row: OfferRow) -> Result<Self, Self::Error> {
        Ok(Offer {
            id: row.id,
            campaign_id: row.campaign_id,
            schedule_id: row.schedule_id,
            title: row.title,
            description: row.description,
            price_cents: row.price_cents,
            discounted_price_cents: row.discounted_price_cents,
            expiry_days: row.expiry_days,
            window: Window::new(row.available_at, row.available_until)?,
            publish_at: row.publish_at,
            quantity: row.quantity,
            remaining_quantity: row.remaining_quantity,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VoucherRow {
    id: Uuid,
    campaign_id: Uuid,
    merchant_offer_id: Uuid,
    code: String,
    owned_by_id: Option<Uuid>,
    held_by_claim_id: Option<Uuid>,
    owned_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<VoucherRow> for Voucher {
    fn from(row: VoucherRow) -> Self {
        Voucher {
            id: row.id,
            campaign_id: row.campaign_id,
            merchant_offer_id: row.merchant_offer_id,
            code: row.code,
            owned_by_id: row.owned_by_id,
            held_by_claim_id: row.held_by_claim_id,
            owned_at: row.owned_at,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MovementRow {
    id: Uuid,
    voucher_id: Uuid,
    from_offer_id: Uuid,
    to_offer_id: Uuid,
    actor_user_id: Option<Uuid>,
    remarks: String,
    created_at: DateTime<Utc>,
}

impl From<MovementRow> for VoucherMovement {
    fn from(row: MovementRow) -> Self {
        VoucherMovement {
            id: row.id,
            voucher_id: row.voucher_id,
            from_offer_id: row.from_offer_id,
            to_offer_id: row.to_offer_id,
            actor_user_id: row.actor_user_id,
            remarks: row.remarks,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    id: Uuid,
    offer_id: Uuid,
    campaign_id: Uuid,
    user_id: Uuid,
    transaction_id: Uuid,
    voucher_ids: Vec<Uuid>,
    quantity: i64,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ClaimRow> for Claim {
    type Error = EngineError;

    fn try_from(row: ClaimRow) -> Result<Self, Self::Error> {
        Ok(Claim {
            id: row.id,
            offer_id: row.offer_id,
            campaign_id: row.campaign_id,
            user_id: row.user_id,
            transaction_id: row.transaction_id,
            voucher_ids: row.voucher_ids,
            quantity: row.quantity,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    claim_id: Uuid,
    user_id: Uuid,
    amount_cents: i64,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = EngineError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: row.id,
            claim_id: row.claim_id,
            user_id: row.user_id,
            amount_cents: row.amount_cents,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TallyRow {
    owned: i64,
    free: i64,
    held: i64,
    deleted: i64,
}

const CAMPAIGN_COLUMNS: &str = "id, sku, merchant_id, owner_user_id, title, description, price_cents, \
     discounted_price_cents, expiry_days, media_collections, agreement_quantity, created_at, updated_at";

const SCHEDULE_COLUMNS: &str =
    "id, campaign_id, available_at, available_until, publish_at, quantity, status, created_at";

const OFFER_COLUMNS: &str = "id, campaign_id, schedule_id, title, description, price_cents, \
     discounted_price_cents, expiry_days, available_at, available_until, publish_at, quantity, \
     remaining_quantity, status, created_at";

const VOUCHER_COLUMNS: &str =
    "id, campaign_id, merchant_offer_id, code, owned_by_id, held_by_claim_id, owned_at, created_at";

const MOVEMENT_COLUMNS: &str = "id, voucher_id, from_offer_id, to_offer_id, actor_user_id, remarks, created_at";

const TRANSACTION_COLUMNS: &str = "id, claim_id, user_id, amount_cents, status, created_at, updated_at";

const CLAIM_SELECT: &str = r#"
    SELECT c.id, c.offer_id, c.campaign_id, c.user_id, c.transaction_id, c.quantity, c.status,
           c.created_at, c.updated_at,
           COALESCE(array_agg(cv.voucher_id ORDER BY cv.voucher_id) FILTER (WHERE cv.voucher_id IS NOT NULL),
                    ARRAY[]::uuid[]) AS voucher_ids
    FROM claims c
    LEFT JOIN claim_vouchers cv ON cv.claim_id = c.id
"#;

pub struct PostgresInventoryRepository {
    pool: PgPool,
}

impl PostgresInventoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> EngineResult<PgTransaction<'static, Postgres>> {
        self.pool.begin().await.map_err(storage)
    }

    async fn lock_vouchers(
        tx: &mut PgTransaction<'static, Postgres>,
        ids: &[Uuid],
    ) -> EngineResult<HashMap<Uuid, Voucher>> {
        let sql = format!(
            "SELECT {} FROM vouchers WHERE id = ANY($1) ORDER BY id FOR UPDATE",
            VOUCHER_COLUMNS
        );
        let rows = sqlx::query_as::<_, VoucherRow>(&sql)
            .bind(ids)
            .fetch_all(&mut **tx)
            .await
            .map_err(storage)?;
        Ok(rows.into_iter().map(|r| (r.id, Voucher::from(r))).collect())
    }

    async fn lock_claim(tx: &mut PgTransaction<'static, Postgres>, claim_id: Uuid) -> EngineResult<Claim> {
        sqlx::query("SELECT id FROM claims WHERE id = $1 FOR UPDATE")
            .bind(claim_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(storage)?
            .ok_or_else(|| EngineError::not_found("claim", claim_id))?;
        let sql = format!("{} WHERE c.id = $1 GROUP BY c.id", CLAIM_SELECT);
        sqlx::query_as::<_, ClaimRow>(&sql)
            .bind(claim_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(storage)?
            .try_into()
    }

    async fn set_transaction_status(
        tx: &mut PgTransaction<'static, Postgres>,
        transaction_id: Uuid,
        status: TransactionStatus,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM transactions WHERE id = $1 FOR UPDATE")
                .bind(transaction_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(storage)?;
        let Some(current) = current else {
            return Ok(());
        };
        let next = current.parse::<TransactionStatus>()?.transition(status)?;
        sqlx::query("UPDATE transactions SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(transaction_id)
            .bind(next.as_str())
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn fetch_claims(&self, filter: &str, bind_time: Option<DateTime<Utc>>) -> EngineResult<Vec<Claim>> {
        let sql = format!("{} {} GROUP BY c.id ORDER BY c.created_at, c.id", CLAIM_SELECT, filter);
        let mut query = sqlx::query_as::<_, ClaimRow>(&sql);
        if let Some(at) = bind_time {
            query = query.bind(at);
        }
        query
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?
            .into_iter()
            .map(Claim::try_from)
            .collect()
    }
}

#[async_trait]
impl InventoryRepository for PostgresInventoryRepository {
    async fn insert_campaign(&self, campaign: &Campaign) -> EngineResult<()> {
        let sql = format!(
            "INSERT INTO campaigns ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            CAMPAIGN_COLUMNS
        );
        sqlx::query(&sql)
            .bind(campaign.id)
            .bind(&campaign.sku)
            .bind(campaign.merchant_id)
            .bind(campaign.owner_user_id)
            .bind(&campaign.title)
            .bind(&campaign.description)
            .bind(campaign.price_cents)
            .bind(campaign.discounted_price_cents)
            .bind(campaign.expiry_days)
            .bind(&campaign.media_collections)
            .bind(campaign.agreement_quantity)
            .bind(campaign.created_at)
            .bind(campaign.updated_at)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> EngineResult<Option<Campaign>> {
        let sql = format!("SELECT {} FROM campaigns WHERE id = $1", CAMPAIGN_COLUMNS);
        let row = sqlx::query_as::<_, CampaignRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(Campaign::from))
    }

    async fn find_campaign_by_sku(&self, sku: &str) -> EngineResult<Option<Campaign>> {
        let sql = format!("SELECT {} FROM campaigns WHERE sku = $1", CAMPAIGN_COLUMNS);
        let row = sqlx::query_as::<_, CampaignRow>(&sql)
            .bind(sku)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(Campaign::from))
    }

    async fn list_campaigns(&self) -> EngineResult<Vec<Campaign>> {
        let sql = format!("SELECT {} FROM campaigns ORDER BY created_at, id", CAMPAIGN_COLUMNS);
        let rows = sqlx::query_as::<_, CampaignRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        Ok(rows.into_iter().map(Campaign::from).collect())
    }

    async fn update_agreement_quantity(
        &self,
        campaign_id: Uuid,
        agreement_quantity: Option<i64>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let result = sqlx::query("UPDATE campaigns SET agreement_quantity = $2, updated_at = $3 WHERE id = $1")
            .bind(campaign_id)
            .bind(agreement_quantity)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("campaign", campaign_id));
        }
        Ok(())
    }

    async fn insert_schedule(&self, schedule: &Schedule) -> EngineResult<()> {
        let sql = format!(
            "INSERT INTO schedules ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            SCHEDULE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(schedule.id)
            .bind(schedule.campaign_id)
            .bind(schedule.window.available_at)
            .bind(schedule.window.available_until)
            .bind(schedule.publish_at)
            .bind(schedule.quantity)
            .bind(schedule.status.as_str())
            .bind(schedule.created_at)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> EngineResult<Option<Schedule>> {
        let sql = format!("SELECT {} FROM schedules WHERE id = $1", SCHEDULE_COLUMNS);
        sqlx::query_as::<_, ScheduleRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .map(Schedule::try_from)
            .transpose()
    }

    async fn list_schedules(&self, campaign_id: Uuid) -> EngineResult<Vec<Schedule>> {
        let sql = format!(
            "SELECT {} FROM schedules WHERE campaign_id = $1 ORDER BY created_at, id",
            SCHEDULE_COLUMNS
        );
        sqlx::query_as::<_, ScheduleRow>(&sql)
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?
            .into_iter()
            .map(Schedule::try_from)
            .collect()
    }

    async fn latest_schedule_end(&self, campaign_id: Uuid) -> EngineResult<Option<DateTime<Utc>>> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(available_until) FROM schedules WHERE campaign_id = $1",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)
    }

    async fn set_schedule_status(&self, schedule_id: Uuid, status: OfferStatus) -> EngineResult<()> {
        let mut tx = self.begin().await?;
        let current: String = sqlx::query_scalar("SELECT status FROM schedules WHERE id = $1 FOR UPDATE")
            .bind(schedule_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .ok_or_else(|| EngineError::not_found("schedule", schedule_id))?;
        let next = current.parse::<OfferStatus>()?.transition(status)?;
        sqlx::query("UPDATE schedules SET status = $2 WHERE id = $1")
            .bind(schedule_id)
            .bind(next.as_str())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)
    }

    async fn delete_schedule_if_unreferenced(&self, schedule_id: Uuid) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM schedules s
            WHERE s.id = $1
              AND NOT EXISTS (SELECT 1 FROM offers o WHERE o.schedule_id = s.id)
            "#,
        )
        .bind(schedule_id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_offer(&self, id: Uuid) -> EngineResult<Option<Offer>> {
        let sql = format!("SELECT {} FROM offers WHERE id = $1", OFFER_COLUMNS);
        sqlx::query_as::<_, OfferRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .map(Offer::try_from)
            .transpose()
    }

    async fn list_offers(&self, campaign_id: Uuid) -> EngineResult<Vec<Offer>> {
        let sql = format!(
            "SELECT {} FROM offers WHERE campaign_id = $1 ORDER BY created_at, id",
            OFFER_COLUMNS
        );
        sqlx::query_as::<_, OfferRow>(&sql)
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?
            .into_iter()
            .map(Offer::try_from)
            .collect()
    }

    async fn offers_for_schedule(&self, schedule_id: Uuid) -> EngineResult<Vec<Offer>> {
        let sql = format!(
            "SELECT {} FROM offers WHERE schedule_id = $1 ORDER BY created_at, id",
            OFFER_COLUMNS
        );
        sqlx::query_as::<_, OfferRow>(&sql)
            .bind(schedule_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?
            .into_iter()
            .map(Offer::try_from)
            .collect()
    }

    async fn materialize_offer(&self, offer: &Offer, vouchers: &[Voucher]) -> EngineResult<()> {
        let mut tx = self.begin().await?;

        let schedule: Option<Uuid> = sqlx::query_scalar("SELECT id FROM schedules WHERE id = $1 FOR UPDATE")
            .bind(offer.schedule_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;
        if schedule.is_none() {
            return Err(EngineError::OrphanedReference(format!(
                "offer {} references missing schedule {}",
                offer.id, offer.schedule_id
            )));
        }
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM offers WHERE schedule_id = $1")
            .bind(offer.schedule_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage)?;
        if existing > 0 {
            return Err(EngineError::AlreadyMaterialized(offer.schedule_id));
        }
        if let Some(stray) = vouchers
            .iter()
            .find(|v| v.merchant_offer_id != offer.id || v.campaign_id != offer.campaign_id)
        {
            return Err(EngineError::Validation(format!(
                "voucher {} does not belong to offer {}",
                stray.id, offer.id
            )));
        }

        let sql = format!(
            "INSERT INTO offers ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            OFFER_COLUMNS
        );
        sqlx::query(&sql)
            .bind(offer.id)
            .bind(offer.campaign_id)
            .bind(offer.schedule_id)
            .bind(&offer.title)
            .bind(&offer.description)
            .bind(offer.price_cents)
            .bind(offer.discounted_price_cents)
            .bind(offer.expiry_days)
            .bind(offer.window.available_at)
            .bind(offer.window.available_until)
            .bind(offer.publish_at)
            .bind(offer.quantity)
            .bind(offer.remaining_quantity)
            .bind(offer.status.as_str())
            .bind(offer.created_at)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        if !vouchers.is_empty() {
            let ids: Vec<Uuid> = vouchers.iter().map(|v| v.id).collect();
            let codes: Vec<String> = vouchers.iter().map(|v| v.code.clone()).collect();
            let created: Vec<DateTime<Utc>> = vouchers.iter().map(|v| v.created_at).collect();
            sqlx::query(
                r#"
                INSERT INTO vouchers (id, campaign_id, merchant_offer_id, code, created_at)
                SELECT id, $2, $3, code, created_at
                FROM UNNEST($1::uuid[], $4::text[], $5::timestamptz[]) AS batch(id, code, created_at)
                "#,
            )
            .bind(&ids)
            .bind(offer.campaign_id)
            .bind(offer.id)
            .bind(&codes)
            .bind(&created)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)
    }

    async fn update_offer_status(&self, offer_id: Uuid, status: OfferStatus) -> EngineResult<()> {
        let mut tx = self.begin().await?;
        let current: String = sqlx::query_scalar("SELECT status FROM offers WHERE id = $1 FOR UPDATE")
            .bind(offer_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .ok_or_else(|| EngineError::not_found("offer", offer_id))?;
        let next = current.parse::<OfferStatus>()?.transition(status)?;
        sqlx::query("UPDATE offers SET status = $2 WHERE id = $1")
            .bind(offer_id)
            .bind(next.as_str())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)
    }

    async fn repoint_offer(
        &self,
        offer_id: Uuid,
        schedule_id: Uuid,
        window: Window,
        status: OfferStatus,
    ) -> EngineResult<()> {
        let mut tx = self.begin().await?;
        let schedule: Option<Uuid> = sqlx::query_scalar("SELECT id FROM schedules WHERE id = $1")
            .bind(schedule_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;
        if schedule.is_none() {
            return Err(EngineError::not_found("schedule", schedule_id));
        }
        let current: String = sqlx::query_scalar("SELECT status FROM offers WHERE id = $1 FOR UPDATE")
            .bind(offer_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .ok_or_else(|| EngineError::not_found("offer", offer_id))?;
        let next = current.parse::<OfferStatus>()?.transition(status)?;
        sqlx::query(
            r#"
            UPDATE offers
            SET schedule_id = $2, available_at = $3, available_until = $4, status = $5
            WHERE id = $1
            "#,
        )
        .bind(offer_id)
        .bind(schedule_id)
        .bind(window.available_at)
        .bind(window.available_until)
        .bind(next.as_str())
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        tx.commit().await.map_err(storage)
    }

    async fn delete_offer_if_unsold(&self, offer_id: Uuid, now: DateTime<Utc>) -> EngineResult<Option<i64>> {
        let mut tx = self.begin().await?;
        let campaign_id: Uuid = sqlx::query_scalar("SELECT campaign_id FROM offers WHERE id = $1 FOR UPDATE")
            .bind(offer_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .ok_or_else(|| EngineError::not_found("offer", offer_id))?;

        let sql = format!(
            "SELECT {} FROM vouchers WHERE merchant_offer_id = $1 ORDER BY id FOR UPDATE",
            VOUCHER_COLUMNS
        );
        let vouchers = sqlx::query_as::<_, VoucherRow>(&sql)
            .bind(offer_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage)?;
        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM claims WHERE offer_id = $1 AND status = 'await_payment'")
                .bind(offer_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(storage)?;
        let sold = vouchers
            .iter()
            .any(|v| v.owned_by_id.is_some() || v.held_by_claim_id.is_some());
        if sold || pending > 0 {
            tx.rollback().await.map_err(storage)?;
            return Ok(None);
        }

        let deleted = sqlx::query("DELETE FROM vouchers WHERE merchant_offer_id = $1")
            .bind(offer_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?
            .rows_affected() as i64;
        if deleted > 0 {
            sqlx::query(
                "INSERT INTO voucher_deletions (id, campaign_id, offer_id, count, created_at) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(Uuid::new_v4())
            .bind(campaign_id)
            .bind(offer_id)
            .bind(deleted)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }
        sqlx::query("DELETE FROM offers WHERE id = $1")
            .bind(offer_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(Some(deleted))
    }

    async fn get_voucher(&self, id: Uuid) -> EngineResult<Option<Voucher>> {
        let sql = format!("SELECT {} FROM vouchers WHERE id = $1", VOUCHER_COLUMNS);
        let row = sqlx::query_as::<_, VoucherRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(Voucher::from))
    }

    async fn list_vouchers(&self, offer_id: Uuid) -> EngineResult<Vec<Voucher>> {
        let sql = format!(
            "SELECT {} FROM vouchers WHERE merchant_offer_id = $1 ORDER BY created_at, id",
            VOUCHER_COLUMNS
        );
        let rows = sqlx::query_as::<_, VoucherRow>(&sql)
            .bind(offer_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        Ok(rows.into_iter().map(Voucher::from).collect())
    }

    async fn list_campaign_vouchers(&self, campaign_id: Uuid) -> EngineResult<Vec<Voucher>> {
        let sql = format!(
            "SELECT {} FROM vouchers WHERE campaign_id = $1 ORDER BY created_at, id",
            VOUCHER_COLUMNS
        );
        let rows = sqlx::query_as::<_, VoucherRow>(&sql)
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        Ok(rows.into_iter().map(Voucher::from).collect())
    }

    async fn campaign_tally(&self, campaign_id: Uuid) -> EngineResult<CampaignTally> {
        let row = sqlx::query_as::<_, TallyRow>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE owned_by_id IS NOT NULL) AS owned,
                COUNT(*) FILTER (WHERE owned_by_id IS NULL AND held_by_claim_id IS NULL) AS free,
                COUNT(*) FILTER (WHERE owned_by_id IS NULL AND held_by_claim_id IS NOT NULL) AS held,
                (SELECT COALESCE(SUM(count), 0)::BIGINT FROM voucher_deletions WHERE campaign_id = $1) AS deleted
            FROM vouchers
            WHERE campaign_id = $1
            "#,
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(CampaignTally {
            owned: row.owned,
            free: row.free,
            held: row.held,
            deleted: row.deleted,
        })
    }

    async fn free_vouchers_in_elapsed_offers(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<Voucher>> {
        let rows = sqlx::query_as::<_, VoucherRow>(
            r#"
            SELECT v.id, v.campaign_id, v.merchant_offer_id, v.code, v.owned_by_id, v.held_by_claim_id,
                   v.owned_at, v.created_at
            FROM vouchers v
            JOIN offers o ON o.id = v.merchant_offer_id
            WHERE v.campaign_id = $1
              AND o.available_until <= $2
              AND v.owned_by_id IS NULL
              AND v.held_by_claim_id IS NULL
            ORDER BY v.created_at, v.id
            "#,
        )
        .bind(campaign_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows.into_iter().map(Voucher::from).collect())
    }

    async fn move_vouchers(
        &self,
        moves: &[VoucherMove],
        guard: Option<BudgetGuard>,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<VoucherMovement>> {
        let mut tx = self.begin().await?;

        if let Some(guard) = guard {
            let agreement: Option<i64> =
                sqlx::query_scalar("SELECT agreement_quantity FROM campaigns WHERE id = $1 FOR UPDATE")
                    .bind(guard.campaign_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage)?
                    .ok_or_else(|| EngineError::not_found("campaign", guard.campaign_id))?;
            let owned: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM vouchers WHERE campaign_id = $1 AND owned_by_id IS NOT NULL",
            )
            .bind(guard.campaign_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage)?;
            check_budget(guard.campaign_id, agreement, owned, guard.requested)?;
        }

        let mut seen = HashSet::new();
        for mv in moves {
            if !seen.insert(mv.voucher_id) {
                return Err(EngineError::Validation(format!("voucher {} listed twice", mv.voucher_id)));
            }
        }

        let ids: Vec<Uuid> = moves.iter().map(|m| m.voucher_id).collect();
        let vouchers = Self::lock_vouchers(&mut tx, &ids).await?;

        let targets: Vec<Uuid> = moves.iter().map(|m| m.to_offer_id).collect();
        let target_campaigns: HashMap<Uuid, Uuid> =
            sqlx::query_as::<_, (Uuid, Uuid)>("SELECT id, campaign_id FROM offers WHERE id = ANY($1)")
                .bind(&targets)
                .fetch_all(&mut *tx)
                .await
                .map_err(storage)?
                .into_iter()
                .collect();

        for mv in moves {
            let voucher = vouchers
                .get(&mv.voucher_id)
                .ok_or_else(|| EngineError::not_found("voucher", mv.voucher_id))?;
            ensure_movable(voucher, mv.from_offer_id, mv.to_offer_id)?;
            let target_campaign = target_campaigns
                .get(&mv.to_offer_id)
                .ok_or_else(|| EngineError::not_found("offer", mv.to_offer_id))?;
            if *target_campaign != voucher.campaign_id {
                return Err(EngineError::Validation(format!(
                    "offer {} belongs to another campaign than voucher {}",
                    mv.to_offer_id, voucher.id
                )));
            }
        }

        let mut movements = Vec::with_capacity(moves.len());
        for mv in moves {
            sqlx::query("UPDATE vouchers SET merchant_offer_id = $2 WHERE id = $1")
                .bind(mv.voucher_id)
                .bind(mv.to_offer_id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            sqlx::query("UPDATE offers SET remaining_quantity = GREATEST(remaining_quantity - 1, 0) WHERE id = $1")
                .bind(mv.from_offer_id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            sqlx::query("UPDATE offers SET remaining_quantity = remaining_quantity + 1 WHERE id = $1")
                .bind(mv.to_offer_id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;

            let movement = VoucherMovement {
                id: Uuid::new_v4(),
                voucher_id: mv.voucher_id,
                from_offer_id: mv.from_offer_id,
                to_offer_id: mv.to_offer_id,
                actor_user_id: mv.actor_user_id,
                remarks: mv.remarks.clone(),
                created_at: now,
            };
            let sql = format!(
                "INSERT INTO voucher_movements ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                MOVEMENT_COLUMNS
            );
            sqlx::query(&sql)
                .bind(movement.id)
                .bind(movement.voucher_id)
                .bind(movement.from_offer_id)
                .bind(movement.to_offer_id)
                .bind(movement.actor_user_id)
                .bind(&movement.remarks)
                .bind(movement.created_at)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            movements.push(movement);
        }

        tx.commit().await.map_err(storage)?;
        Ok(movements)
    }

    async fn list_movements(&self, campaign_id: Uuid) -> EngineResult<Vec<VoucherMovement>> {
        let sql = format!(
            r#"
            SELECT {} FROM voucher_movements
            WHERE voucher_id IN (SELECT id FROM vouchers WHERE campaign_id = $1)
               OR to_offer_id IN (SELECT id FROM offers WHERE campaign_id = $1)
            ORDER BY created_at, id
            "#,
            MOVEMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, MovementRow>(&sql)
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        Ok(rows.into_iter().map(VoucherMovement::from).collect())
    }

    async fn reserve_vouchers(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<(Claim, Transaction)> {
        let mut tx = self.begin().await?;

        let sql = format!("SELECT {} FROM offers WHERE id = $1", OFFER_COLUMNS);
        let offer: Offer = sqlx::query_as::<_, OfferRow>(&sql)
            .bind(request.offer_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .ok_or_else(|| EngineError::not_found("offer", request.offer_id))?
            .try_into()?;
        ensure_claimable(&offer, request.quantity, now)?;

        let picked: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM vouchers
            WHERE merchant_offer_id = $1 AND owned_by_id IS NULL AND held_by_claim_id IS NULL
            ORDER BY created_at, id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(offer.id)
        .bind(request.quantity)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;
        if (picked.len() as i64) < request.quantity {
            tx.rollback().await.map_err(storage)?;
            return Err(EngineError::OutOfStock {
                offer_id: offer.id,
                requested: request.quantity,
                available: picked.len() as i64,
            });
        }

        let claim = Claim {
            id: Uuid::new_v4(),
            offer_id: offer.id,
            campaign_id: offer.campaign_id,
            user_id: request.user_id,
            transaction_id: Uuid::new_v4(),
            voucher_ids: picked.clone(),
            quantity: request.quantity,
            status: ClaimStatus::AwaitPayment,
            created_at: now,
            updated_at: now,
        };
        let transaction = Transaction {
            id: claim.transaction_id,
            claim_id: claim.id,
            user_id: request.user_id,
            amount_cents: request.amount_cents,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO claims (id, offer_id, campaign_id, user_id, transaction_id, quantity, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(claim.id)
        .bind(claim.offer_id)
        .bind(claim.campaign_id)
        .bind(claim.user_id)
        .bind(claim.transaction_id)
        .bind(claim.quantity)
        .bind(claim.status.as_str())
        .bind(claim.created_at)
        .bind(claim.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query("INSERT INTO claim_vouchers (claim_id, voucher_id) SELECT $1, UNNEST($2::uuid[])")
            .bind(claim.id)
            .bind(&picked)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        let sql = format!(
            "INSERT INTO transactions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            TRANSACTION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(transaction.id)
            .bind(transaction.claim_id)
            .bind(transaction.user_id)
            .bind(transaction.amount_cents)
            .bind(transaction.status.as_str())
            .bind(transaction.created_at)
            .bind(transaction.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        sqlx::query("UPDATE vouchers SET held_by_claim_id = $1 WHERE id = ANY($2)")
            .bind(claim.id)
            .bind(&picked)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query("UPDATE offers SET remaining_quantity = GREATEST(remaining_quantity - $2, 0) WHERE id = $1")
            .bind(offer.id)
            .bind(request.quantity)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok((claim, transaction))
    }

    async fn get_claim(&self, id: Uuid) -> EngineResult<Option<Claim>> {
        let sql = format!("{} WHERE c.id = $1 GROUP BY c.id", CLAIM_SELECT);
        sqlx::query_as::<_, ClaimRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .map(Claim::try_from)
            .transpose()
    }

    async fn get_transaction(&self, id: Uuid) -> EngineResult<Option<Transaction>> {
        let sql = format!("SELECT {} FROM transactions WHERE id = $1", TRANSACTION_COLUMNS);
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn confirm_claim(&self, claim_id: Uuid, now: DateTime<Utc>) -> EngineResult<Claim> {
        let mut tx = self.begin().await?;
        let mut claim = Self::lock_claim(&mut tx, claim_id).await?;
        if claim.status == ClaimStatus::Success {
            tx.rollback().await.map_err(storage)?;
            return Ok(claim);
        }
        claim.status = claim.status.transition(ClaimStatus::Success)?;

        let vouchers = Self::lock_vouchers(&mut tx, &claim.voucher_ids).await?;
        for voucher_id in &claim.voucher_ids {
            let held = vouchers
                .get(voucher_id)
                .is_some_and(|v| !v.is_owned() && v.held_by_claim_id == Some(claim.id));
            if !held {
                return Err(EngineError::Validation(format!(
                    "voucher {} is no longer held by claim {}",
                    voucher_id, claim.id
                )));
            }
        }

        sqlx::query(
            "UPDATE vouchers SET owned_by_id = $2, owned_at = $3, held_by_claim_id = NULL WHERE id = ANY($1)",
        )
        .bind(&claim.voucher_ids)
        .bind(claim.user_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        Self::set_transaction_status(&mut tx, claim.transaction_id, TransactionStatus::Success, now).await?;
        sqlx::query("UPDATE claims SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(claim.id)
            .bind(claim.status.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        claim.updated_at = now;
        Ok(claim)
    }

    async fn release_claim(&self, claim_id: Uuid, now: DateTime<Utc>) -> EngineResult<ReleaseOutcome> {
        let mut tx = self.begin().await?;
        let mut claim = Self::lock_claim(&mut tx, claim_id).await?;
        if claim.status == ClaimStatus::Failed {
            tx.rollback().await.map_err(storage)?;
            return Ok(ReleaseOutcome {
                claim,
                freed: 0,
                already_released: true,
            });
        }
        claim.status = claim.status.transition(ClaimStatus::Failed)?;

        let vouchers = Self::lock_vouchers(&mut tx, &claim.voucher_ids).await?;
        let sql = format!(
            "{} WHERE c.id <> $1 AND c.status = 'success' AND c.id IN \
             (SELECT claim_id FROM claim_vouchers WHERE voucher_id = ANY($2)) GROUP BY c.id",
            CLAIM_SELECT
        );
        let others: Vec<Claim> = sqlx::query_as::<_, ClaimRow>(&sql)
            .bind(claim.id)
            .bind(&claim.voucher_ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage)?
            .into_iter()
            .map(Claim::try_from)
            .collect::<EngineResult<_>>()?;

        let releasable: Vec<Uuid> = claim
            .voucher_ids
            .iter()
            .filter(|id| vouchers.get(*id).is_some_and(|v| may_release(v, &claim, &others)))
            .copied()
            .collect();

        sqlx::query("UPDATE vouchers SET held_by_claim_id = NULL WHERE id = ANY($1) AND held_by_claim_id = $2")
            .bind(&releasable)
            .bind(claim.id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        let freed = releasable.len() as i64;
        sqlx::query("UPDATE offers SET remaining_quantity = remaining_quantity + $2 WHERE id = $1")
            .bind(claim.offer_id)
            .bind(freed)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        Self::set_transaction_status(&mut tx, claim.transaction_id, TransactionStatus::Failed, now).await?;
        sqlx::query("UPDATE claims SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(claim.id)
            .bind(claim.status.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        claim.updated_at = now;
        Ok(ReleaseOutcome {
            claim,
            freed,
            already_released: false,
        })
    }

    async fn list_pending_claims_before(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Claim>> {
        self.fetch_claims("WHERE c.status = 'await_payment' AND c.created_at < $1", Some(cutoff))
            .await
    }

    async fn pending_claim_count(&self, offer_id: Uuid) -> EngineResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM claims WHERE offer_id = $1 AND status = 'await_payment'")
            .bind(offer_id)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)
    }
}
