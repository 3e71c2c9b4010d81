use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Whether a batch operation writes or only reports what it would do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    #[default]
    Apply,
}

impl RunMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            RunMode::DryRun
        } else {
            RunMode::Apply
        }
    }

    pub fn is_dry_run(self) -> bool {
        self == RunMode::DryRun
    }
}

/// Half-open selling window `[available_at, available_until)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    pub available_at: DateTime<Utc>,
    pub available_until: DateTime<Utc>,
}

impl Window {
    pub fn new(available_at: DateTime<Utc>, available_until: DateTime<Utc>) -> EngineResult<Self> {
        if available_until <= available_at {
            return Err(EngineError::Validation(format!(
                "window end {} must be after start {}",
                available_until, available_at
            )));
        }
        Ok(Self {
            available_at,
            available_until,
        })
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now && now < self.available_until
    }

    pub fn is_elapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.available_until
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.available_at < other.available_until && other.available_at < self.available_until
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.available_at.to_rfc3339(), self.available_until.to_rfc3339())
    }
}

/// Lifecycle shared by offers and the schedules they mirror.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Draft,
    Published,
    Archived,
}

impl OfferStatus {
    /// draft -> published -> archived, plus draft -> archived for offers whose
    /// window ran out before they were ever published. Archived is terminal.
    pub fn can_transition_to(self, next: OfferStatus) -> bool {
        use OfferStatus::*;
        self == next || matches!((self, next), (Draft, Published) | (Draft, Archived) | (Published, Archived))
    }

    pub fn transition(self, next: OfferStatus) -> EngineResult<OfferStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(EngineError::InvalidTransition {
                entity: "offer",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Status implied by the window alone at the evaluation timestamp.
    pub fn for_window(window: &Window, publish_at: DateTime<Utc>, now: DateTime<Utc>) -> OfferStatus {
        if window.is_elapsed(now) {
            OfferStatus::Archived
        } else if now >= publish_at && now >= window.available_at {
            OfferStatus::Published
        } else {
            OfferStatus::Draft
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OfferStatus::Draft => "draft",
            OfferStatus::Published => "published",
            OfferStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OfferStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(OfferStatus::Draft),
            "published" => Ok(OfferStatus::Published),
            "archived" => Ok(OfferStatus::Archived),
            other => Err(EngineError::Validation(format!("unknown offer status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    AwaitPayment,
    Success,
    Failed,
}

impl ClaimStatus {
    /// Re-applying the current status is accepted so that confirm and release
    /// stay idempotent.
    pub fn transition(self, next: ClaimStatus) -> EngineResult<ClaimStatus> {
        use ClaimStatus::*;
        match (self, next) {
            (a, b) if a == b => Ok(next),
            (AwaitPayment, Success) | (AwaitPayment, Failed) => Ok(next),
            _ => Err(EngineError::InvalidTransition {
                entity: "claim",
                from: self.to_string(),
                to: next.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::AwaitPayment => "await_payment",
            ClaimStatus::Success => "success",
            ClaimStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "await_payment" => Ok(ClaimStatus::AwaitPayment),
            "success" => Ok(ClaimStatus::Success),
            "failed" => Ok(ClaimStatus::Failed),
            other => Err(EngineError::Validation(format!("unknown claim status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn transition(self, next: TransactionStatus) -> EngineResult<TransactionStatus> {
        use TransactionStatus::*;
        match (self, next) {
            (a, b) if a == b => Ok(next),
            (Pending, Success) | (Pending, Failed) => Ok(next),
            _ => Err(EngineError::InvalidTransition {
                entity: "transaction",
                from: self.to_string(),
                to: next.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "success" => Ok(TransactionStatus::Success),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(EngineError::Validation(format!("unknown transaction status '{}'", other))),
        }
    }
}

/// A merchant's promotional commitment and the template its offers copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Campaign {
    pub id: Uuid,
    pub sku: String,
    pub merchant_id: Uuid,
    pub owner_user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub discounted_price_cents: Option<i64>,
    pub expiry_days: Option<i32>,
    pub media_collections: Vec<String>,
    /// `None` means the campaign has no budget ceiling.
    pub agreement_quantity: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub window: Window,
    pub publish_at: DateTime<Utc>,
    pub quantity: i64,
    pub status: OfferStatus,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(campaign_id: Uuid, window: Window, quantity: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            window,
            publish_at: window.available_at,
            quantity,
            status: OfferStatus::for_window(&window, window.available_at, now),
            created_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status != OfferStatus::Archived
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Offer {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub schedule_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub discounted_price_cents: Option<i64>,
    pub expiry_days: Option<i32>,
    pub window: Window,
    pub publish_at: DateTime<Utc>,
    pub quantity: i64,
    pub remaining_quantity: i64,
    pub status: OfferStatus,
    pub created_at: DateTime<Utc>,
}

impl Offer {
    /// Whether a buyer may reserve from this offer at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == OfferStatus::Published && self.window.contains(now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Voucher {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub merchant_offer_id: Uuid,
    pub code: String,
    pub owned_by_id: Option<Uuid>,
    pub held_by_claim_id: Option<Uuid>,
    pub owned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Voucher {
    pub fn new(campaign_id: Uuid, offer_id: Uuid, code: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            merchant_offer_id: offer_id,
            code,
            owned_by_id: None,
            held_by_claim_id: None,
            owned_at: None,
            created_at: now,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.owned_by_id.is_some()
    }

    pub fn is_held(&self) -> bool {
        self.held_by_claim_id.is_some()
    }

    pub fn is_free(&self) -> bool {
        !self.is_owned() && !self.is_held()
    }
}

/// Append-only audit row, one per change of `merchant_offer_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoucherMovement {
    pub id: Uuid,
    pub voucher_id: Uuid,
    pub from_offer_id: Uuid,
    pub to_offer_id: Uuid,
    pub actor_user_id: Option<Uuid>,
    pub remarks: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claim {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub campaign_id: Uuid,
    pub user_id: Uuid,
    pub transaction_id: Uuid,
    pub voucher_ids: Vec<Uuid>,
    pub quantity: i64,
    pub status: ClaimStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: Uuid,
    pub claim_id: Uuid,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
