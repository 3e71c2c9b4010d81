use uuid::Uuid;

pub const TOPIC_OFFER_REINDEX: &str = "offers.reindex";
pub const TOPIC_VOUCHER_MOVED: &str = "vouchers.moved";
pub const TOPIC_BATCH_SUMMARY: &str = "batch.summary";

/// Asks the search collaborator to refresh one offer (and its store listing).
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct OfferReindexEvent {
    pub offer_id: Uuid,
    pub reason: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct VoucherMovedEvent {
    pub voucher_id: Uuid,
    pub from_offer_id: Uuid,
    pub to_offer_id: Uuid,
    pub actor_user_id: Option<Uuid>,
    pub remarks: String,
    pub timestamp: i64,
}

/// Audit summary of one batch run, one per campaign touched.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct BatchSummaryEvent {
    pub job: String,
    pub campaign_id: Option<Uuid>,
    pub dry_run: bool,
    pub counts: serde_json::Value,
    pub timestamp: i64,
}
