use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tally_core::models::{Campaign, Offer, Schedule};

/// Media collections copied from a campaign when it names none itself.
pub const DEFAULT_MEDIA_COLLECTIONS: [&str; 2] = ["gallery", "banner"];

/// Campaign with empty template fields, ready for an operator to fill in.
pub fn draft_campaign(
    sku: &str,
    owner_user_id: Uuid,
    agreement_quantity: Option<i64>,
    now: DateTime<Utc>,
) -> Campaign {
    Campaign {
        id: Uuid::new_v4(),
        sku: sku.to_string(),
        merchant_id: Uuid::new_v4(),
        owner_user_id,
        title: sku.to_string(),
        description: None,
        price_cents: 0,
        discounted_price_cents: None,
        expiry_days: None,
        media_collections: Vec::new(),
        agreement_quantity,
        created_at: now,
        updated_at: now,
    }
}

/// The campaign attributes every offer carries a denormalized copy of.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferTemplate {
    pub campaign_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub discounted_price_cents: Option<i64>,
    pub expiry_days: Option<i32>,
    pub media_collections: Vec<String>,
}

impl OfferTemplate {
    pub fn from_campaign(campaign: &Campaign) -> Self {
        let media_collections = if campaign.media_collections.is_empty() {
            DEFAULT_MEDIA_COLLECTIONS.iter().map(|c| c.to_string()).collect()
        } else {
            campaign.media_collections.clone()
        };

        Self {
            campaign_id: campaign.id,
            title: campaign.title.clone(),
            description: campaign.description.clone(),
            price_cents: campaign.price_cents,
            discounted_price_cents: campaign.discounted_price_cents,
            expiry_days: campaign.expiry_days,
            media_collections,
        }
    }

    /// Offer for `schedule` with `quantity` units, status derived from `now`.
    pub fn offer_for(&self, schedule: &Schedule, quantity: i64, now: DateTime<Utc>) -> Offer {
        Offer {
            id: Uuid::new_v4(),
            campaign_id: self.campaign_id,
            schedule_id: schedule.id,
            title: self.title.clone(),
            description: self.description.clone(),
            price_cents: self.price_cents,
            discounted_price_cents: self.discounted_price_cents,
            expiry_days: self.expiry_days,
            window: schedule.window,
            publish_at: schedule.publish_at,
            quantity,
            remaining_quantity: quantity,
            status: tally_core::OfferStatus::for_window(&schedule.window, schedule.publish_at, now),
            created_at: now,
        }
    }

    /// Price a buyer pays per voucher.
    pub fn unit_price_cents(&self) -> i64 {
        self.discounted_price_cents.unwrap_or(self.price_cents)
    }
}
