use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use tally_core::{Claim, EngineError, EngineResult, TransactionStatus};

use crate::claims::ClaimManager;

/// Payment gateway notification as it arrives on the webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentNotification {
    pub transaction_id: Uuid,
    pub status: String,
    pub reference: Option<String>,
}

/// Maps gateway vocabulary onto transaction status.
pub fn parse_gateway_status(status: &str) -> EngineResult<TransactionStatus> {
    match status.to_ascii_lowercase().as_str() {
        "success" | "succeeded" | "paid" | "settlement" | "capture" => Ok(TransactionStatus::Success),
        "failed" | "failure" | "deny" | "cancel" | "canceled" | "cancelled" | "expire" | "expired" => {
            Ok(TransactionStatus::Failed)
        }
        "pending" => Ok(TransactionStatus::Pending),
        other => Err(EngineError::Validation(format!("unknown payment status '{}'", other))),
    }
}

pub struct PaymentOrchestrator {
    claims: Arc<ClaimManager>,
}

impl PaymentOrchestrator {
    pub fn new(claims: Arc<ClaimManager>) -> Self {
        Self { claims }
    }

    /// Process a status update from the gateway webhook.
    pub async fn process_notification(
        &self,
        notification: &PaymentNotification,
        now: DateTime<Utc>,
    ) -> EngineResult<Claim> {
        let status = parse_gateway_status(&notification.status)?;
        info!(
            transaction_id = %notification.transaction_id,
            status = %status,
            reference = ?notification.reference,
            "Payment notification"
        );
        self.claims
            .on_transaction_status(notification.transaction_id, status, now)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{day, Fixture};
    use tally_core::ClaimStatus;

    #[test]
    fn test_gateway_vocabulary() {
        assert_eq!(parse_gateway_status("Settlement").unwrap(), TransactionStatus::Success);
        assert_eq!(parse_gateway_status("expire").unwrap(), TransactionStatus::Failed);
        assert_eq!(parse_gateway_status("pending").unwrap(), TransactionStatus::Pending);
        assert!(parse_gateway_status("refund").is_err());
    }

    #[tokio::test]
    async fn test_notification_confirms_claim() {
        let f = Fixture::new(1).await;
        let (_, transaction) = f.claims.claim(f.offer.id, Uuid::new_v4(), 1, day(1)).await.unwrap();
        let orchestrator = PaymentOrchestrator::new(f.claims.clone());

        let claim = orchestrator
            .process_notification(
                &PaymentNotification {
                    transaction_id: transaction.id,
                    status: "succeeded".to_string(),
                    reference: Some("gw-123".to_string()),
                },
                day(1),
            )
            .await
            .unwrap();
        assert_eq!(claim.status, ClaimStatus::Success);
    }
}
