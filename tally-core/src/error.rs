use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Out of stock on offer {offer_id}: requested {requested}, available {available}")]
    OutOfStock {
        offer_id: Uuid,
        requested: i64,
        available: i64,
    },

    #[error("Budget exceeded for campaign {campaign_id}: requested {requested}, available {available}")]
    BudgetExceeded {
        campaign_id: Uuid,
        requested: i64,
        available: i64,
    },

    #[error("Schedule conflict on campaign {campaign_id}: {detail}")]
    ScheduleConflict { campaign_id: Uuid, detail: String },

    #[error("Orphaned reference: {0}")]
    OrphanedReference(String),

    #[error("Voucher {voucher_id} is owned and cannot move")]
    MoveOnOwnedVoucher { voucher_id: Uuid },

    #[error("Voucher {voucher_id} is held by pending claim {claim_id}")]
    VoucherHeld { voucher_id: Uuid, claim_id: Uuid },

    #[error("Offer already materialized for schedule {0}")]
    AlreadyMaterialized(Uuid),

    #[error("Window of schedule {0} has already elapsed")]
    WindowElapsed(Uuid),

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Voucher code {0} is already taken")]
    DuplicateCode(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Errors that protect the conservation invariant. Batch runs log these
    /// and move on to the next item without retrying.
    pub fn is_invariant_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::BudgetExceeded { .. }
                | EngineError::MoveOnOwnedVoucher { .. }
                | EngineError::VoucherHeld { .. }
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
