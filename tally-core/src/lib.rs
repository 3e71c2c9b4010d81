pub mod error;
pub mod models;
pub mod invariants;
pub mod repository;
pub mod collaborators;
pub mod memory;

pub use error::{EngineError, EngineResult};
pub use models::{
    Campaign, Claim, ClaimStatus, Offer, OfferStatus, RunMode, Schedule, Transaction,
    TransactionStatus, Voucher, VoucherMovement, Window,
};
pub use repository::{BudgetGuard, ClaimRequest, InventoryRepository, ReleaseOutcome, VoucherMove};
pub use collaborators::{MediaStore, NoopMediaStore, RecordingReindexSink, ReindexSink};
pub use memory::InMemoryInventory;
