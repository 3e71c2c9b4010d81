pub mod codes;
pub mod materializer;
pub mod lifecycle;
pub mod redistribution;
pub mod reconciliation;
pub mod extend;

pub use codes::CodeGenerator;
pub use materializer::OfferMaterializer;
pub use lifecycle::{rederive_status, LifecycleReport, OfferLifecycle};
pub use redistribution::{
    RedistributionConfig, RedistributionEngine, RedistributionReport, RedistributionRun, SkipReason,
    TransferReport, TransferRequest,
};
pub use reconciliation::{Finding, Pass, ReconcileConfig, ReconcileReport, Reconciler};
pub use extend::{ExtendDefaults, ExtendReport, ExtendRequest, ScheduleExtender};
