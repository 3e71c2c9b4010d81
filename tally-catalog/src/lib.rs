pub mod campaign;
pub mod planner;
pub mod conflicts;

pub use campaign::{draft_campaign, OfferTemplate, DEFAULT_MEDIA_COLLECTIONS};
pub use planner::{PlanRequest, PlannedWindow, SchedulePlan, SchedulePlanner};
pub use conflicts::{find_duplicate_schedules, find_partial_overlaps, DuplicateGroup, Overlap};
