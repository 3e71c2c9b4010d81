use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use tally_core::repository::InventoryRepository;
use tally_core::{EngineError, EngineResult, Window};

/// What to lay out: how much, in what chunks, how far apart.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanRequest {
    pub total_quantity: i64,
    pub per_window_quantity: i64,
    pub window_length: Duration,
    pub gap: Duration,
    /// Hard ceiling on the whole plan, counted from the first window's start.
    pub max_days: Option<i64>,
}

impl PlanRequest {
    pub fn from_days(
        total_quantity: i64,
        per_window_quantity: i64,
        window_days: i64,
        gap_minutes: i64,
        max_days: Option<i64>,
    ) -> EngineResult<Self> {
        let window_length = Duration::try_days(window_days)
            .ok_or_else(|| EngineError::Validation(format!("window length of {} days is out of range", window_days)))?;
        let gap = Duration::try_minutes(gap_minutes)
            .ok_or_else(|| EngineError::Validation(format!("gap of {} minutes is out of range", gap_minutes)))?;
        Ok(Self {
            total_quantity,
            per_window_quantity,
            window_length,
            gap,
            max_days,
        })
    }

    fn validate(&self) -> EngineResult<()> {
        if self.total_quantity < 0 {
            return Err(EngineError::Validation(format!(
                "total quantity must not be negative, got {}",
                self.total_quantity
            )));
        }
        if self.per_window_quantity <= 0 {
            return Err(EngineError::Validation(format!(
                "per-window quantity must be positive, got {}",
                self.per_window_quantity
            )));
        }
        if self.window_length <= Duration::zero() {
            return Err(EngineError::Validation("window length must be positive".to_string()));
        }
        if self.gap < Duration::zero() {
            return Err(EngineError::Validation("gap between windows must not be negative".to_string()));
        }
        if matches!(self.max_days, Some(days) if days <= 0) {
            return Err(EngineError::Validation("max days must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PlannedWindow {
    pub window: Window,
    pub quantity: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchedulePlan {
    pub windows: Vec<PlannedWindow>,
    /// Quantity that did not fit under the `max_days` ceiling.
    pub unscheduled_quantity: i64,
}

impl SchedulePlan {
    pub fn scheduled_quantity(&self) -> i64 {
        self.windows.iter().map(|w| w.quantity).sum()
    }
}

pub struct SchedulePlanner;

impl SchedulePlanner {
    /// Lays windows out after `latest_until`, never before `now`.
    ///
    /// Windows are half-open, so a window starting exactly where the previous
    /// one ends does not overlap it.
    pub fn plan(
        request: &PlanRequest,
        latest_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> EngineResult<SchedulePlan> {
        request.validate()?;

        let start = match latest_until {
            Some(until) => shift(until, request.gap)?.max(now),
            None => now,
        };
        let ceiling = match request.max_days {
            Some(days) => {
                let span = Duration::try_days(days)
                    .ok_or_else(|| EngineError::Validation(format!("max days of {} is out of range", days)))?;
                Some(shift(start, span)?)
            }
            None => None,
        };

        let mut plan = SchedulePlan::default();
        let mut remaining = request.total_quantity;
        let mut cursor = start;

        while remaining > 0 {
            let mut end = shift(cursor, request.window_length)?;
            if let Some(ceiling) = ceiling {
                if cursor >= ceiling {
                    break;
                }
                end = end.min(ceiling);
            }

            let quantity = remaining.min(request.per_window_quantity);
            plan.windows.push(PlannedWindow {
                window: Window::new(cursor, end)?,
                quantity,
            });
            remaining -= quantity;
            if remaining > 0 {
                cursor = shift(end, request.gap)?;
            }
        }

        plan.unscheduled_quantity = remaining;
        Ok(plan)
    }

    /// Plans against the campaign's schedules as they are stored, rather than
    /// assuming nothing has been scheduled yet.
    pub async fn plan_for_campaign(
        repo: &dyn InventoryRepository,
        campaign_id: Uuid,
        request: &PlanRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<SchedulePlan> {
        let latest_until = repo.latest_schedule_end(campaign_id).await?;
        let plan = Self::plan(request, latest_until, now)?;
        debug!(
            campaign_id = %campaign_id,
            windows = plan.windows.len(),
            unscheduled = plan.unscheduled_quantity,
            "Planned schedule windows"
        );
        Ok(plan)
    }
}

fn shift(at: DateTime<Utc>, by: Duration) -> EngineResult<DateTime<Utc>> {
    at.checked_add_signed(by)
        .ok_or_else(|| EngineError::Validation(format!("window boundary past {} is out of range", at)))
}
