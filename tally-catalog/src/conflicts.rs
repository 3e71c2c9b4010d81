//! Detection of schedules that should not coexist within one campaign.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use tally_core::{Schedule, Window};

/// Active schedules sharing one exact window. The earliest-created one is
/// kept as `primary`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateGroup {
    pub window: Window,
    pub primary: Schedule,
    pub duplicates: Vec<Schedule>,
}

impl DuplicateGroup {
    pub fn duplicate_ids(&self) -> Vec<Uuid> {
        self.duplicates.iter().map(|s| s.id).collect()
    }
}

/// Two active schedules whose windows intersect without being identical.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Overlap {
    pub first_schedule_id: Uuid,
    pub second_schedule_id: Uuid,
    pub first: Window,
    pub second: Window,
}

fn active_by_age(schedules: &[Schedule]) -> Vec<&Schedule> {
    let mut active: Vec<&Schedule> = schedules.iter().filter(|s| s.is_active()).collect();
    active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    active
}

/// Groups active schedules by identical window. Archived schedules never
/// count as duplicates. Groups come back in window order.
pub fn find_duplicate_schedules(schedules: &[Schedule]) -> Vec<DuplicateGroup> {
    let mut by_window: BTreeMap<Window, Vec<&Schedule>> = BTreeMap::new();
    for schedule in active_by_age(schedules) {
        by_window.entry(schedule.window).or_default().push(schedule);
    }

    by_window
        .into_iter()
        .filter(|(_, group)| group.len() > 1)
        .map(|(window, group)| DuplicateGroup {
            window,
            primary: group[0].clone(),
            duplicates: group[1..].iter().map(|s| (*s).clone()).collect(),
        })
        .collect()
}

/// Pairs of active schedules that overlap partially. Exact duplicates are
/// left to [`find_duplicate_schedules`].
pub fn find_partial_overlaps(schedules: &[Schedule]) -> Vec<Overlap> {
    let mut active = active_by_age(schedules);
    active.sort_by_key(|s| s.window);

    let mut overlaps = Vec::new();
    for (i, a) in active.iter().enumerate() {
        for b in &active[i + 1..] {
            if b.window.available_at >= a.window.available_until {
                break;
            }
            if a.window != b.window && a.window.overlaps(&b.window) {
                overlaps.push(Overlap {
                    first_schedule_id: a.id,
                    second_schedule_id: b.id,
                    first: a.window,
                    second: b.window,
                });
            }
        }
    }
    overlaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tally_core::OfferStatus;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn schedule(campaign_id: Uuid, from: i64, to: i64, created: i64) -> Schedule {
        Schedule::new(campaign_id, Window::new(day(from), day(to)).unwrap(), 4, day(created))
    }

    #[test]
    fn test_duplicates_keep_earliest_created() {
        let campaign_id = Uuid::new_v4();
        let later = schedule(campaign_id, 5, 8, 2);
        let earlier = schedule(campaign_id, 5, 8, 1);
        let unrelated = schedule(campaign_id, 8, 11, 0);

        let groups = find_duplicate_schedules(&[later.clone(), unrelated, earlier.clone()]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].primary.id, earlier.id);
        assert_eq!(groups[0].duplicate_ids(), vec![later.id]);
    }

    #[test]
    fn test_archived_schedules_are_not_duplicates() {
        let campaign_id = Uuid::new_v4();
        let live = schedule(campaign_id, 5, 8, 1);
        let mut archived = schedule(campaign_id, 5, 8, 0);
        archived.status = OfferStatus::Archived;

        assert!(find_duplicate_schedules(&[live, archived]).is_empty());
    }

    #[test]
    fn test_partial_overlap_reported_abutting_not() {
        let campaign_id = Uuid::new_v4();
        let a = schedule(campaign_id, 0, 3, 0);
        let b = schedule(campaign_id, 2, 5, 0);
        let c = schedule(campaign_id, 5, 8, 0);
        let d = schedule(campaign_id, 5, 8, 1);

        let overlaps = find_partial_overlaps(&[a.clone(), b.clone(), c, d]);
        assert_eq!(overlaps.len(), 1);
        assert_eq!(overlaps[0].first_schedule_id, a.id);
        assert_eq!(overlaps[0].second_schedule_id, b.id);
    }
}
