use crate::arm::Arm;
use crate::error::Result;
use crate::events::RawEvent;
use crate::table::{compare_user_ids, UserRecord, UserTable};
use ahash::{HashMap, HashMapExt, HashSet};
use log::debug;

/// Counts describing what the aggregation kept and dropped.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregationReport {
    pub n_events: usize,
    pub n_events_kept: usize,
    /// Users seen under more than one arm, in user id order.
    pub contaminated_users: Vec<String>,
    pub n_control_users: usize,
    pub n_variant_users: usize,
}

impl AggregationReport {
    pub fn n_contaminated(&self) -> usize {
        self.contaminated_users.len()
    }
}

/// User ids exposed to more than one arm.
pub fn find_contaminated_users(events: &[RawEvent]) -> HashSet<&str> {
    let mut arms_per_user: HashMap<&str, HashSet<Arm>> = HashMap::new();
    for event in events {
        arms_per_user
            .entry(event.user_id.as_str())
            .or_default()
            .insert(event.arm);
    }
    arms_per_user
        .into_iter()
        .filter(|(_, arms)| arms.len() > 1)
        .map(|(user_id, _)| user_id)
        .collect()
}

/// Collapse raw events into one row per user: contaminated users are removed
/// from both arms, the remaining revenue is summed per user and `converted`
/// is derived from the total.
pub fn aggregate_events(events: &[RawEvent]) -> Result<(UserTable, AggregationReport)> {
    let contaminated = find_contaminated_users(events);
    debug!("Found {} contaminated users", contaminated.len());

    let mut totals: HashMap<&str, (Arm, f64)> = HashMap::new();
    let mut n_events_kept = 0;
    for event in events {
        if contaminated.contains(event.user_id.as_str()) {
            continue;
        }
        n_events_kept += 1;
        totals
            .entry(event.user_id.as_str())
            .or_insert((event.arm, 0.0))
            .1 += event.revenue;
    }

    let mut records: Vec<UserRecord> = totals
        .into_iter()
        .map(|(user_id, (arm, total))| UserRecord::new(user_id, arm, total))
        .collect();
    records.sort_by(|a, b| compare_user_ids(&a.user_id, &b.user_id));

    let mut contaminated_users: Vec<String> = contaminated.into_iter().map(str::to_string).collect();
    contaminated_users.sort_by(|a, b| compare_user_ids(a, b));

    let table = UserTable::new(records)?;
    let report = AggregationReport {
        n_events: events.len(),
        n_events_kept,
        contaminated_users,
        n_control_users: table.n_users(Arm::Control),
        n_variant_users: table.n_users(Arm::Variant),
    };
    Ok((table, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> Vec<RawEvent> {
        vec![
            RawEvent::new("1", Arm::Control, 0.0),
            RawEvent::new("1", Arm::Control, 2.5),
            RawEvent::new("2", Arm::Variant, 0.0),
            RawEvent::new("3", Arm::Control, 1.0),
            RawEvent::new("3", Arm::Variant, 4.0),
            RawEvent::new("4", Arm::Variant, 3.0),
            RawEvent::new("4", Arm::Variant, 1.5),
            RawEvent::new("5", Arm::Variant, 0.0),
            RawEvent::new("5", Arm::Control, 0.0),
            RawEvent::new("5", Arm::Control, 0.0),
        ]
    }

    #[test]
    fn test_contaminated_users_are_excluded() {
        let events = events();
        let (table, report) = aggregate_events(&events).unwrap();

        assert_eq!(report.contaminated_users, vec!["3".to_string(), "5".to_string()]);
        let expected_excluded = events
            .iter()
            .filter(|e| report.contaminated_users.contains(&e.user_id))
            .count();
        assert_eq!(report.n_events - report.n_events_kept, expected_excluded);
        assert!(table
            .records()
            .iter()
            .all(|r| r.user_id != "3" && r.user_id != "5"));
    }

    #[test]
    fn test_revenue_summed_per_user() {
        let (table, report) = aggregate_events(&events()).unwrap();
        assert_eq!(
            table.records(),
            &[
                UserRecord::new("1", Arm::Control, 2.5),
                UserRecord::new("2", Arm::Variant, 0.0),
                UserRecord::new("4", Arm::Variant, 4.5),
            ]
        );
        assert_eq!(table.records()[0].converted, 1);
        assert_eq!(table.records()[1].converted, 0);
        assert_eq!(report.n_control_users, 1);
        assert_eq!(report.n_variant_users, 2);
        assert_eq!(report.n_events_kept, 5);
    }

    #[test]
    fn test_empty_input() {
        let (table, report) = aggregate_events(&[]).unwrap();
        assert!(table.is_empty());
        assert_eq!(report, AggregationReport::default());
    }
}
