use std::collections::BTreeMap;

use crate::model::*;

// ── Slot Algorithm ────────────────────────────────────────────────

/// Candidate start times: every slot boundary from opening up to, not including, closing.
pub fn slot_starts(policy: &SchedulePolicy) -> impl Iterator<Item = Minute> {
    let step = policy.slot_minutes.max(1) as usize;
    (policy.opens_at..policy.closes_at).step_by(step)
}

/// Latest end reachable from `start` without touching a booking.
///
/// `booked` must be sorted by start. Returns `None` when `start` is outside
/// operating hours or falls inside a booked span.
pub fn max_end_from(policy: &SchedulePolicy, booked: &[Span], start: Minute) -> Option<Minute> {
    if !policy.window().contains_instant(start) {
        return None;
    }
    if booked.iter().any(|b| b.contains_instant(start)) {
        return None;
    }
    // Everything before this index starts at or before `start`.
    let idx = booked.partition_point(|b| b.start <= start);
    let max_end = booked
        .get(idx)
        .map_or(policy.closes_at, |next| next.start.min(policy.closes_at));
    (max_end > start).then_some(max_end)
}

/// One entry per feasible candidate start for a single employee's day.
pub fn max_durations(policy: &SchedulePolicy, booked: &[Span]) -> Vec<MaxDuration> {
    slot_starts(policy)
        .filter_map(|start| {
            max_end_from(policy, booked, start).map(|max_end| MaxDuration { start, max_end })
        })
        .collect()
}

/// Union across staff: for each start time, the latest end any one employee can reach.
pub fn merge_best<I>(per_employee: I) -> Vec<MaxDuration>
where
    I: IntoIterator<Item = Vec<MaxDuration>>,
{
    let mut best: BTreeMap<Minute, Minute> = BTreeMap::new();
    for durations in per_employee {
        for d in durations {
            best.entry(d.start)
                .and_modify(|end| *end = (*end).max(d.max_end))
                .or_insert(d.max_end);
        }
    }
    best.into_iter()
        .map(|(start, max_end)| MaxDuration { start, max_end })
        .collect()
}

/// Slot-aligned end times in `(start, max_end]`.
pub fn end_times(policy: &SchedulePolicy, start: Minute, max_end: Minute) -> Vec<Minute> {
    let step = policy.slot_minutes.max(1);
    // First aligned boundary strictly after `start`.
    let offset = start - policy.opens_at;
    let first = policy.opens_at + (offset.div_euclid(step) + 1) * step;
    (first..=max_end).step_by(step as usize).collect()
}
