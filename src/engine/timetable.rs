use chrono::NaiveDate;

use crate::model::*;

use super::EngineError;

/// Where a new or edited range lands among an employee's other timetables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Final range of the written timetable, end possibly pulled in.
    pub range: DateRange,
    /// The preceding timetable, closed the day before `range.start`.
    pub truncated_previous: Option<Truncation>,
    /// Set when `range.end` had to stop before a later timetable.
    pub truncated_end: Option<NaiveDate>,
}

pub(crate) fn validate_timetable_fields(rest_day_number: u8, range: &DateRange) -> Result<(), EngineError> {
    if !(1..=7).contains(&rest_day_number) {
        return Err(EngineError::InvalidRange(format!(
            "rest_day_number must be 1-7, got {rest_day_number}"
        )));
    }
    if let Some(end) = range.end
        && end < range.start
    {
        return Err(EngineError::InvalidRange(format!(
            "effective_end_date {end} is before effective_start_date {}",
            range.start
        )));
    }
    Ok(())
}

/// Fit `range` between its neighbours in `siblings` (sorted by start, non-overlapping,
/// never containing the record being written).
///
/// The latest sibling starting on or before `range.start` is closed the day before,
/// provided that does not orphan the tail of a closed range. The earliest sibling
/// starting after `range.start` caps `range.end`.
pub fn plan_placement(
    employee_id: EmployeeId,
    siblings: &[Timetable],
    range: DateRange,
) -> Result<Placement, EngineError> {
    let idx = siblings.partition_point(|t| t.range.start <= range.start);
    let prev = idx.checked_sub(1).map(|i| &siblings[i]);
    let next = siblings.get(idx);

    let overlap = |existing: &Timetable, reason| EngineError::TimetableOverlap {
        employee_id,
        range,
        existing: existing.id,
        reason,
    };

    let mut truncated_previous = None;
    if let Some(p) = prev
        && p.range.contains(range.start)
    {
        if p.range.start == range.start {
            return Err(overlap(p, "both start on the same date"));
        }
        if let (Some(prev_end), Some(new_end)) = (p.range.end, range.end)
            && new_end < prev_end
        {
            return Err(overlap(p, "range lies inside a closed timetable"));
        }
        let day_before = range
            .start
            .pred_opt()
            .ok_or_else(|| EngineError::InvalidRange("effective_start_date out of range".into()))?;
        truncated_previous = Some(Truncation {
            timetable_id: p.id,
            effective_end_date: day_before,
        });
    }

    let mut placed = range;
    let mut truncated_end = None;
    if let Some(n) = next
        && range.end.is_none_or(|end| end >= n.range.start)
    {
        // n starts strictly after range.start, so the day before is still inside the range.
        let day_before = n
            .range
            .start
            .pred_opt()
            .ok_or_else(|| overlap(n, "no room before the later timetable"))?;
        placed.end = Some(day_before);
        truncated_end = Some(day_before);
    }

    Ok(Placement {
        range: placed,
        truncated_previous,
        truncated_end,
    })
}
