use chrono::NaiveDate;

use crate::model::*;

use super::error::Clash;
use super::EngineError;

/// Appointments accepted so far within one batch, not yet committed.
#[derive(Debug, Default)]
pub(crate) struct BatchLedger {
    placed: Vec<(usize, EmployeeId, NaiveDate, Span)>,
}

impl BatchLedger {
    pub(crate) fn push(&mut self, index: usize, employee_id: EmployeeId, date: NaiveDate, span: Span) {
        self.placed.push((index, employee_id, date, span));
    }

    fn clash(&self, employee_id: EmployeeId, date: NaiveDate, span: &Span) -> Option<usize> {
        self.placed
            .iter()
            .find(|(_, e, d, s)| *e == employee_id && *d == date && s.overlaps(span))
            .map(|(i, ..)| *i)
    }

    pub(crate) fn count(&self, employee_id: EmployeeId, date: NaiveDate) -> usize {
        self.placed
            .iter()
            .filter(|(_, e, d, _)| *e == employee_id && *d == date)
            .count()
    }
}

/// Appointments `es` would hold on `date` with the batch so far.
pub(crate) fn day_load(es: &EmployeeState, ledger: &BatchLedger, date: NaiveDate) -> usize {
    es.appointments_on(date).len() + ledger.count(es.id, date)
}

/// First collision for `span` on `es`'s day, committed appointments before batch siblings.
pub(crate) fn find_clash(
    es: &EmployeeState,
    ledger: &BatchLedger,
    date: NaiveDate,
    span: &Span,
) -> Option<Clash> {
    if let Some(existing) = es.overlapping(date, span).next() {
        return Some(Clash::Existing(existing.id));
    }
    ledger.clash(es.id, date, span).map(Clash::Batch)
}

pub(crate) fn check_no_conflict(
    es: &EmployeeState,
    ledger: &BatchLedger,
    index: usize,
    date: NaiveDate,
    span: &Span,
) -> Result<(), EngineError> {
    match find_clash(es, ledger, date, span) {
        Some(clash) => Err(EngineError::AppointmentOverlap {
            index,
            employee_id: es.id,
            date,
            span: *span,
            clash,
        }),
        None => Ok(()),
    }
}

/// Lowest-id employee free for `span`. `staff` must be sorted by id.
pub(crate) fn pick_available<'a, I>(
    staff: I,
    ledger: &BatchLedger,
    date: NaiveDate,
    span: &Span,
) -> Option<EmployeeId>
where
    I: IntoIterator<Item = &'a EmployeeState>,
{
    staff
        .into_iter()
        .find(|es| find_clash(es, ledger, date, span).is_none())
        .map(|es| es.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn employee_with(id: EmployeeId, booked: &[(AppointmentId, Minute, Minute)]) -> EmployeeState {
        let stamp = DateTime::parse_from_rfc3339("2025-06-01T09:00:00+08:00").unwrap();
        let mut es = EmployeeState::new(id, None);
        for &(aid, start, end) in booked {
            es.insert_appointment(Appointment {
                id: aid,
                member_id: 9,
                servicing_employee_id: id,
                appointment_date: date("2025-06-10"),
                span: Span::new(start, end),
                remarks: None,
                created_by: 1,
                created_at: stamp,
                updated_at: stamp,
            });
        }
        es
    }

    #[test]
    fn existing_appointment_clashes() {
        let es = employee_with(5, &[(1, 660, 720)]);
        let ledger = BatchLedger::default();
        let err = check_no_conflict(&es, &ledger, 0, date("2025-06-10"), &Span::new(690, 750)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::AppointmentOverlap { index: 0, employee_id: 5, clash: Clash::Existing(1), .. }
        ));
    }

    #[test]
    fn back_to_back_is_fine() {
        let es = employee_with(5, &[(1, 660, 720)]);
        let ledger = BatchLedger::default();
        assert!(check_no_conflict(&es, &ledger, 0, date("2025-06-10"), &Span::new(720, 780)).is_ok());
        assert!(check_no_conflict(&es, &ledger, 0, date("2025-06-10"), &Span::new(600, 660)).is_ok());
    }

    #[test]
    fn same_batch_item_clashes() {
        let es = employee_with(5, &[]);
        let mut ledger = BatchLedger::default();
        ledger.push(0, 5, date("2025-06-10"), Span::new(600, 660));
        let err = check_no_conflict(&es, &ledger, 1, date("2025-06-10"), &Span::new(630, 690)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::AppointmentOverlap { index: 1, clash: Clash::Batch(0), .. }
        ));
    }

    #[test]
    fn batch_items_on_other_days_or_staff_do_not_clash() {
        let es = employee_with(5, &[]);
        let mut ledger = BatchLedger::default();
        ledger.push(0, 5, date("2025-06-11"), Span::new(600, 660));
        ledger.push(1, 6, date("2025-06-10"), Span::new(600, 660));
        assert!(check_no_conflict(&es, &ledger, 2, date("2025-06-10"), &Span::new(600, 660)).is_ok());
    }

    #[test]
    fn pick_skips_busy_staff() {
        let busy = employee_with(5, &[(1, 600, 720)]);
        let free = employee_with(6, &[]);
        let ledger = BatchLedger::default();
        let picked = pick_available([&busy, &free], &ledger, date("2025-06-10"), &Span::new(630, 660));
        assert_eq!(picked, Some(6));
    }

    #[test]
    fn pick_accounts_for_batch() {
        let a = employee_with(5, &[]);
        let mut ledger = BatchLedger::default();
        ledger.push(0, 5, date("2025-06-10"), Span::new(600, 660));
        let picked = pick_available([&a], &ledger, date("2025-06-10"), &Span::new(600, 630));
        assert_eq!(picked, None);
    }
}
