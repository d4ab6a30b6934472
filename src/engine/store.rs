use std::io;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::model::*;

pub type SharedEmployeeState = Arc<RwLock<EmployeeState>>;

/// In-memory state of one tenant: the employee and member directories plus
/// every employee's timetables and appointments.
pub struct Roster {
    employees: DashMap<EmployeeId, SharedEmployeeState>,
    members: DashMap<MemberId, MemberInfo>,
    timetable_owner: DashMap<TimetableId, EmployeeId>,
    appointment_owner: DashMap<AppointmentId, EmployeeId>,
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}

impl Roster {
    pub fn new() -> Self {
        Self {
            employees: DashMap::new(),
            members: DashMap::new(),
            timetable_owner: DashMap::new(),
            appointment_owner: DashMap::new(),
        }
    }

    // ── Directories ──────────────────────────────────────────

    pub fn employee_count(&self) -> usize {
        self.employees.len()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains_employee(&self, id: EmployeeId) -> bool {
        self.employees.contains_key(&id)
    }

    pub fn contains_member(&self, id: MemberId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn get_employee(&self, id: EmployeeId) -> Option<SharedEmployeeState> {
        self.employees.get(&id).map(|e| e.value().clone())
    }

    pub fn get_member(&self, id: MemberId) -> Option<MemberInfo> {
        self.members.get(&id).map(|m| m.value().clone())
    }

    /// All employee ids in ascending order, the lock order for multi-employee writes.
    pub fn employee_ids(&self) -> Vec<EmployeeId> {
        let mut ids: Vec<EmployeeId> = self.employees.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn member_ids(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self.members.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    // ── Record index ─────────────────────────────────────────

    pub fn timetable_owner(&self, id: TimetableId) -> Option<EmployeeId> {
        self.timetable_owner.get(&id).map(|e| *e.value())
    }

    pub fn appointment_owner(&self, id: AppointmentId) -> Option<EmployeeId> {
        self.appointment_owner.get(&id).map(|e| *e.value())
    }

    // ── Event application ────────────────────────────────────

    /// Directory events change the maps themselves, not any employee's state.
    pub fn apply_directory_event(&self, event: &Event) {
        match event {
            Event::EmployeeRegistered { id, name } => {
                self.employees
                    .entry(*id)
                    .or_insert_with(|| Arc::new(RwLock::new(EmployeeState::new(*id, name.clone()))));
            }
            Event::MemberRegistered { id, name } => {
                self.members.insert(
                    *id,
                    MemberInfo {
                        id: *id,
                        name: name.clone(),
                    },
                );
            }
            _ => {}
        }
    }

    /// Apply the part of `event` that concerns `es`. Caller holds its write lock.
    pub fn apply_to_employee(&self, es: &mut EmployeeState, event: &Event) {
        match event {
            Event::TimetableCreated { timetable, truncated }
            | Event::TimetableUpdated { timetable, truncated } => {
                if timetable.employee_id != es.id {
                    return;
                }
                if let Some(t) = truncated {
                    shorten(es, t);
                }
                es.remove_timetable(timetable.id);
                es.insert_timetable(timetable.clone());
                self.timetable_owner.insert(timetable.id, es.id);
            }
            Event::AppointmentsBooked { appointments } => {
                let id = es.id;
                for a in appointments.iter().filter(|a| a.servicing_employee_id == id) {
                    es.insert_appointment(a.clone());
                    self.appointment_owner.insert(a.id, id);
                }
            }
            Event::EmployeeRegistered { .. } | Event::MemberRegistered { .. } => {}
        }
    }

    /// Apply a replayed event. Replay owns every lock, so `try_write` never waits.
    pub fn replay_event(&self, event: &Event) -> io::Result<()> {
        self.apply_directory_event(event);
        for id in event.employee_ids() {
            let Some(shared) = self.get_employee(id) else {
                tracing::warn!("replay: event for unknown employee {id} skipped");
                continue;
            };
            let mut guard = shared
                .try_write()
                .map_err(|_| io::Error::other(format!("replay: employee {id} is locked")))?;
            self.apply_to_employee(&mut guard, event);
        }
        Ok(())
    }

    /// Minimal event sequence that recreates the current state.
    /// `employees` are the caller's locked views of every registered employee.
    pub fn snapshot<'a, I>(&self, employees: I) -> Vec<Event>
    where
        I: IntoIterator<Item = &'a EmployeeState>,
    {
        let mut events = Vec::new();
        for id in self.member_ids() {
            if let Some(m) = self.get_member(id) {
                events.push(Event::MemberRegistered { id: m.id, name: m.name });
            }
        }

        let mut booked: Vec<Appointment> = Vec::new();
        for es in employees {
            events.push(Event::EmployeeRegistered {
                id: es.id,
                name: es.name.clone(),
            });
            for t in &es.timetables {
                events.push(Event::TimetableCreated {
                    timetable: t.clone(),
                    truncated: None,
                });
            }
            for day in es.appointments.values() {
                booked.extend(day.iter().cloned());
            }
        }
        if !booked.is_empty() {
            booked.sort_by_key(|a| a.id);
            events.push(Event::AppointmentsBooked { appointments: booked });
        }
        events
    }
}

fn shorten(es: &mut EmployeeState, truncation: &Truncation) {
    if let Some(t) = es
        .timetables
        .iter_mut()
        .find(|t| t.id == truncation.timetable_id)
    {
        t.range.end = Some(truncation.effective_end_date);
    }
}

/// Appointments of `es` on `date`, leaving out one being rescheduled.
pub fn booked_spans(es: &EmployeeState, date: NaiveDate, exclude: Option<AppointmentId>) -> Vec<Span> {
    es.appointments_on(date)
        .iter()
        .filter(|a| Some(a.id) != exclude)
        .map(|a| a.span)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn stamp() -> chrono::DateTime<chrono::FixedOffset> {
        DateTime::parse_from_rfc3339("2025-01-01T09:00:00+08:00").unwrap()
    }

    fn timetable(id: TimetableId, employee_id: EmployeeId, start: &str) -> Timetable {
        Timetable {
            id,
            employee_id,
            rest_day_number: 2,
            range: DateRange::new(date(start), None),
            created_by: 1,
            created_at: stamp(),
            updated_by: None,
            updated_at: None,
        }
    }

    fn appointment(id: AppointmentId, employee_id: EmployeeId, start: Minute, end: Minute) -> Appointment {
        Appointment {
            id,
            member_id: 9,
            servicing_employee_id: employee_id,
            appointment_date: date("2025-06-10"),
            span: Span::new(start, end),
            remarks: None,
            created_by: 1,
            created_at: stamp(),
            updated_at: stamp(),
        }
    }

    fn replay_all(roster: &Roster, events: &[Event]) {
        for e in events {
            roster.replay_event(e).unwrap();
        }
    }

    #[test]
    fn truncation_applies_with_the_new_row() {
        let roster = Roster::new();
        replay_all(
            &roster,
            &[
                Event::EmployeeRegistered { id: 5, name: None },
                Event::TimetableCreated {
                    timetable: timetable(1, 5, "2025-01-01"),
                    truncated: None,
                },
                Event::TimetableCreated {
                    timetable: timetable(2, 5, "2025-06-01"),
                    truncated: Some(Truncation {
                        timetable_id: 1,
                        effective_end_date: date("2025-05-31"),
                    }),
                },
            ],
        );

        let es = roster.get_employee(5).unwrap();
        let es = es.try_read().unwrap();
        assert_eq!(es.timetables.len(), 2);
        assert_eq!(es.timetables[0].range.end, Some(date("2025-05-31")));
        assert!(es.timetables[1].range.is_open());
        assert_eq!(roster.timetable_owner(2), Some(5));
    }

    #[test]
    fn booked_batch_splits_across_employees() {
        let roster = Roster::new();
        replay_all(
            &roster,
            &[
                Event::EmployeeRegistered { id: 5, name: None },
                Event::EmployeeRegistered { id: 6, name: None },
                Event::AppointmentsBooked {
                    appointments: vec![appointment(1, 5, 600, 660), appointment(2, 6, 600, 660)],
                },
            ],
        );
        for id in [5, 6] {
            let es = roster.get_employee(id).unwrap();
            assert_eq!(es.try_read().unwrap().appointments_on(date("2025-06-10")).len(), 1);
        }
        assert_eq!(roster.appointment_owner(2), Some(6));
    }

    #[test]
    fn snapshot_replays_to_same_state() {
        let roster = Roster::new();
        replay_all(
            &roster,
            &[
                Event::MemberRegistered { id: 9, name: Some("Ana".into()) },
                Event::EmployeeRegistered { id: 5, name: Some("Mei".into()) },
                Event::TimetableCreated {
                    timetable: timetable(1, 5, "2025-01-01"),
                    truncated: None,
                },
                Event::AppointmentsBooked { appointments: vec![appointment(1, 5, 600, 660)] },
                Event::AppointmentsBooked { appointments: vec![appointment(2, 5, 700, 760)] },
            ],
        );

        let shared = roster.get_employee(5).unwrap();
        let events = {
            let guard = shared.try_read().unwrap();
            roster.snapshot([&*guard])
        };
        assert_eq!(events.len(), 4);

        let restored = Roster::new();
        replay_all(&restored, &events);
        assert!(restored.contains_member(9));
        let es = restored.get_employee(5).unwrap();
        let es = es.try_read().unwrap();
        assert_eq!(es.name.as_deref(), Some("Mei"));
        assert_eq!(es.timetables.len(), 1);
        assert_eq!(booked_spans(&es, date("2025-06-10"), None), vec![Span::new(600, 660), Span::new(700, 760)]);
        assert_eq!(booked_spans(&es, date("2025-06-10"), Some(1)), vec![Span::new(700, 760)]);
    }

    #[test]
    fn events_for_unknown_employee_are_skipped() {
        let roster = Roster::new();
        roster
            .replay_event(&Event::AppointmentsBooked { appointments: vec![appointment(1, 42, 600, 660)] })
            .unwrap();
        assert_eq!(roster.employee_count(), 0);
        assert_eq!(roster.appointment_owner(1), None);
    }
}
