use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Minutes since local midnight. The only time-of-day type inside the engine.
pub type Minute = i32;

pub type EmployeeId = i64;
pub type MemberId = i64;
pub type TimetableId = i64;
pub type AppointmentId = i64;

/// Half-open interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Minute) -> bool {
        self.start <= t && t < self.end
    }
}

pub fn minute_of(time: NaiveTime) -> Minute {
    (time.hour() * 60 + time.minute()) as Minute
}

/// `HH:MM` rendering used on the wire and in messages.
pub fn hhmm(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Inclusive date range. `end == None` means open-ended (the "current" timetable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    fn last_day(&self) -> NaiveDate {
        self.end.unwrap_or(NaiveDate::MAX)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.last_day()
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.last_day() && other.start <= self.last_day()
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {}]", self.start, end),
            None => write!(f, "[{}, open]", self.start),
        }
    }
}

/// One contiguous period during which an employee has a fixed weekly rest day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timetable {
    pub id: TimetableId,
    pub employee_id: EmployeeId,
    /// ISO weekday number, Monday = 1.
    pub rest_day_number: u8,
    pub range: DateRange,
    pub created_by: EmployeeId,
    pub created_at: DateTime<FixedOffset>,
    pub updated_by: Option<EmployeeId>,
    pub updated_at: Option<DateTime<FixedOffset>>,
}

impl Timetable {
    pub fn is_rest_day(&self, date: NaiveDate) -> bool {
        self.range.contains(date)
            && date.weekday().number_from_monday() == u32::from(self.rest_day_number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub member_id: MemberId,
    pub servicing_employee_id: EmployeeId,
    pub appointment_date: NaiveDate,
    pub span: Span,
    pub remarks: Option<String>,
    pub created_by: EmployeeId,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
}

/// Who an availability query or a booking item targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmployeeSelector {
    Specific(EmployeeId),
    AnyAvailable,
}

impl EmployeeSelector {
    pub fn employee_id(&self) -> Option<EmployeeId> {
        match self {
            EmployeeSelector::Specific(id) => Some(*id),
            EmployeeSelector::AnyAvailable => None,
        }
    }
}

impl std::fmt::Display for EmployeeSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmployeeSelector::Specific(id) => write!(f, "{id}"),
            EmployeeSelector::AnyAvailable => write!(f, "anyAvailableStaff"),
        }
    }
}

/// Daily operating window and slot granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub opens_at: Minute,
    pub closes_at: Minute,
    pub slot_minutes: Minute,
    /// Offset applied to bare `HH:MM` input and used to localize full timestamps.
    pub utc_offset: FixedOffset,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            opens_at: 10 * 60,
            closes_at: 17 * 60,
            slot_minutes: 30,
            utc_offset: FixedOffset::east_opt(8 * 3600).expect("+08:00 is a valid offset"),
        }
    }
}

impl SchedulePolicy {
    pub fn window(&self) -> Span {
        Span::new(self.opens_at, self.closes_at)
    }

    /// True if the span lies entirely inside operating hours.
    pub fn admits(&self, span: &Span) -> bool {
        self.opens_at <= span.start && span.end <= self.closes_at
    }
}

#[derive(Debug, Clone)]
pub struct EmployeeState {
    pub id: EmployeeId,
    pub name: Option<String>,
    /// Sorted by `range.start`; ranges never overlap.
    pub timetables: Vec<Timetable>,
    /// Per date, sorted by `span.start`.
    pub appointments: BTreeMap<NaiveDate, Vec<Appointment>>,
}

impl EmployeeState {
    pub fn new(id: EmployeeId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            timetables: Vec::new(),
            appointments: BTreeMap::new(),
        }
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("employee {}", self.id))
    }

    /// Insert timetable maintaining sort order by start date.
    pub fn insert_timetable(&mut self, timetable: Timetable) {
        let pos = self
            .timetables
            .partition_point(|t| t.range.start < timetable.range.start);
        self.timetables.insert(pos, timetable);
    }

    pub fn remove_timetable(&mut self, id: TimetableId) -> Option<Timetable> {
        let pos = self.timetables.iter().position(|t| t.id == id)?;
        Some(self.timetables.remove(pos))
    }

    pub fn timetable(&self, id: TimetableId) -> Option<&Timetable> {
        self.timetables.iter().find(|t| t.id == id)
    }

    /// The timetable whose range contains `date`, if any.
    pub fn timetable_covering(&self, date: NaiveDate) -> Option<&Timetable> {
        let idx = self.timetables.partition_point(|t| t.range.start <= date);
        self.timetables[..idx]
            .last()
            .filter(|t| t.range.contains(date))
    }

    pub fn rest_day_warning(&self, date: NaiveDate) -> Option<String> {
        let timetable = self.timetable_covering(date)?;
        timetable.is_rest_day(date).then(|| {
            format!(
                "{} is on rest day ({}) on {date}",
                self.display_name(),
                date.weekday()
            )
        })
    }

    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let day = self
            .appointments
            .entry(appointment.appointment_date)
            .or_default();
        let pos = day.partition_point(|a| a.span.start < appointment.span.start);
        day.insert(pos, appointment);
    }

    pub fn appointments_on(&self, date: NaiveDate) -> &[Appointment] {
        self.appointments
            .get(&date)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Appointments on `date` whose span overlaps the query.
    /// Uses binary search to skip appointments starting at or after `query.end`.
    pub fn overlapping(&self, date: NaiveDate, query: &Span) -> impl Iterator<Item = &Appointment> {
        let day = self.appointments_on(date);
        let right_bound = day.partition_point(|a| a.span.start < query.end);
        day[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: MemberId,
    pub name: Option<String>,
}

/// A neighbour's end date being pulled in to make room for another range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truncation {
    pub timetable_id: TimetableId,
    pub effective_end_date: NaiveDate,
}

/// The event types, flat with no nesting. This is the WAL record format.
/// Each committed operation is exactly one event, so multi-row writes replay atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    EmployeeRegistered {
        id: EmployeeId,
        name: Option<String>,
    },
    MemberRegistered {
        id: MemberId,
        name: Option<String>,
    },
    TimetableCreated {
        timetable: Timetable,
        truncated: Option<Truncation>,
    },
    TimetableUpdated {
        timetable: Timetable,
        truncated: Option<Truncation>,
    },
    AppointmentsBooked {
        appointments: Vec<Appointment>,
    },
}

impl Event {
    /// Employees whose state this event touches.
    pub fn employee_ids(&self) -> Vec<EmployeeId> {
        match self {
            Event::EmployeeRegistered { id, .. } => vec![*id],
            Event::MemberRegistered { .. } => Vec::new(),
            Event::TimetableCreated { timetable, .. } | Event::TimetableUpdated { timetable, .. } => {
                vec![timetable.employee_id]
            }
            Event::AppointmentsBooked { appointments } => {
                let mut ids: Vec<EmployeeId> =
                    appointments.iter().map(|a| a.servicing_employee_id).collect();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// The latest end reachable from one candidate start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDuration {
    pub start: Minute,
    pub max_end: Minute,
}

impl MaxDuration {
    pub fn minutes(&self) -> Minute {
        self.max_end - self.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub selector: EmployeeSelector,
    pub date: NaiveDate,
    pub max_durations: Vec<MaxDuration>,
    pub warning: Option<String>,
}

/// Outcome of a timetable create or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimetableChange {
    pub timetable: Timetable,
    /// The neighbour whose end date was pulled in, after the change.
    pub updated_previous: Option<Timetable>,
    /// Set when the written range's own end was truncated to fit before a later one.
    pub truncated_end: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimetableSchedule {
    pub current: Option<Timetable>,
    pub upcoming: Vec<Timetable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingOutcome {
    pub appointments: Vec<Appointment>,
    pub warning: Option<String>,
}
