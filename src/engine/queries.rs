use chrono::NaiveDate;

use crate::model::*;

use super::availability::{end_times, max_durations, max_end_from, merge_best};
use super::store::booked_spans;
use super::{Engine, EngineError, Entity};

impl Engine {
    // ── Availability ─────────────────────────────────────────

    /// Feasible start times on `date` and the latest end reachable from each.
    ///
    /// For one employee the rest-day warning is attached but never removes slots.
    /// For any available staff the per-employee results are merged, keeping the
    /// latest end per start, and no warning applies.
    pub async fn max_durations_for_date(
        &self,
        selector: EmployeeSelector,
        date: NaiveDate,
        exclude_appointment_id: Option<AppointmentId>,
    ) -> Result<DayAvailability, EngineError> {
        let policy = self.policy();
        let (durations, warning) = match selector {
            EmployeeSelector::Specific(id) => {
                let es = self.read_employee(id).await?;
                let booked = booked_spans(&es, date, exclude_appointment_id);
                (max_durations(policy, &booked), es.rest_day_warning(date))
            }
            EmployeeSelector::AnyAvailable => {
                let staff = self.read_all_employees().await?;
                let merged = merge_best(
                    staff
                        .iter()
                        .map(|es| max_durations(policy, &booked_spans(es, date, exclude_appointment_id))),
                );
                (merged, None)
            }
        };
        Ok(DayAvailability {
            selector,
            date,
            max_durations: durations,
            warning,
        })
    }

    /// Slot-aligned end times after `start`, empty when `start` itself is not bookable.
    pub async fn end_times_for_start(
        &self,
        selector: EmployeeSelector,
        date: NaiveDate,
        start: Minute,
        exclude_appointment_id: Option<AppointmentId>,
    ) -> Result<Vec<Minute>, EngineError> {
        let policy = self.policy();
        let max_end = match selector {
            EmployeeSelector::Specific(id) => {
                let es = self.read_employee(id).await?;
                max_end_from(policy, &booked_spans(&es, date, exclude_appointment_id), start)
            }
            EmployeeSelector::AnyAvailable => {
                let staff = self.read_all_employees().await?;
                staff
                    .iter()
                    .filter_map(|es| max_end_from(policy, &booked_spans(es, date, exclude_appointment_id), start))
                    .max()
            }
        };
        Ok(max_end.map_or_else(Vec::new, |end| end_times(policy, start, end)))
    }

    pub async fn rest_day_warning(&self, employee_id: EmployeeId, date: NaiveDate) -> Result<Option<String>, EngineError> {
        let es = self.read_employee(employee_id).await?;
        Ok(es.rest_day_warning(date))
    }

    // ── Timetables ───────────────────────────────────────────

    pub async fn get_timetable(&self, id: TimetableId) -> Result<Timetable, EngineError> {
        let employee_id = self
            .store
            .timetable_owner(id)
            .ok_or(EngineError::NotFound(Entity::Timetable(id)))?;
        let es = self.read_employee(employee_id).await?;
        es.timetable(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Timetable(id)))
    }

    /// An employee's timetables ordered by effective start date.
    pub async fn list_timetables(&self, employee_id: EmployeeId) -> Result<Vec<Timetable>, EngineError> {
        let es = self.read_employee(employee_id).await?;
        Ok(es.timetables.clone())
    }

    /// The timetable covering `date` and every one starting after it.
    pub async fn timetable_schedule(
        &self,
        employee_id: EmployeeId,
        date: NaiveDate,
    ) -> Result<TimetableSchedule, EngineError> {
        let es = self.read_employee(employee_id).await?;
        Ok(TimetableSchedule {
            current: es.timetable_covering(date).cloned(),
            upcoming: es
                .timetables
                .iter()
                .filter(|t| t.range.start > date)
                .cloned()
                .collect(),
        })
    }

    // ── Appointments & directory ─────────────────────────────

    pub async fn get_appointment(&self, id: AppointmentId) -> Result<Appointment, EngineError> {
        let employee_id = self
            .store
            .appointment_owner(id)
            .ok_or(EngineError::NotFound(Entity::Appointment(id)))?;
        let es = self.read_employee(employee_id).await?;
        es.appointments
            .values()
            .flatten()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Appointment(id)))
    }

    /// Appointments on `date` for one employee, or across all staff,
    /// ordered by start time then employee.
    pub async fn appointments_on(
        &self,
        selector: EmployeeSelector,
        date: NaiveDate,
    ) -> Result<Vec<Appointment>, EngineError> {
        let mut out: Vec<Appointment> = match selector {
            EmployeeSelector::Specific(id) => self.read_employee(id).await?.appointments_on(date).to_vec(),
            EmployeeSelector::AnyAvailable => self
                .read_all_employees()
                .await?
                .iter()
                .flat_map(|es| es.appointments_on(date).iter().cloned())
                .collect(),
        };
        out.sort_by_key(|a| (a.span.start, a.servicing_employee_id));
        Ok(out)
    }

    /// Number of appointments per employee on `date`, zero counts included.
    pub async fn appointment_counts(&self, date: NaiveDate) -> Result<Vec<(EmployeeId, usize)>, EngineError> {
        let staff = self.read_all_employees().await?;
        Ok(staff
            .iter()
            .map(|es| (es.id, es.appointments_on(date).len()))
            .collect())
    }

    pub async fn list_employees(&self) -> Result<Vec<(EmployeeId, Option<String>)>, EngineError> {
        let staff = self.read_all_employees().await?;
        Ok(staff.iter().map(|es| (es.id, es.name.clone())).collect())
    }
}
