use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDate};
use tracing::{info, warn};

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, day_load, pick_available, BatchLedger};
use super::normalize::{normalize_item, now_local, BookingRequest, NormalizedItem};
use super::timetable::{plan_placement, validate_timetable_fields};
use super::{Engine, EngineError, Entity, WalCommand};

/// Fields of a timetable update. `None` keeps the stored value;
/// `effective_end_date: Some(None)` reopens the range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimetableEdit {
    pub rest_day_number: Option<u8>,
    pub effective_start_date: Option<NaiveDate>,
    pub effective_end_date: Option<Option<NaiveDate>>,
    pub updated_by: EmployeeId,
    pub updated_at: Option<DateTime<FixedOffset>>,
}

fn check_name(name: &Option<String>, what: &'static str) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn check_id(id: i64, field: &str) -> Result<(), EngineError> {
    if id <= 0 {
        return Err(EngineError::InvalidFormat {
            index: None,
            reason: format!("{field} must be a positive integer, got {id}"),
        });
    }
    Ok(())
}

impl Engine {
    // ── Directory ────────────────────────────────────────────

    pub async fn register_employee(&self, id: EmployeeId, name: Option<String>) -> Result<(), EngineError> {
        check_id(id, "employee id")?;
        check_name(&name, "employee name too long")?;
        let _directory = self.directory.lock().await;
        if self.store.employee_count() >= MAX_EMPLOYEES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many employees"));
        }
        if self.store.contains_employee(id) {
            return Err(EngineError::AlreadyExists(Entity::Employee(id)));
        }
        self.persist_directory(&Event::EmployeeRegistered { id, name }).await
    }

    pub async fn register_member(&self, id: MemberId, name: Option<String>) -> Result<(), EngineError> {
        check_id(id, "member id")?;
        check_name(&name, "member name too long")?;
        let _directory = self.directory.lock().await;
        if self.store.member_count() >= MAX_MEMBERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many members"));
        }
        if self.store.contains_member(id) {
            return Err(EngineError::AlreadyExists(Entity::Member(id)));
        }
        self.persist_directory(&Event::MemberRegistered { id, name }).await
    }

    fn require_employee(&self, id: EmployeeId) -> Result<(), EngineError> {
        if self.store.contains_employee(id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(Entity::Employee(id)))
        }
    }

    // ── Timetables ───────────────────────────────────────────

    /// Insert a timetable, closing the preceding one and capping this one's end
    /// where a later timetable already starts. One WAL record covers both rows.
    pub async fn create_timetable(
        &self,
        employee_id: EmployeeId,
        rest_day_number: u8,
        range: DateRange,
        created_by: EmployeeId,
        created_at: Option<DateTime<FixedOffset>>,
    ) -> Result<TimetableChange, EngineError> {
        validate_timetable_fields(rest_day_number, &range)?;
        self.require_employee(created_by)?;
        let mut guard = self.write_employee(employee_id).await?;
        if guard.timetables.len() >= MAX_TIMETABLES_PER_EMPLOYEE {
            return Err(EngineError::LimitExceeded("too many timetables for employee"));
        }

        let placement = plan_placement(employee_id, &guard.timetables, range)?;
        let timetable = Timetable {
            id: self.allocate_timetable_id(),
            employee_id,
            rest_day_number,
            range: placement.range,
            created_by,
            created_at: created_at.unwrap_or_else(|| now_local(self.policy())),
            updated_by: None,
            updated_at: None,
        };
        let event = Event::TimetableCreated {
            timetable: timetable.clone(),
            truncated: placement.truncated_previous,
        };
        self.persist_and_apply(std::slice::from_mut(&mut guard), &event).await?;

        let updated_previous = placement
            .truncated_previous
            .and_then(|t| guard.timetable(t.timetable_id).cloned());
        log_truncations(&timetable, updated_previous.as_ref(), placement.truncated_end);

        Ok(TimetableChange {
            timetable,
            updated_previous,
            truncated_end: placement.truncated_end,
        })
    }

    /// Re-place an existing timetable among its siblings, itself excluded.
    pub async fn update_timetable(
        &self,
        id: TimetableId,
        edit: TimetableEdit,
    ) -> Result<TimetableChange, EngineError> {
        let employee_id = self
            .store
            .timetable_owner(id)
            .ok_or(EngineError::NotFound(Entity::Timetable(id)))?;
        self.require_employee(edit.updated_by)?;
        let mut guard = self.write_employee(employee_id).await?;
        let current = guard
            .timetable(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Timetable(id)))?;

        let rest_day_number = edit.rest_day_number.unwrap_or(current.rest_day_number);
        let range = DateRange::new(
            edit.effective_start_date.unwrap_or(current.range.start),
            edit.effective_end_date.unwrap_or(current.range.end),
        );
        validate_timetable_fields(rest_day_number, &range)?;

        let siblings: Vec<Timetable> = guard.timetables.iter().filter(|t| t.id != id).cloned().collect();
        let placement = plan_placement(employee_id, &siblings, range)?;
        let timetable = Timetable {
            rest_day_number,
            range: placement.range,
            updated_by: Some(edit.updated_by),
            updated_at: Some(edit.updated_at.unwrap_or_else(|| now_local(self.policy()))),
            ..current
        };
        let event = Event::TimetableUpdated {
            timetable: timetable.clone(),
            truncated: placement.truncated_previous,
        };
        self.persist_and_apply(std::slice::from_mut(&mut guard), &event).await?;

        let updated_previous = placement
            .truncated_previous
            .and_then(|t| guard.timetable(t.timetable_id).cloned());
        log_truncations(&timetable, updated_previous.as_ref(), placement.truncated_end);

        Ok(TimetableChange {
            timetable,
            updated_previous,
            truncated_end: placement.truncated_end,
        })
    }

    // ── Appointments ─────────────────────────────────────────

    /// Validate and commit a whole batch for one member, or nothing at all.
    ///
    /// Every item is normalized before any lock is taken. The employees involved
    /// are then write-locked in id order (all of them if any item lets the engine
    /// choose), every item is checked against committed appointments and earlier
    /// items of the batch, and the batch is written as a single WAL record.
    pub async fn book_appointments(&self, request: BookingRequest) -> Result<BookingOutcome, EngineError> {
        if request.appointments.is_empty() {
            return Err(EngineError::Validation {
                index: None,
                reason: "at least one appointment is required".into(),
            });
        }
        if request.appointments.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let policy = *self.policy();
        let items = request
            .appointments
            .iter()
            .enumerate()
            .map(|(i, req)| normalize_item(i, req, &policy))
            .collect::<Result<Vec<NormalizedItem>, EngineError>>()?;

        if !self.store.contains_member(request.member_id) {
            return Err(EngineError::NotFound(Entity::Member(request.member_id)));
        }
        self.require_employee(request.created_by)?;

        let mut lock_ids: Vec<EmployeeId> = items.iter().filter_map(|it| it.employee.employee_id()).collect();
        if items.iter().any(|it| it.employee == EmployeeSelector::AnyAvailable) {
            lock_ids.extend(self.store.employee_ids());
        }
        lock_ids.sort_unstable();
        lock_ids.dedup();
        let mut guards = self.write_employees(&lock_ids).await?;
        let slot: HashMap<EmployeeId, usize> = lock_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut ledger = BatchLedger::default();
        let mut assigned = Vec::with_capacity(items.len());
        for item in &items {
            let employee_id = match item.employee {
                EmployeeSelector::Specific(id) => {
                    let es = &guards[slot[&id]];
                    check_no_conflict(es, &ledger, item.index, item.date, &item.span)?;
                    id
                }
                EmployeeSelector::AnyAvailable => {
                    let open = guards
                        .iter()
                        .map(|g| &**g)
                        .filter(|es| day_load(es, &ledger, item.date) < MAX_APPOINTMENTS_PER_EMPLOYEE_DAY);
                    pick_available(open, &ledger, item.date, &item.span).ok_or(
                        EngineError::NoAvailableStaff {
                            index: item.index,
                            date: item.date,
                            span: item.span,
                        },
                    )?
                }
            };
            if day_load(&guards[slot[&employee_id]], &ledger, item.date) >= MAX_APPOINTMENTS_PER_EMPLOYEE_DAY {
                return Err(EngineError::LimitExceeded("too many appointments for employee on date"));
            }
            ledger.push(item.index, employee_id, item.date, item.span);
            assigned.push(employee_id);
        }

        // Single-item batches get the rest-day check; larger batches skip it.
        let warning = match (items.as_slice(), assigned.as_slice()) {
            ([item], [employee_id]) => guards[slot[employee_id]].rest_day_warning(item.date),
            _ => None,
        };

        let created_at = request.created_at.unwrap_or_else(|| now_local(&policy));
        let first_id = self.allocate_appointment_ids(items.len());
        let appointments: Vec<Appointment> = items
            .into_iter()
            .zip(assigned)
            .enumerate()
            .map(|(offset, (item, employee_id))| Appointment {
                id: first_id + offset as i64,
                member_id: request.member_id,
                servicing_employee_id: employee_id,
                appointment_date: item.date,
                span: item.span,
                remarks: item.remarks,
                created_by: request.created_by,
                created_at,
                updated_at: created_at,
            })
            .collect();

        let event = Event::AppointmentsBooked {
            appointments: appointments.clone(),
        };
        self.persist_and_apply(&mut guards, &event).await?;

        metrics::counter!(crate::observability::APPOINTMENTS_COMMITTED_TOTAL).increment(appointments.len() as u64);
        if let Some(w) = &warning {
            warn!("booked on a rest day for member {}: {w}", request.member_id);
        }
        Ok(BookingOutcome { appointments, warning })
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    /// Holds the directory lock and every employee's read lock until the swap completes.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _directory = self.directory.lock().await;
        let guards = self.read_all_employees().await?;
        let events = self.store.snapshot(guards.iter().map(|g| &**g));

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn log_truncations(timetable: &Timetable, previous: Option<&Timetable>, truncated_end: Option<NaiveDate>) {
    if let Some(prev) = previous {
        info!(
            "employee {}: timetable {} closed at {} for timetable {}",
            timetable.employee_id,
            prev.id,
            prev.range.end.map_or_else(|| "open".to_string(), |d| d.to_string()),
            timetable.id
        );
        metrics::counter!(crate::observability::TIMETABLE_TRUNCATIONS_TOTAL).increment(1);
    }
    if let Some(end) = truncated_end {
        info!(
            "employee {}: timetable {} ends {end}, before a later timetable",
            timetable.employee_id, timetable.id
        );
        metrics::counter!(crate::observability::TIMETABLE_TRUNCATIONS_TOTAL).increment(1);
    }
}
