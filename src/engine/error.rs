use chrono::NaiveDate;

use crate::model::*;

/// Something a request referred to by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Employee(EmployeeId),
    Member(MemberId),
    Timetable(TimetableId),
    Appointment(AppointmentId),
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Employee(id) => write!(f, "employee {id}"),
            Entity::Member(id) => write!(f, "member {id}"),
            Entity::Timetable(id) => write!(f, "timetable {id}"),
            Entity::Appointment(id) => write!(f, "appointment {id}"),
        }
    }
}

/// What an appointment collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clash {
    /// An already committed appointment.
    Existing(AppointmentId),
    /// An earlier item of the same batch (zero-based index).
    Batch(usize),
}

/// Caller-facing classification of every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidFormat,
    ValidationError,
    OverlapConflict,
    NotFound,
    AlreadyExists,
    ConcurrencyConflict,
    LimitExceeded,
    Storage,
}

#[derive(Debug)]
pub enum EngineError {
    /// Malformed date, time or id. `index` is the zero-based batch position, if any.
    InvalidFormat {
        index: Option<usize>,
        reason: String,
    },
    /// Business-rule violation within a single item.
    Validation {
        index: Option<usize>,
        reason: String,
    },
    /// End before start, or rest day outside 1–7.
    InvalidRange(String),
    TimetableOverlap {
        employee_id: EmployeeId,
        range: DateRange,
        existing: TimetableId,
        reason: &'static str,
    },
    AppointmentOverlap {
        index: usize,
        employee_id: EmployeeId,
        date: NaiveDate,
        span: Span,
        clash: Clash,
    },
    NoAvailableStaff {
        index: usize,
        date: NaiveDate,
        span: Span,
    },
    NotFound(Entity),
    AlreadyExists(Entity),
    /// Could not obtain a consistent view in time; nothing was written.
    ConcurrencyConflict(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidFormat { .. } => ErrorKind::InvalidFormat,
            EngineError::Validation { .. } | EngineError::InvalidRange(_) => ErrorKind::ValidationError,
            EngineError::TimetableOverlap { .. }
            | EngineError::AppointmentOverlap { .. }
            | EngineError::NoAvailableStaff { .. } => ErrorKind::OverlapConflict,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EngineError::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            EngineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn at(self, index: usize) -> Self {
        match self {
            EngineError::InvalidFormat { index: None, reason } => EngineError::InvalidFormat {
                index: Some(index),
                reason,
            },
            EngineError::Validation { index: None, reason } => EngineError::Validation {
                index: Some(index),
                reason,
            },
            other => other,
        }
    }
}

/// 1-based position used in every message, matching how clients number their rows.
struct Position(Option<usize>);

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(i) => write!(f, " at appointment {}", i + 1),
            None => Ok(()),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidFormat { index, reason } => {
                write!(f, "invalid format{}: {reason}", Position(*index))
            }
            EngineError::Validation { index, reason } => {
                write!(f, "validation failed{}: {reason}", Position(*index))
            }
            EngineError::InvalidRange(msg) => write!(f, "invalid range: {msg}"),
            EngineError::TimetableOverlap {
                employee_id,
                range,
                existing,
                reason,
            } => write!(
                f,
                "timetable {range} for employee {employee_id} overlaps timetable {existing}: {reason}"
            ),
            EngineError::AppointmentOverlap {
                index,
                employee_id,
                date,
                span,
                clash,
            } => {
                write!(
                    f,
                    "appointment {} ({date} {}-{}) for employee {employee_id} overlaps ",
                    index + 1,
                    hhmm(span.start),
                    hhmm(span.end)
                )?;
                match clash {
                    Clash::Existing(id) => write!(f, "existing appointment {id}"),
                    Clash::Batch(other) => write!(f, "appointment {} of the same request", other + 1),
                }
            }
            EngineError::NoAvailableStaff { index, date, span } => write!(
                f,
                "no available employee for appointment {} ({date} {}-{})",
                index + 1,
                hhmm(span.start),
                hhmm(span.end)
            ),
            EngineError::NotFound(entity) => write!(f, "not found: {entity}"),
            EngineError::AlreadyExists(entity) => write!(f, "already exists: {entity}"),
            EngineError::ConcurrencyConflict(msg) => {
                write!(f, "concurrency conflict, safe to retry: {msg}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
