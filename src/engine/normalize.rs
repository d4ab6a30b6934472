use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Timelike, Utc};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// One booking item as it arrives from a client, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentRequest {
    /// `None` asks the engine to pick any free employee.
    pub servicing_employee_id: Option<EmployeeId>,
    pub appointment_date: String,
    /// Bare `HH:MM` (business offset) or a full RFC 3339 timestamp.
    pub start_time: String,
    pub end_time: String,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub member_id: MemberId,
    pub created_by: EmployeeId,
    pub created_at: Option<DateTime<FixedOffset>>,
    pub appointments: Vec<AppointmentRequest>,
}

/// A batch item that passed format, ordering and operating-hours checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NormalizedItem {
    pub index: usize,
    pub employee: EmployeeSelector,
    pub date: NaiveDate,
    pub span: Span,
    pub remarks: Option<String>,
}

pub(crate) fn now_local(policy: &SchedulePolicy) -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&policy.utc_offset)
}

fn invalid(reason: String) -> EngineError {
    EngineError::InvalidFormat { index: None, reason }
}

fn has_shape(s: &str, shape: &str) -> bool {
    s.len() == shape.len()
        && s.bytes().zip(shape.bytes()).all(|(c, p)| match p {
            b'd' => c.is_ascii_digit(),
            other => c == other,
        })
}

/// Strict `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    if !has_shape(s, "dddd-dd-dd") {
        return Err(invalid(format!("date {s:?}: use YYYY-MM-DD")));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| invalid(format!("date {s:?}: {e}")))
}

/// Strict `HH:MM`, returned as minutes since midnight.
pub fn parse_clock(s: &str) -> Result<Minute, EngineError> {
    if !has_shape(s, "dd:dd") {
        return Err(invalid(format!("time {s:?}: use HH:MM")));
    }
    NaiveTime::parse_from_str(s, "%H:%M")
        .map(minute_of)
        .map_err(|e| invalid(format!("time {s:?}: {e}")))
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<FixedOffset>, EngineError> {
    DateTime::parse_from_rfc3339(s).map_err(|e| invalid(format!("timestamp {s:?}: {e}")))
}

/// Resolve either input form to a minute of `date` at the business offset.
fn normalize_time(
    field: &str,
    raw: &str,
    date: NaiveDate,
    policy: &SchedulePolicy,
) -> Result<Minute, EngineError> {
    let raw = raw.trim();
    if !raw.contains('T') {
        return parse_clock(raw).map_err(|_| {
            invalid(format!("{field} {raw:?}: use \"HH:MM\" or a full ISO 8601 timestamp"))
        });
    }
    let local = parse_timestamp(raw)?.with_timezone(&policy.utc_offset);
    if local.time().second() != 0 || local.time().nanosecond() != 0 {
        return Err(invalid(format!("{field} {raw:?}: sub-minute precision is not supported")));
    }
    if local.date_naive() != date {
        return Err(EngineError::Validation {
            index: None,
            reason: format!("{field} falls on {}, not on appointment_date {date}", local.date_naive()),
        });
    }
    Ok(minute_of(local.time()))
}

/// Checks (a) format and (b) ordering plus operating hours for one item.
pub(crate) fn normalize_item(
    index: usize,
    req: &AppointmentRequest,
    policy: &SchedulePolicy,
) -> Result<NormalizedItem, EngineError> {
    let date = parse_date(req.appointment_date.trim()).map_err(|e| e.at(index))?;
    let start = normalize_time("start_time", &req.start_time, date, policy).map_err(|e| e.at(index))?;
    let end = normalize_time("end_time", &req.end_time, date, policy).map_err(|e| e.at(index))?;

    if start >= end {
        return Err(EngineError::Validation {
            index: Some(index),
            reason: "start_time must be earlier than end_time".into(),
        });
    }
    let span = Span::new(start, end);
    if !policy.admits(&span) {
        return Err(EngineError::Validation {
            index: Some(index),
            reason: format!(
                "{}-{} is outside operating hours {}-{}",
                hhmm(start),
                hhmm(end),
                hhmm(policy.opens_at),
                hhmm(policy.closes_at)
            ),
        });
    }

    let remarks = req
        .remarks
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);
    if remarks.as_ref().is_some_and(|r| r.len() > MAX_REMARKS_LEN) {
        return Err(EngineError::LimitExceeded("remarks too long"));
    }

    let employee = match req.servicing_employee_id {
        Some(id) => EmployeeSelector::Specific(id),
        None => EmployeeSelector::AnyAvailable,
    };

    Ok(NormalizedItem {
        index,
        employee,
        date,
        span,
        remarks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(date: &str, start: &str, end: &str) -> AppointmentRequest {
        AppointmentRequest {
            servicing_employee_id: Some(5),
            appointment_date: date.into(),
            start_time: start.into(),
            end_time: end.into(),
            remarks: Some("  facial  ".into()),
        }
    }

    #[test]
    fn strict_date_shape() {
        assert!(parse_date("2025-06-10").is_ok());
        assert!(parse_date("2025-6-10").is_err());
        assert!(parse_date("2025/06/10").is_err());
        assert!(parse_date("2025-02-30").is_err());
        assert!(parse_date("").is_err());
    }

    #[test]
    fn strict_clock_shape() {
        assert_eq!(parse_clock("10:30").unwrap(), 630);
        assert!(parse_clock("9:30").is_err());
        assert!(parse_clock("24:00").is_err());
        assert!(parse_clock("10:30:00").is_err());
    }

    #[test]
    fn bare_times_use_appointment_date() {
        let item = normalize_item(0, &req("2025-06-10", "10:00", "11:30"), &SchedulePolicy::default()).unwrap();
        assert_eq!(item.span, Span::new(600, 690));
        assert_eq!(item.employee, EmployeeSelector::Specific(5));
        assert_eq!(item.remarks.as_deref(), Some("facial"));
    }

    #[test]
    fn full_timestamps_are_localized() {
        // 02:00Z is 10:00 at +08:00
        let item = normalize_item(
            0,
            &req("2025-06-10", "2025-06-10T02:00:00Z", "2025-06-10T11:00:00+08:00"),
            &SchedulePolicy::default(),
        )
        .unwrap();
        assert_eq!(item.span, Span::new(600, 660));
    }

    #[test]
    fn timestamp_on_another_day_is_rejected() {
        let err = normalize_item(
            2,
            &req("2025-06-10", "2025-06-11T10:00:00+08:00", "2025-06-11T11:00:00+08:00"),
            &SchedulePolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation { index: Some(2), .. }));
    }

    #[test]
    fn malformed_input_reports_position() {
        let err = normalize_item(1, &req("10/06/2025", "10:00", "11:00"), &SchedulePolicy::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidFormat { index: Some(1), .. }));
        assert!(err.to_string().contains("appointment 2"));

        let err = normalize_item(0, &req("2025-06-10", "ten", "11:00"), &SchedulePolicy::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidFormat { index: Some(0), .. }));
    }

    #[test]
    fn start_must_precede_end() {
        let err = normalize_item(0, &req("2025-06-10", "11:00", "11:00"), &SchedulePolicy::default()).unwrap_err();
        assert!(matches!(err, EngineError::Validation { index: Some(0), .. }));
    }

    #[test]
    fn outside_operating_hours_rejected() {
        let p = SchedulePolicy::default();
        assert!(normalize_item(0, &req("2025-06-10", "09:00", "10:00"), &p).is_err());
        assert!(normalize_item(0, &req("2025-06-10", "16:30", "17:30"), &p).is_err());
        assert!(normalize_item(0, &req("2025-06-10", "16:30", "17:00"), &p).is_ok());
    }

    #[test]
    fn missing_employee_means_any_available() {
        let mut r = req("2025-06-10", "10:00", "11:00");
        r.servicing_employee_id = None;
        r.remarks = Some("   ".into());
        let item = normalize_item(0, &r, &SchedulePolicy::default()).unwrap();
        assert_eq!(item.employee, EmployeeSelector::AnyAvailable);
        assert_eq!(item.remarks, None);
    }
}
