use super::*;
use crate::limits::*;

use chrono::{Days, NaiveDate};

const H: Minute = 60;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("salonslot_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn date(s: &str) -> NaiveDate {
    parse_date(s).unwrap()
}

fn open_engine(path: &PathBuf) -> Engine {
    Engine::new(path.clone(), Arc::new(NotifyHub::new()), EngineSettings::default()).unwrap()
}

/// Engine with employees 1 (front desk), 5 and 6, and member 9.
async fn salon(name: &str) -> (Engine, PathBuf) {
    let path = test_wal_path(name);
    let engine = open_engine(&path);
    engine.register_employee(1, Some("Desk".into())).await.unwrap();
    engine.register_employee(5, Some("Mei".into())).await.unwrap();
    engine.register_employee(6, Some("Ravi".into())).await.unwrap();
    engine.register_member(9, Some("Ana".into())).await.unwrap();
    (engine, path)
}

fn item(employee: Option<EmployeeId>, day: &str, start: &str, end: &str) -> AppointmentRequest {
    AppointmentRequest {
        servicing_employee_id: employee,
        appointment_date: day.into(),
        start_time: start.into(),
        end_time: end.into(),
        remarks: None,
    }
}

fn booking(items: Vec<AppointmentRequest>) -> BookingRequest {
    BookingRequest {
        member_id: 9,
        created_by: 1,
        created_at: None,
        appointments: items,
    }
}

fn open_range(start: &str) -> DateRange {
    DateRange::new(date(start), None)
}

// ── Availability scenarios ───────────────────────────────

#[tokio::test]
async fn empty_day_offers_full_window() {
    let (engine, _) = salon("empty_day.wal").await;
    let day = engine
        .max_durations_for_date(EmployeeSelector::Specific(5), date("2025-06-10"), None)
        .await
        .unwrap();
    let first = day.max_durations[0];
    assert_eq!(first.start, 10 * H);
    assert_eq!(first.max_end, 17 * H);
    assert_eq!(first.minutes(), 420);
    assert_eq!(day.max_durations.len(), 14);
    assert!(day.warning.is_none());
}

#[tokio::test]
async fn booked_hour_hides_covered_starts() {
    let (engine, _) = salon("booked_hour.wal").await;
    engine
        .book_appointments(booking(vec![item(Some(5), "2025-06-10", "11:00", "12:00")]))
        .await
        .unwrap();

    let day = engine
        .max_durations_for_date(EmployeeSelector::Specific(5), date("2025-06-10"), None)
        .await
        .unwrap();
    let starts: Vec<Minute> = day.max_durations.iter().map(|d| d.start).collect();
    assert!(!starts.contains(&(11 * H)));
    assert!(!starts.contains(&(11 * H + 30)));
    assert_eq!(day.max_durations[0].max_end, 11 * H);
}

#[tokio::test]
async fn excluded_appointment_is_ignored() {
    let (engine, _) = salon("exclude.wal").await;
    let outcome = engine
        .book_appointments(booking(vec![item(Some(5), "2025-06-10", "11:00", "12:00")]))
        .await
        .unwrap();
    let id = outcome.appointments[0].id;

    let day = engine
        .max_durations_for_date(EmployeeSelector::Specific(5), date("2025-06-10"), Some(id))
        .await
        .unwrap();
    assert_eq!(day.max_durations[0].max_end, 17 * H);

    let ends = engine
        .end_times_for_start(EmployeeSelector::Specific(5), date("2025-06-10"), 11 * H, Some(id))
        .await
        .unwrap();
    assert_eq!(ends.last(), Some(&(17 * H)));
}

#[tokio::test]
async fn end_times_stop_at_next_booking() {
    let (engine, _) = salon("end_times.wal").await;
    engine
        .book_appointments(booking(vec![item(Some(5), "2025-06-10", "12:00", "13:00")]))
        .await
        .unwrap();

    let ends = engine
        .end_times_for_start(EmployeeSelector::Specific(5), date("2025-06-10"), 10 * H + 30, None)
        .await
        .unwrap();
    assert_eq!(ends, vec![11 * H, 11 * H + 30, 12 * H]);

    let inside = engine
        .end_times_for_start(EmployeeSelector::Specific(5), date("2025-06-10"), 12 * H + 30, None)
        .await
        .unwrap();
    assert!(inside.is_empty());

    let before_open = engine
        .end_times_for_start(EmployeeSelector::Specific(5), date("2025-06-10"), 9 * H, None)
        .await
        .unwrap();
    assert!(before_open.is_empty());
}

#[tokio::test]
async fn any_available_takes_best_end_per_start() {
    let (engine, _) = salon("any_available.wal").await;
    // Everyone but employee 6 is busy from 11:00.
    engine
        .book_appointments(booking(vec![
            item(Some(1), "2025-06-10", "11:00", "17:00"),
            item(Some(5), "2025-06-10", "11:00", "17:00"),
            item(Some(6), "2025-06-10", "13:00", "14:00"),
        ]))
        .await
        .unwrap();

    let day = engine
        .max_durations_for_date(EmployeeSelector::AnyAvailable, date("2025-06-10"), None)
        .await
        .unwrap();
    assert!(day.warning.is_none());
    let at = |start: Minute| day.max_durations.iter().find(|d| d.start == start).copied();
    assert_eq!(at(10 * H).map(|d| d.max_end), Some(13 * H));
    assert_eq!(at(11 * H).map(|d| d.max_end), Some(13 * H));
    assert!(at(13 * H).is_none());
    assert_eq!(at(14 * H).map(|d| d.max_end), Some(17 * H));

    let ends = engine
        .end_times_for_start(EmployeeSelector::AnyAvailable, date("2025-06-10"), 12 * H, None)
        .await
        .unwrap();
    assert_eq!(ends, vec![12 * H + 30, 13 * H]);
}

#[tokio::test]
async fn unknown_employee_is_not_found() {
    let (engine, _) = salon("unknown_employee.wal").await;
    let err = engine
        .max_durations_for_date(EmployeeSelector::Specific(77), date("2025-06-10"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Employee(77))));
}

#[tokio::test]
async fn availability_reads_are_repeatable() {
    let (engine, _) = salon("repeatable.wal").await;
    engine
        .book_appointments(booking(vec![item(Some(5), "2025-06-10", "14:00", "15:30")]))
        .await
        .unwrap();
    let a = engine
        .max_durations_for_date(EmployeeSelector::Specific(5), date("2025-06-10"), None)
        .await
        .unwrap();
    let b = engine
        .max_durations_for_date(EmployeeSelector::Specific(5), date("2025-06-10"), None)
        .await
        .unwrap();
    assert_eq!(a, b);
}

// ── Booking scenarios ────────────────────────────────────

#[tokio::test]
async fn before_opening_rejects_whole_batch() {
    let (engine, _) = salon("before_opening.wal").await;
    let err = engine
        .book_appointments(booking(vec![item(Some(5), "2025-06-10", "09:00", "10:00")]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert!(engine.appointments_on(EmployeeSelector::AnyAvailable, date("2025-06-10")).await.unwrap().is_empty());
}

#[tokio::test]
async fn overlapping_items_in_one_batch_reject_everything() {
    let (engine, _) = salon("batch_overlap.wal").await;
    let err = engine
        .book_appointments(booking(vec![
            item(Some(6), "2025-06-10", "15:00", "16:00"),
            item(Some(5), "2025-06-10", "10:00", "11:00"),
            item(Some(5), "2025-06-10", "10:30", "11:30"),
        ]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OverlapConflict);
    assert!(matches!(err, EngineError::AppointmentOverlap { index: 2, clash: Clash::Batch(1), .. }));
    assert!(err.to_string().contains("appointment 3"));
    assert!(engine.appointments_on(EmployeeSelector::AnyAvailable, date("2025-06-10")).await.unwrap().is_empty());
}

#[tokio::test]
async fn overlap_with_committed_appointment_rejected() {
    let (engine, _) = salon("existing_overlap.wal").await;
    let first = engine
        .book_appointments(booking(vec![item(Some(5), "2025-06-10", "11:00", "12:00")]))
        .await
        .unwrap();
    let err = engine
        .book_appointments(booking(vec![
            item(Some(5), "2025-06-11", "11:00", "12:00"),
            item(Some(5), "2025-06-10", "11:30", "12:30"),
        ]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::AppointmentOverlap { index: 1, clash: Clash::Existing(id), .. } if id == first.appointments[0].id
    ));
    assert!(engine.appointments_on(EmployeeSelector::Specific(5), date("2025-06-11")).await.unwrap().is_empty());
}

#[tokio::test]
async fn rest_day_booking_succeeds_with_warning() {
    let (engine, _) = salon("rest_day.wal").await;
    engine
        .create_timetable(5, 2, open_range("2025-01-01"), 1, None)
        .await
        .unwrap();

    // 2025-06-10 is a Tuesday.
    let outcome = engine
        .book_appointments(booking(vec![item(Some(5), "2025-06-10", "10:00", "11:00")]))
        .await
        .unwrap();
    let warning = outcome.warning.expect("rest-day warning");
    assert!(warning.contains("Mei"));
    assert_eq!(outcome.appointments.len(), 1);
    assert_eq!(
        engine.appointments_on(EmployeeSelector::Specific(5), date("2025-06-10")).await.unwrap().len(),
        1
    );

    let day = engine
        .max_durations_for_date(EmployeeSelector::Specific(5), date("2025-06-10"), None)
        .await
        .unwrap();
    assert!(day.warning.is_some());
    assert!(!day.max_durations.is_empty());
}

#[tokio::test]
async fn multi_item_batches_skip_rest_day_warning() {
    let (engine, _) = salon("rest_day_batch.wal").await;
    engine
        .create_timetable(5, 2, open_range("2025-01-01"), 1, None)
        .await
        .unwrap();
    let outcome = engine
        .book_appointments(booking(vec![
            item(Some(5), "2025-06-10", "10:00", "11:00"),
            item(Some(5), "2025-06-10", "11:00", "12:00"),
        ]))
        .await
        .unwrap();
    assert!(outcome.warning.is_none());
    assert_eq!(outcome.appointments.len(), 2);
}

#[tokio::test]
async fn auto_assignment_picks_lowest_free_employee() {
    let (engine, _) = salon("auto_assign.wal").await;
    engine
        .book_appointments(booking(vec![item(Some(1), "2025-06-10", "10:00", "12:00")]))
        .await
        .unwrap();

    let outcome = engine
        .book_appointments(booking(vec![
            item(None, "2025-06-10", "10:00", "11:00"),
            item(None, "2025-06-10", "10:30", "11:30"),
        ]))
        .await
        .unwrap();
    let assigned: Vec<EmployeeId> = outcome.appointments.iter().map(|a| a.servicing_employee_id).collect();
    assert_eq!(assigned, vec![5, 6]);

    let err = engine
        .book_appointments(booking(vec![item(None, "2025-06-10", "10:30", "11:00")]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoAvailableStaff { index: 0, .. }));
    assert_eq!(err.kind(), ErrorKind::OverlapConflict);
}

#[tokio::test]
async fn full_timestamps_and_remarks_are_normalized() {
    let (engine, _) = salon("timestamps.wal").await;
    let mut req = item(Some(5), "2025-06-10", "2025-06-10T03:00:00Z", "2025-06-10T12:30:00+08:00");
    req.remarks = Some("  scalp treatment ".into());
    let outcome = engine.book_appointments(booking(vec![req])).await.unwrap();
    let a = &outcome.appointments[0];
    assert_eq!(a.span, Span::new(11 * H, 12 * H + 30));
    assert_eq!(a.remarks.as_deref(), Some("scalp treatment"));
    assert_eq!(a.created_at.offset().local_minus_utc(), 8 * 3600);
}

#[tokio::test]
async fn malformed_item_fails_before_anything_is_written() {
    let (engine, _) = salon("malformed.wal").await;
    let err = engine
        .book_appointments(booking(vec![
            item(Some(5), "2025-06-10", "10:00", "11:00"),
            item(Some(5), "2025-13-01", "10:00", "11:00"),
        ]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidFormat { index: Some(1), .. }));
    assert!(engine.appointments_on(EmployeeSelector::Specific(5), date("2025-06-10")).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_member_creator_or_employee_rejected() {
    let (engine, _) = salon("unknown_refs.wal").await;

    let mut req = booking(vec![item(Some(5), "2025-06-10", "10:00", "11:00")]);
    req.member_id = 404;
    let err = engine.book_appointments(req).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Member(404))));

    let mut req = booking(vec![item(Some(5), "2025-06-10", "10:00", "11:00")]);
    req.created_by = 404;
    let err = engine.book_appointments(req).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Employee(404))));

    let err = engine
        .book_appointments(booking(vec![item(Some(404), "2025-06-10", "10:00", "11:00")]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Employee(404))));
}

#[tokio::test]
async fn empty_and_oversized_batches_rejected() {
    let (engine, _) = salon("batch_size.wal").await;
    let err = engine.book_appointments(booking(vec![])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let items = (0..=MAX_BATCH_SIZE)
        .map(|_| item(Some(5), "2025-06-10", "10:00", "10:30"))
        .collect();
    let err = engine.book_appointments(booking(items)).await.unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

fn minute_items(employee: EmployeeId, from: Minute, count: usize) -> Vec<AppointmentRequest> {
    (from..from + count as Minute)
        .map(|m| item(Some(employee), "2025-06-10", &hhmm(m), &hhmm(m + 1)))
        .collect()
}

#[tokio::test]
async fn daily_cap_counts_items_earlier_in_the_batch() {
    let (engine, _) = salon("daily_cap.wal").await;
    let open = 10 * H;
    engine.book_appointments(booking(minute_items(5, open, 100))).await.unwrap();
    engine.book_appointments(booking(minute_items(5, open + 100, 95))).await.unwrap();

    let err = engine
        .book_appointments(booking(minute_items(5, open + 195, 10)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    let day = engine.appointments_on(EmployeeSelector::Specific(5), date("2025-06-10")).await.unwrap();
    assert_eq!(day.len(), 195);

    engine.book_appointments(booking(minute_items(5, open + 195, 5))).await.unwrap();
    let day = engine.appointments_on(EmployeeSelector::Specific(5), date("2025-06-10")).await.unwrap();
    assert_eq!(day.len(), MAX_APPOINTMENTS_PER_EMPLOYEE_DAY);
}

#[tokio::test]
async fn any_available_skips_employee_at_daily_cap() {
    let (engine, _) = salon("daily_cap_any.wal").await;
    let open = 10 * H;
    engine.book_appointments(booking(minute_items(1, open, 100))).await.unwrap();
    engine.book_appointments(booking(minute_items(1, open + 100, 100))).await.unwrap();

    let outcome = engine
        .book_appointments(booking(vec![item(None, "2025-06-10", "16:00", "16:30")]))
        .await
        .unwrap();
    assert_eq!(outcome.appointments[0].servicing_employee_id, 5);
}

#[tokio::test]
async fn concurrent_bookings_for_same_slot_commit_once() {
    let (engine, _) = salon("concurrent.wal").await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .book_appointments(booking(vec![item(Some(5), "2025-06-10", "10:00", "11:00")]))
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::OverlapConflict),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(
        engine.appointments_on(EmployeeSelector::Specific(5), date("2025-06-10")).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn held_lock_times_out_as_concurrency_conflict() {
    let path = test_wal_path("lock_timeout.wal");
    let settings = EngineSettings {
        lock_timeout: Duration::from_millis(50),
        ..EngineSettings::default()
    };
    let engine = Engine::new(path, Arc::new(NotifyHub::new()), settings).unwrap();
    engine.register_employee(5, None).await.unwrap();
    engine.register_member(9, None).await.unwrap();

    let _held = engine.write_employee(5).await.unwrap();
    let err = engine
        .book_appointments(BookingRequest {
            member_id: 9,
            created_by: 5,
            created_at: None,
            appointments: vec![item(Some(5), "2025-06-10", "10:00", "11:00")],
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
}

#[tokio::test]
async fn appointments_never_overlap_per_employee_day() {
    let (engine, _) = salon("no_overlap_property.wal").await;
    let mut seed: u64 = 42;
    for _ in 0..200 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let start = 10 * H + ((seed >> 33) % 14) as Minute * 30;
        let len = 30 * (1 + ((seed >> 45) % 4) as Minute);
        let employee = if seed & 1 == 0 { Some(5) } else { None };
        let day = if (seed >> 7) & 1 == 0 { "2025-06-10" } else { "2025-06-11" };
        let _ = engine
            .book_appointments(booking(vec![item(employee, day, &hhmm(start), &hhmm(start + len))]))
            .await;
    }

    for day in ["2025-06-10", "2025-06-11"] {
        for id in [1, 5, 6] {
            let list = engine.appointments_on(EmployeeSelector::Specific(id), date(day)).await.unwrap();
            for pair in list.windows(2) {
                assert!(pair[0].span.end <= pair[1].span.start, "{:?} overlaps {:?}", pair[0], pair[1]);
            }
        }
    }
}

// ── Timetables ───────────────────────────────────────────

#[tokio::test]
async fn new_timetable_closes_open_predecessor() {
    let (engine, _) = salon("timetable_truncate.wal").await;
    let first = engine
        .create_timetable(5, 2, open_range("2025-01-01"), 1, None)
        .await
        .unwrap();
    assert!(first.updated_previous.is_none());

    let second = engine
        .create_timetable(5, 4, open_range("2025-06-01"), 1, None)
        .await
        .unwrap();
    let prev = second.updated_previous.expect("predecessor closed");
    assert_eq!(prev.id, first.timetable.id);
    assert_eq!(prev.range.end, Some(date("2025-05-31")));
    assert_eq!(second.timetable.range.start, date("2025-06-01"));

    let stored = engine.get_timetable(first.timetable.id).await.unwrap();
    assert_eq!(stored.range.end, Some(date("2025-05-31")));
}

#[tokio::test]
async fn timetable_inserted_before_later_one_is_capped() {
    let (engine, _) = salon("timetable_cap.wal").await;
    engine
        .create_timetable(5, 2, open_range("2025-06-01"), 1, None)
        .await
        .unwrap();
    let earlier = engine
        .create_timetable(5, 3, DateRange::new(date("2025-03-01"), Some(date("2025-08-01"))), 1, None)
        .await
        .unwrap();
    assert_eq!(earlier.truncated_end, Some(date("2025-05-31")));
    assert_eq!(earlier.timetable.range.end, Some(date("2025-05-31")));
}

#[tokio::test]
async fn timetable_conflicts_and_bad_ranges() {
    let (engine, _) = salon("timetable_conflict.wal").await;
    engine
        .create_timetable(5, 2, DateRange::new(date("2025-01-01"), Some(date("2025-12-31"))), 1, None)
        .await
        .unwrap();

    let err = engine
        .create_timetable(5, 3, open_range("2025-01-01"), 1, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OverlapConflict);

    let err = engine
        .create_timetable(5, 3, DateRange::new(date("2025-03-01"), Some(date("2025-04-01"))), 1, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OverlapConflict);

    let err = engine
        .create_timetable(5, 9, open_range("2026-01-01"), 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRange(_)));

    let err = engine
        .create_timetable(5, 1, DateRange::new(date("2026-02-01"), Some(date("2026-01-01"))), 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRange(_)));

    assert_eq!(engine.list_timetables(5).await.unwrap().len(), 1);
}

#[tokio::test]
async fn update_revalidates_against_siblings() {
    let (engine, _) = salon("timetable_update.wal").await;
    let a = engine
        .create_timetable(5, 2, open_range("2025-01-01"), 1, None)
        .await
        .unwrap()
        .timetable;
    let b = engine
        .create_timetable(5, 3, open_range("2025-06-01"), 1, None)
        .await
        .unwrap()
        .timetable;

    // Moving b earlier pulls a's end in again.
    let change = engine
        .update_timetable(
            b.id,
            TimetableEdit {
                rest_day_number: Some(5),
                effective_start_date: Some(date("2025-04-01")),
                effective_end_date: None,
                updated_by: 1,
                updated_at: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(change.timetable.rest_day_number, 5);
    assert_eq!(change.timetable.updated_by, Some(1));
    assert_eq!(change.updated_previous.map(|t| (t.id, t.range.end)), Some((a.id, Some(date("2025-03-31")))));

    // Keeping its own start neither conflicts with itself nor touches a again.
    let change = engine
        .update_timetable(
            b.id,
            TimetableEdit {
                rest_day_number: Some(6),
                effective_start_date: None,
                effective_end_date: None,
                updated_by: 1,
                updated_at: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(change.timetable.rest_day_number, 6);
    assert_eq!(change.timetable.range.start, date("2025-04-01"));
    assert!(change.updated_previous.is_none());

    let err = engine
        .update_timetable(
            999,
            TimetableEdit {
                rest_day_number: None,
                effective_start_date: None,
                effective_end_date: None,
                updated_by: 1,
                updated_at: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Timetable(999))));
}

#[tokio::test]
async fn timetable_schedule_splits_current_and_upcoming() {
    let (engine, _) = salon("timetable_schedule.wal").await;
    let a = engine.create_timetable(5, 2, open_range("2025-01-01"), 1, None).await.unwrap().timetable;
    let b = engine.create_timetable(5, 3, open_range("2025-09-01"), 1, None).await.unwrap().timetable;

    let schedule = engine.timetable_schedule(5, date("2025-06-10")).await.unwrap();
    assert_eq!(schedule.current.map(|t| t.id), Some(a.id));
    assert_eq!(schedule.upcoming.iter().map(|t| t.id).collect::<Vec<_>>(), vec![b.id]);
}

#[tokio::test]
async fn timetables_never_overlap_after_random_edits() {
    let (engine, _) = salon("timetable_property.wal").await;
    let base = date("2025-01-01");
    let mut seed: u64 = 7;
    let mut created: Vec<TimetableId> = Vec::new();
    for _ in 0..150 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let start = base.checked_add_days(Days::new((seed >> 33) % 500)).unwrap();
        let end = match (seed >> 20) % 3 {
            0 => None,
            _ => start.checked_add_days(Days::new((seed >> 40) % 60)),
        };
        let rest = 1 + ((seed >> 50) % 7) as u8;
        if (seed >> 11) % 4 == 0 && !created.is_empty() {
            let id = created[(seed as usize >> 3) % created.len()];
            let _ = engine
                .update_timetable(
                    id,
                    TimetableEdit {
                        rest_day_number: Some(rest),
                        effective_start_date: Some(start),
                        effective_end_date: Some(end),
                        updated_by: 1,
                        updated_at: None,
                    },
                )
                .await;
        } else if let Ok(change) = engine.create_timetable(5, rest, DateRange::new(start, end), 1, None).await {
            created.push(change.timetable.id);
        }

        let list = engine.list_timetables(5).await.unwrap();
        for pair in list.windows(2) {
            assert!(!pair[0].range.overlaps(&pair[1].range), "{} overlaps {}", pair[0].range, pair[1].range);
        }
        assert!(list.iter().filter(|t| t.range.is_open()).count() <= 1);
    }
}

// ── Directory ────────────────────────────────────────────

#[tokio::test]
async fn duplicate_registration_rejected() {
    let (engine, _) = salon("duplicates.wal").await;
    assert!(matches!(
        engine.register_employee(5, None).await,
        Err(EngineError::AlreadyExists(Entity::Employee(5)))
    ));
    assert!(matches!(
        engine.register_member(9, None).await,
        Err(EngineError::AlreadyExists(Entity::Member(9)))
    ));
    assert!(matches!(
        engine.register_employee(0, None).await,
        Err(EngineError::InvalidFormat { .. })
    ));
    assert_eq!(engine.list_employees().await.unwrap().len(), 3);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state_and_id_sequences() {
    let (engine, path) = salon("replay.wal").await;
    let first = engine.create_timetable(5, 2, open_range("2025-01-01"), 1, None).await.unwrap();
    engine.create_timetable(5, 4, open_range("2025-06-01"), 1, None).await.unwrap();
    let booked = engine
        .book_appointments(booking(vec![
            item(Some(5), "2025-06-10", "10:00", "11:00"),
            item(Some(6), "2025-06-10", "10:00", "11:00"),
        ]))
        .await
        .unwrap();
    drop(engine);

    let engine = open_engine(&path);
    assert_eq!(engine.store.employee_count(), 3);
    assert!(engine.store.contains_member(9));
    let restored = engine.get_timetable(first.timetable.id).await.unwrap();
    assert_eq!(restored.range.end, Some(date("2025-05-31")));
    let list = engine.appointments_on(EmployeeSelector::AnyAvailable, date("2025-06-10")).await.unwrap();
    assert_eq!(list, booked.appointments);

    let next = engine
        .book_appointments(booking(vec![item(Some(5), "2025-06-10", "11:00", "12:00")]))
        .await
        .unwrap();
    let max_before = booked.appointments.iter().map(|a| a.id).max().unwrap();
    assert!(next.appointments[0].id > max_before);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let (engine, path) = salon("compaction.wal").await;
    engine.create_timetable(5, 2, open_range("2025-01-01"), 1, None).await.unwrap();
    engine.create_timetable(5, 4, open_range("2025-06-01"), 1, None).await.unwrap();
    for hour in 10..16 {
        engine
            .book_appointments(booking(vec![item(Some(6), "2025-06-10", &hhmm(hour * H), &hhmm(hour * H + 30))]))
            .await
            .unwrap();
    }
    assert!(engine.wal_appends_since_compact().await > 0);
    let before = std::fs::metadata(&path).unwrap().len();

    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    let after = std::fs::metadata(&path).unwrap().len();
    assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
    drop(engine);

    let engine = open_engine(&path);
    assert_eq!(engine.list_timetables(5).await.unwrap().len(), 2);
    assert_eq!(
        engine.appointment_counts(date("2025-06-10")).await.unwrap(),
        vec![(1, 0), (5, 0), (6, 6)]
    );
}

#[tokio::test]
async fn committed_events_reach_subscribers() {
    let (engine, _) = salon("notify.wal").await;
    let mut rx = engine.notify.subscribe(5);
    engine
        .book_appointments(booking(vec![item(Some(5), "2025-06-10", "10:00", "11:00")]))
        .await
        .unwrap();
    let payload = rx.recv().await.unwrap();
    assert!(payload.contains("AppointmentsBooked"));
    assert!(payload.contains("2025-06-10"));
}

#[tokio::test]
async fn appointment_lookup_by_id() {
    let (engine, _) = salon("lookup.wal").await;
    let outcome = engine
        .book_appointments(booking(vec![item(Some(6), "2025-06-12", "15:00", "16:00")]))
        .await
        .unwrap();
    let id = outcome.appointments[0].id;
    assert_eq!(engine.get_appointment(id).await.unwrap(), outcome.appointments[0]);
    assert!(matches!(
        engine.get_appointment(id + 100).await,
        Err(EngineError::NotFound(Entity::Appointment(_)))
    ));
}
