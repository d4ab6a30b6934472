use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "salonslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "salonslot_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "salonslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "salonslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "salonslot_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "salonslot_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "salonslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "salonslot_wal_flush_batch_size";

// ── Domain ──────────────────────────────────────────────────────

/// Counter: appointments written by committed bookings.
pub const APPOINTMENTS_COMMITTED_TOTAL: &str = "salonslot_appointments_committed_total";

/// Counter: timetables whose end date was moved by a later insert or update.
pub const TIMETABLE_TRUNCATIONS_TOTAL: &str = "salonslot_timetable_truncations_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertEmployees { .. } => "insert_employees",
        Command::InsertMembers { .. } => "insert_members",
        Command::InsertTimetable { .. } => "insert_timetable",
        Command::UpdateTimetable { .. } => "update_timetable",
        Command::InsertAppointments { .. } => "insert_appointments",
        Command::SelectMaxDurations { .. } => "select_max_durations",
        Command::SelectEndTimes { .. } => "select_end_times",
        Command::SelectRestDayWarning { .. } => "select_rest_day_warning",
        Command::SelectTimetable { .. } => "select_timetable",
        Command::SelectTimetables { .. } => "select_timetables",
        Command::SelectTimetableSchedule { .. } => "select_timetable_schedule",
        Command::SelectAppointment { .. } => "select_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectAppointmentCounts { .. } => "select_appointment_counts",
        Command::SelectEmployees => "select_employees",
        Command::Listen { .. } => "listen",
    }
}
