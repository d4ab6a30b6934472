use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SalonSlotFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Auth ─────────────────────────────────────────────────────────

/// Every user shares one password; the database name selects the tenant.
#[derive(Debug)]
pub struct SalonSlotAuthSource {
    password: String,
}

impl SalonSlotAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SalonSlotAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Handler ──────────────────────────────────────────────────────

pub struct SalonSlotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SalonSlotQueryParser>,
}

impl SalonSlotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SalonSlotQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse and run one statement, recording query metrics either way.
    async fn run(&self, engine: &Engine, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertEmployees { rows } => {
                let count = rows.len();
                for (id, name) in rows {
                    engine.register_employee(id, name).await.map_err(engine_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::InsertMembers { rows } => {
                let count = rows.len();
                for (id, name) in rows {
                    engine.register_member(id, name).await.map_err(engine_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::InsertTimetable {
                employee_id,
                rest_day_number,
                range,
                created_by,
                created_at,
            } => {
                let change = engine
                    .create_timetable(employee_id, rest_day_number, range, created_by, created_at)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(schema_for("insert:timetables"));
                let row = encode_timetable_change(&schema, &change);
                Ok(rows_response(schema, vec![row]))
            }
            Command::UpdateTimetable { id, edit } => {
                let change = engine.update_timetable(id, edit).await.map_err(engine_err)?;
                let schema = Arc::new(schema_for("update:timetables"));
                let row = encode_timetable_change(&schema, &change);
                Ok(rows_response(schema, vec![row]))
            }
            Command::InsertAppointments { request } => {
                let outcome = engine.book_appointments(request).await.map_err(engine_err)?;
                let schema = Arc::new(schema_for("insert:appointments"));
                let rows: Vec<PgWireResult<DataRow>> = outcome
                    .appointments
                    .iter()
                    .map(|a| encode_appointment(&schema, a, Some(&outcome.warning)))
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectMaxDurations {
                selector,
                date,
                exclude_appointment_id,
            } => {
                let day = engine
                    .max_durations_for_date(selector, date, exclude_appointment_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(schema_for("max_durations"));
                let employee = day.selector.to_string();
                let date = day.date.to_string();
                let rows: Vec<PgWireResult<DataRow>> = day
                    .max_durations
                    .iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&employee)?;
                        encoder.encode_field(&date)?;
                        encoder.encode_field(&hhmm(slot.start))?;
                        encoder.encode_field(&hhmm(slot.max_end))?;
                        encoder.encode_field(&slot.minutes())?;
                        encoder.encode_field(&day.warning)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectEndTimes {
                selector,
                date,
                start,
                exclude_appointment_id,
            } => {
                let ends = engine
                    .end_times_for_start(selector, date, start, exclude_appointment_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(schema_for("end_times"));
                let employee = selector.to_string();
                let date = date.to_string();
                let start = hhmm(start);
                let rows: Vec<PgWireResult<DataRow>> = ends
                    .into_iter()
                    .map(|end| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&employee)?;
                        encoder.encode_field(&date)?;
                        encoder.encode_field(&start)?;
                        encoder.encode_field(&hhmm(end))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectRestDayWarning { employee_id, date } => {
                let warning = engine.rest_day_warning(employee_id, date).await.map_err(engine_err)?;
                let schema = Arc::new(schema_for("rest_day_warning"));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&employee_id)?;
                encoder.encode_field(&date.to_string())?;
                encoder.encode_field(&warning)?;
                Ok(rows_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectTimetable { id } => {
                let timetable = engine.get_timetable(id).await.map_err(engine_err)?;
                let schema = Arc::new(schema_for("timetables"));
                let row = encode_timetable(&schema, &timetable);
                Ok(rows_response(schema, vec![row]))
            }
            Command::SelectTimetables { employee_id } => {
                let timetables = engine.list_timetables(employee_id).await.map_err(engine_err)?;
                let schema = Arc::new(schema_for("timetables"));
                let rows: Vec<PgWireResult<DataRow>> = timetables.iter().map(|t| encode_timetable(&schema, t)).collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectTimetableSchedule { employee_id, date } => {
                let schedule = engine.timetable_schedule(employee_id, date).await.map_err(engine_err)?;
                let schema = Arc::new(schema_for("timetable_schedule"));
                let rows: Vec<PgWireResult<DataRow>> = schedule
                    .current
                    .iter()
                    .map(|t| ("current", t))
                    .chain(schedule.upcoming.iter().map(|t| ("upcoming", t)))
                    .map(|(label, t)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&label.to_string())?;
                        encode_timetable_fields(&mut encoder, t)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectAppointment { id } => {
                let appointment = engine.get_appointment(id).await.map_err(engine_err)?;
                let schema = Arc::new(schema_for("appointments"));
                let row = encode_appointment(&schema, &appointment, None);
                Ok(rows_response(schema, vec![row]))
            }
            Command::SelectAppointments { selector, date } => {
                let appointments = engine.appointments_on(selector, date).await.map_err(engine_err)?;
                let schema = Arc::new(schema_for("appointments"));
                let rows: Vec<PgWireResult<DataRow>> = appointments
                    .iter()
                    .map(|a| encode_appointment(&schema, a, None))
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectAppointmentCounts { date } => {
                let counts = engine.appointment_counts(date).await.map_err(engine_err)?;
                let schema = Arc::new(schema_for("appointment_counts"));
                let date = date.to_string();
                let rows: Vec<PgWireResult<DataRow>> = counts
                    .into_iter()
                    .map(|(employee_id, count)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&employee_id)?;
                        encoder.encode_field(&date)?;
                        encoder.encode_field(&(count as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectEmployees => {
                let staff = engine.list_employees().await.map_err(engine_err)?;
                let schema = Arc::new(schema_for("employees"));
                let rows: Vec<PgWireResult<DataRow>> = staff
                    .into_iter()
                    .map(|(id, name)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&id)?;
                        encoder.encode_field(&name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::Listen { channel } => {
                let employee_id = NotifyHub::parse_channel(&channel).ok_or_else(|| {
                    user_error(
                        "42000",
                        format!("invalid channel: {channel} (expected employee_{{id}})"),
                    )
                })?;
                if !engine.store.contains_employee(employee_id) {
                    return Err(engine_err(EngineError::NotFound(crate::engine::Entity::Employee(
                        employee_id,
                    ))));
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
        }
    }
}

// ── Result shapes ────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn timetable_fields() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("employee_id", Type::INT8),
        field("rest_day_number", Type::INT4),
        field("effective_start_date", Type::VARCHAR),
        field("effective_end_date", Type::VARCHAR),
        field("created_by", Type::INT8),
        field("created_at", Type::VARCHAR),
        field("updated_by", Type::INT8),
        field("updated_at", Type::VARCHAR),
    ]
}

fn appointment_fields() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("member_id", Type::INT8),
        field("servicing_employee_id", Type::INT8),
        field("appointment_date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("remarks", Type::VARCHAR),
        field("created_by", Type::INT8),
        field("created_at", Type::VARCHAR),
        field("updated_at", Type::VARCHAR),
    ]
}

/// Columns for each key produced by `sql::result_table`. Unknown keys return no columns.
fn schema_for(key: &str) -> Vec<FieldInfo> {
    match key {
        "max_durations" => vec![
            field("employee_id", Type::VARCHAR),
            field("appointment_date", Type::VARCHAR),
            field("start_time", Type::VARCHAR),
            field("max_end_time", Type::VARCHAR),
            field("max_duration_minutes", Type::INT4),
            field("warning", Type::VARCHAR),
        ],
        "end_times" => vec![
            field("employee_id", Type::VARCHAR),
            field("appointment_date", Type::VARCHAR),
            field("start_time", Type::VARCHAR),
            field("end_time", Type::VARCHAR),
        ],
        "rest_day_warning" => vec![
            field("employee_id", Type::INT8),
            field("appointment_date", Type::VARCHAR),
            field("warning", Type::VARCHAR),
        ],
        "timetables" => timetable_fields(),
        "insert:timetables" | "update:timetables" => {
            let truncated_end = if key == "insert:timetables" {
                "updated_new_timetable_effective_enddate"
            } else {
                "updated_current_timetable_enddate"
            };
            let mut fields = timetable_fields();
            fields.push(field("updated_previous_timetable_id", Type::INT8));
            fields.push(field("updated_previous_timetable_enddate", Type::VARCHAR));
            fields.push(field(truncated_end, Type::VARCHAR));
            fields
        }
        "timetable_schedule" => {
            let mut fields = vec![field("schedule", Type::VARCHAR)];
            fields.extend(timetable_fields());
            fields
        }
        "appointments" => appointment_fields(),
        "insert:appointments" => {
            let mut fields = appointment_fields();
            fields.push(field("warning", Type::VARCHAR));
            fields
        }
        "appointment_counts" => vec![
            field("employee_id", Type::INT8),
            field("appointment_date", Type::VARCHAR),
            field("appointment_count", Type::INT8),
        ],
        "employees" => vec![field("id", Type::INT8), field("name", Type::VARCHAR)],
        _ => vec![],
    }
}

fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    sql::result_table(sql).map_or_else(Vec::new, |key| schema_for(&key))
}

fn rows_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_timetable_fields(encoder: &mut DataRowEncoder, t: &Timetable) -> PgWireResult<()> {
    encoder.encode_field(&t.id)?;
    encoder.encode_field(&t.employee_id)?;
    encoder.encode_field(&i32::from(t.rest_day_number))?;
    encoder.encode_field(&t.range.start.to_string())?;
    encoder.encode_field(&t.range.end.map(|d| d.to_string()))?;
    encoder.encode_field(&t.created_by)?;
    encoder.encode_field(&t.created_at.to_rfc3339())?;
    encoder.encode_field(&t.updated_by)?;
    encoder.encode_field(&t.updated_at.map(|at| at.to_rfc3339()))?;
    Ok(())
}

fn encode_timetable(schema: &Arc<Vec<FieldInfo>>, t: &Timetable) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_timetable_fields(&mut encoder, t)?;
    Ok(encoder.take_row())
}

fn encode_timetable_change(schema: &Arc<Vec<FieldInfo>>, change: &TimetableChange) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_timetable_fields(&mut encoder, &change.timetable)?;
    let previous = change.updated_previous.as_ref();
    encoder.encode_field(&previous.map(|t| t.id))?;
    encoder.encode_field(&previous.and_then(|t| t.range.end).map(|d| d.to_string()))?;
    encoder.encode_field(&change.truncated_end.map(|d| d.to_string()))?;
    Ok(encoder.take_row())
}

/// `warning` is `Some` only for booking results, which carry the extra column.
fn encode_appointment(
    schema: &Arc<Vec<FieldInfo>>,
    a: &Appointment,
    warning: Option<&Option<String>>,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&a.id)?;
    encoder.encode_field(&a.member_id)?;
    encoder.encode_field(&a.servicing_employee_id)?;
    encoder.encode_field(&a.appointment_date.to_string())?;
    encoder.encode_field(&hhmm(a.span.start))?;
    encoder.encode_field(&hhmm(a.span.end))?;
    encoder.encode_field(&a.remarks)?;
    encoder.encode_field(&a.created_by)?;
    encoder.encode_field(&a.created_at.to_rfc3339())?;
    encoder.encode_field(&a.updated_at.to_rfc3339())?;
    if let Some(warning) = warning {
        encoder.encode_field(warning)?;
    }
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for SalonSlotHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SalonSlotQueryParser;

#[async_trait]
impl QueryParser for SalonSlotQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SalonSlotHandler {
    type Statement = String;
    type QueryParser = SalonSlotQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
/// `$n` placeholders outside quoted literals and identifiers, as (byte range, n).
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves the state unchanged.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start
                    && let Ok(n) = sql[start..end].parse::<usize>()
                {
                    found.push((i..end, n));
                    i = end;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    substitute_text_params(&portal.statement.statement, &portal.parameters)
}

/// Single pass over `sql`; bound values are never rescanned. Placeholders
/// without a bound value are left as written.
fn substitute_text_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SalonSlotFactory {
    handler: Arc<SalonSlotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SalonSlotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SalonSlotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SalonSlotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SalonSlotHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SalonSlotFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine failure class.
pub fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidFormat => "22007",
        ErrorKind::ValidationError => "23514",
        ErrorKind::OverlapConflict => "23P01",
        ErrorKind::NotFound => "P0002",
        ErrorKind::AlreadyExists => "23505",
        ErrorKind::ConcurrencyConflict => "40001",
        ErrorKind::LimitExceeded => "54000",
        ErrorKind::Storage => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(e.kind()), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::Format(_) => "22007",
        SqlError::OutOfRange(_) => "22003",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM employees"), 0);
        assert_eq!(
            count_params("SELECT * FROM end_times WHERE employee_id = $1 AND date = $2 AND start_time = $3"),
            3
        );
        assert_eq!(count_params("SELECT $2, $12"), 12);
    }

    #[test]
    fn substitute_quotes_text_and_nulls() {
        let params: Vec<Option<Vec<u8>>> = vec![Some(b"5".to_vec()), None, Some(b"O'Hara".to_vec())];
        let sql = substitute_text_params("VALUES ($1, $2, $3)", &params);
        assert_eq!(sql, "VALUES ('5', NULL, 'O''Hara')");
    }

    #[test]
    fn substitute_does_not_clobber_two_digit_placeholders() {
        let params: Vec<Option<Vec<u8>>> = (1..=10).map(|i| Some(i.to_string().into_bytes())).collect();
        let sql = substitute_text_params("$1 $10", &params);
        assert_eq!(sql, "'1' '10'");
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let params: Vec<Option<Vec<u8>>> = vec![Some(b"9".to_vec()), Some(b"bring $1 voucher".to_vec())];
        let sql = substitute_text_params("VALUES ($1, $2)", &params);
        assert_eq!(sql, "VALUES ('9', 'bring $1 voucher')");

        let booking = substitute_text_params(
            "INSERT INTO appointments \
             (member_id, servicing_employee_id, appointment_date, start_time, end_time, remarks, created_by) \
             VALUES ($1, 5, '2025-06-10', '10:00', '11:00', $2, 1)",
            &params,
        );
        match sql::parse_sql(&booking).unwrap() {
            Command::InsertAppointments { request } => {
                assert_eq!(request.appointments[0].remarks.as_deref(), Some("bring $1 voucher"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn placeholders_inside_literals_are_left_alone() {
        let params: Vec<Option<Vec<u8>>> = vec![Some(b"5".to_vec())];
        let sql = substitute_text_params("SELECT '$1', \"$1\", 'it''s $1', $1", &params);
        assert_eq!(sql, "SELECT '$1', \"$1\", 'it''s $1', '5'");
        assert_eq!(count_params("SELECT 'costs $3' WHERE id = $1"), 1);
        assert_eq!(substitute_text_params("$2", &params), "$2");
    }

    #[test]
    fn error_classes_map_to_sqlstates() {
        assert_eq!(sqlstate(ErrorKind::OverlapConflict), "23P01");
        assert_eq!(sqlstate(ErrorKind::ConcurrencyConflict), "40001");
        assert_eq!(sqlstate(ErrorKind::NotFound), "P0002");
    }

    #[test]
    fn statement_schemas_follow_result_table() {
        let names = |sql: &str| -> Vec<String> {
            statement_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names("SELECT * FROM end_times WHERE employee_id = $1 AND date = $2 AND start_time = $3"),
            ["employee_id", "appointment_date", "start_time", "end_time"]
        );
        assert!(names("INSERT INTO appointments (member_id) VALUES ($1)").contains(&"warning".to_string()));
        assert!(
            names("UPDATE timetables SET updated_by = $1 WHERE id = $2")
                .contains(&"updated_current_timetable_enddate".to_string())
        );
        assert!(names("INSERT INTO employees (id) VALUES ($1)").is_empty());
    }
}
