use chrono::{DateTime, FixedOffset, NaiveDate};
use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Span;

use crate::engine::{self, AppointmentRequest, BookingRequest, TimetableEdit};
use crate::model::*;

/// Spelling of the "any available staff" selector in filters and VALUES.
pub const ANY_AVAILABLE_STAFF: &str = "anyAvailableStaff";

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEmployees {
        rows: Vec<(EmployeeId, Option<String>)>,
    },
    InsertMembers {
        rows: Vec<(MemberId, Option<String>)>,
    },
    InsertTimetable {
        employee_id: EmployeeId,
        rest_day_number: u8,
        range: DateRange,
        created_by: EmployeeId,
        created_at: Option<DateTime<FixedOffset>>,
    },
    UpdateTimetable {
        id: TimetableId,
        edit: TimetableEdit,
    },
    InsertAppointments {
        request: BookingRequest,
    },
    SelectMaxDurations {
        selector: EmployeeSelector,
        date: NaiveDate,
        exclude_appointment_id: Option<AppointmentId>,
    },
    SelectEndTimes {
        selector: EmployeeSelector,
        date: NaiveDate,
        start: Minute,
        exclude_appointment_id: Option<AppointmentId>,
    },
    SelectRestDayWarning {
        employee_id: EmployeeId,
        date: NaiveDate,
    },
    SelectTimetable {
        id: TimetableId,
    },
    SelectTimetables {
        employee_id: EmployeeId,
    },
    SelectTimetableSchedule {
        employee_id: EmployeeId,
        date: NaiveDate,
    },
    SelectAppointment {
        id: AppointmentId,
    },
    SelectAppointments {
        selector: EmployeeSelector,
        date: NaiveDate,
    },
    SelectAppointmentCounts {
        date: NaiveDate,
    },
    SelectEmployees,
    Listen {
        channel: String,
    },
}

const EMPLOYEE_COLUMNS: &[&str] = &["id", "name"];
const MEMBER_COLUMNS: &[&str] = &["id", "name"];
const TIMETABLE_COLUMNS: &[&str] = &[
    "employee_id",
    "rest_day_number",
    "effective_start_date",
    "effective_end_date",
    "created_by",
    "created_at",
];
const APPOINTMENT_COLUMNS: &[&str] = &[
    "member_id",
    "servicing_employee_id",
    "appointment_date",
    "start_time",
    "end_time",
    "remarks",
    "created_by",
    "created_at",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').trim_matches('"').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Row shape a statement returns, if it returns rows at all: the table name for
/// SELECT, `insert:<table>` or `update:<table>` for writes that echo rows.
/// Works on statements that still carry `$n` placeholders.
pub fn result_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => select
                .from
                .first()
                .and_then(|t| table_factor_name(&t.relation).ok()),
            _ => None,
        },
        Statement::Insert(insert) => {
            let table = insert_table_name(insert).ok()?;
            matches!(table.as_str(), "timetables" | "appointments").then(|| format!("insert:{table}"))
        }
        Statement::Update { table, .. } => table_factor_name(&table.relation)
            .ok()
            .map(|table| format!("update:{table}")),
        _ => None,
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let explicit: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let values = extract_all_insert_rows(insert)?;

    match table.as_str() {
        "employees" => {
            let columns = resolve_columns("employees", EMPLOYEE_COLUMNS, explicit)?;
            let rows = bind_rows("employees", &columns, &values)?
                .iter()
                .map(|row| -> Result<_, SqlError> { Ok((parse_i64(row.require("id")?)?, row.opt_text("name")?)) })
                .collect::<Result<_, _>>()?;
            Ok(Command::InsertEmployees { rows })
        }
        "members" => {
            let columns = resolve_columns("members", MEMBER_COLUMNS, explicit)?;
            let rows = bind_rows("members", &columns, &values)?
                .iter()
                .map(|row| -> Result<_, SqlError> { Ok((parse_i64(row.require("id")?)?, row.opt_text("name")?)) })
                .collect::<Result<_, _>>()?;
            Ok(Command::InsertMembers { rows })
        }
        "timetables" => {
            let columns = resolve_columns("timetables", TIMETABLE_COLUMNS, explicit)?;
            let rows = bind_rows("timetables", &columns, &values)?;
            let [row] = rows.as_slice() else {
                return Err(SqlError::Unsupported("one timetable per INSERT".into()));
            };
            Ok(Command::InsertTimetable {
                employee_id: parse_i64(row.require("employee_id")?)?,
                rest_day_number: parse_u8(row.require("rest_day_number")?)?,
                range: DateRange::new(
                    parse_date(row.require("effective_start_date")?)?,
                    row.get("effective_end_date").map(parse_date_or_null).transpose()?.flatten(),
                ),
                created_by: parse_i64(row.require("created_by")?)?,
                created_at: row.get("created_at").map(parse_timestamp_or_null).transpose()?.flatten(),
            })
        }
        "appointments" => {
            let columns = resolve_columns("appointments", APPOINTMENT_COLUMNS, explicit)?;
            let rows = bind_rows("appointments", &columns, &values)?;
            parse_booking(&rows)
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Every row of one INSERT is one booking request, so they must share
/// member, creator and creation time.
fn parse_booking(rows: &[BoundRow<'_>]) -> Result<Command, SqlError> {
    let mut parsed = Vec::with_capacity(rows.len());
    for row in rows {
        let header = (
            parse_i64(row.require("member_id")?)?,
            parse_i64(row.require("created_by")?)?,
            row.get("created_at").map(parse_timestamp_or_null).transpose()?.flatten(),
        );
        let item = AppointmentRequest {
            servicing_employee_id: match row.get("servicing_employee_id") {
                Some(expr) => parse_selector(expr)?.employee_id(),
                None => None,
            },
            appointment_date: parse_text(row.require("appointment_date")?)?,
            start_time: parse_text(row.require("start_time")?)?,
            end_time: parse_text(row.require("end_time")?)?,
            remarks: row.opt_text("remarks")?,
        };
        parsed.push((header, item));
    }

    let Some(&((member_id, created_by, created_at), _)) = parsed.first() else {
        return Err(SqlError::Parse("empty VALUES".into()));
    };
    if let Some(i) = parsed
        .iter()
        .position(|(header, _)| *header != (member_id, created_by, created_at))
    {
        return Err(SqlError::Unsupported(format!(
            "row {}: all appointments of one INSERT must share member_id, created_by and created_at",
            i + 1
        )));
    }
    Ok(Command::InsertAppointments {
        request: BookingRequest {
            member_id,
            created_by,
            created_at,
            appointments: parsed.into_iter().map(|(_, item)| item).collect(),
        },
    })
}

/// Column list of an INSERT: the explicit one, or the table's full column order.
struct Columns {
    names: Vec<String>,
    explicit: bool,
}

fn resolve_columns(table: &'static str, defaults: &[&str], explicit: Vec<String>) -> Result<Columns, SqlError> {
    if explicit.is_empty() {
        return Ok(Columns {
            names: defaults.iter().map(|c| c.to_string()).collect(),
            explicit: false,
        });
    }
    if let Some(unknown) = explicit.iter().find(|c| !defaults.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(table, unknown.clone()));
    }
    Ok(Columns {
        names: explicit,
        explicit: true,
    })
}

/// One VALUES row with its column names resolved.
struct BoundRow<'a> {
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> BoundRow<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingValue(column))
    }

    fn opt_text(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_text_or_null).transpose().map(Option::flatten)
    }
}

/// Trailing columns may be omitted from positional rows only.
fn bind_rows<'a>(
    table: &'static str,
    columns: &'a Columns,
    rows: &'a [Vec<Expr>],
) -> Result<Vec<BoundRow<'a>>, SqlError> {
    let expected = columns.names.len();
    rows.iter()
        .map(|values| {
            if values.len() > expected || (columns.explicit && values.len() != expected) {
                return Err(SqlError::WrongArity(table, expected, values.len()));
            }
            Ok(BoundRow {
                columns: &columns.names,
                values,
            })
        })
        .collect()
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "timetables" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = Filters::from_selection(selection)?;
    let id = parse_i64(filters.require("id")?)?;

    let mut rest_day_number = None;
    let mut effective_start_date = None;
    let mut effective_end_date = None;
    let mut updated_by = None;
    let mut updated_at = None;
    for assignment in assignments {
        let column = match &assignment.target {
            ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
            _ => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        let value = &assignment.value;
        match column.as_str() {
            "rest_day_number" => rest_day_number = Some(parse_u8(value)?),
            "effective_start_date" => effective_start_date = Some(parse_date(value)?),
            "effective_end_date" => effective_end_date = Some(parse_date_or_null(value)?),
            "updated_by" => updated_by = Some(parse_i64(value)?),
            "updated_at" => updated_at = parse_timestamp_or_null(value)?,
            _ => return Err(SqlError::UnknownColumn("timetables", column)),
        }
    }

    Ok(Command::UpdateTimetable {
        id,
        edit: TimetableEdit {
            rest_day_number,
            effective_start_date,
            effective_end_date,
            updated_by: updated_by.ok_or(SqlError::MissingValue("updated_by"))?,
            updated_at,
        },
    })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::from_selection(&select.selection)?;

    match table.as_str() {
        "max_durations" => Ok(Command::SelectMaxDurations {
            selector: parse_selector(filters.require("employee_id")?)?,
            date: parse_date(filters.require("appointment_date")?)?,
            exclude_appointment_id: filters.get("exclude_appointment_id").map(parse_i64).transpose()?,
        }),
        "end_times" => Ok(Command::SelectEndTimes {
            selector: parse_selector(filters.require("employee_id")?)?,
            date: parse_date(filters.require("appointment_date")?)?,
            start: parse_clock(filters.require("start_time")?)?,
            exclude_appointment_id: filters.get("exclude_appointment_id").map(parse_i64).transpose()?,
        }),
        "rest_day_warning" => Ok(Command::SelectRestDayWarning {
            employee_id: parse_i64(filters.require("employee_id")?)?,
            date: parse_date(filters.require("appointment_date")?)?,
        }),
        "timetables" => {
            if let Some(id) = filters.get("id") {
                Ok(Command::SelectTimetable { id: parse_i64(id)? })
            } else if let Some(employee_id) = filters.get("employee_id") {
                Ok(Command::SelectTimetables {
                    employee_id: parse_i64(employee_id)?,
                })
            } else {
                Err(SqlError::MissingFilter("id or employee_id"))
            }
        }
        "timetable_schedule" => Ok(Command::SelectTimetableSchedule {
            employee_id: parse_i64(filters.require("employee_id")?)?,
            date: parse_date(filters.require("appointment_date")?)?,
        }),
        "appointments" => {
            if let Some(id) = filters.get("id") {
                return Ok(Command::SelectAppointment { id: parse_i64(id)? });
            }
            Ok(Command::SelectAppointments {
                selector: filters
                    .get("employee_id")
                    .map(parse_selector)
                    .transpose()?
                    .unwrap_or(EmployeeSelector::AnyAvailable),
                date: parse_date(filters.require("appointment_date")?)?,
            })
        }
        "appointment_counts" => Ok(Command::SelectAppointmentCounts {
            date: parse_date(filters.require("appointment_date")?)?,
        }),
        "employees" => Ok(Command::SelectEmployees),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column = value` conjuncts of a WHERE clause. `column IS NULL` is kept as a NULL value.
struct Filters {
    terms: Vec<(String, Expr)>,
}

impl Filters {
    fn from_selection(selection: &Option<Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_filters(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.terms
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, value)| value)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, out)?;
                collect_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((filter_alias(column), right.as_ref().clone()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        Expr::IsNull(inner) => {
            let column =
                expr_column_name(inner).ok_or_else(|| SqlError::Unsupported(format!("filter on {inner}")))?;
            let null = Expr::Value(ValueWithSpan {
                value: Value::Null,
                span: Span::empty(),
            });
            out.push((filter_alias(column), null));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

fn filter_alias(column: String) -> String {
    if column == "date" {
        "appointment_date".into()
    } else {
        column
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|_| SqlError::Format(format!("expected an integer, got {s:?}"))),
            _ => Err(SqlError::Format(format!("expected an integer, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::OutOfRange(format!("{v} is not a valid rest_day_number")))
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Format(format!("expected text, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::Format("unexpected NULL".into()))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    engine::parse_date(parse_text(expr)?.trim()).map_err(|e| SqlError::Format(e.to_string()))
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    match parse_text_or_null(expr)? {
        Some(s) => engine::parse_date(s.trim())
            .map(Some)
            .map_err(|e| SqlError::Format(e.to_string())),
        None => Ok(None),
    }
}

fn parse_timestamp_or_null(expr: &Expr) -> Result<Option<DateTime<FixedOffset>>, SqlError> {
    match parse_text_or_null(expr)? {
        Some(s) => engine::parse_timestamp(s.trim())
            .map(Some)
            .map_err(|e| SqlError::Format(e.to_string())),
        None => Ok(None),
    }
}

fn parse_clock(expr: &Expr) -> Result<Minute, SqlError> {
    engine::parse_clock(parse_text(expr)?.trim()).map_err(|e| SqlError::Format(e.to_string()))
}

/// NULL or `'anyAvailableStaff'` selects any available staff; anything else is an employee id.
fn parse_selector(expr: &Expr) -> Result<EmployeeSelector, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(EmployeeSelector::AnyAvailable),
        Some(Value::SingleQuotedString(s)) if s.eq_ignore_ascii_case(ANY_AVAILABLE_STAFF) => {
            Ok(EmployeeSelector::AnyAvailable)
        }
        _ => Ok(EmployeeSelector::Specific(parse_i64(expr)?)),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingValue(&'static str),
    /// A literal that is not a valid date, time, timestamp or integer.
    Format(String),
    OutOfRange(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingValue(col) => write!(f, "missing value: {col}"),
            SqlError::Format(s) => write!(f, "{s}"),
            SqlError::OutOfRange(s) => write!(f, "out of range: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
