use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::DEFAULT_SLOT_GRANULARITY_MIN;
use crate::model::*;

/// Parsed command from SQL input.
///
/// Tables: `locations`, `staff`, `rules`, `bookings`; virtual query
/// tables `available_dates` and `time_slots`. Booking lifecycle
/// transitions are `UPDATE bookings SET status = …` / `SET start = …` —
/// DELETE FROM bookings is rejected because cancellation is a status
/// change, not a deletion.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertLocation {
        id: Ulid,
        name: String,
        auto_confirm: bool,
        slot_granularity_min: u16,
    },
    UpdateLocation {
        id: Ulid,
        name: Option<String>,
        auto_confirm: Option<bool>,
        slot_granularity_min: Option<u16>,
    },
    DeleteLocation {
        id: Ulid,
    },
    InsertStaff {
        id: Ulid,
        location_id: Ulid,
        name: String,
    },
    DeleteStaff {
        id: Ulid,
    },
    InsertRule {
        id: Ulid,
        location_id: Ulid,
        staff_id: Option<Ulid>,
        kind: RuleKind,
        window: RuleWindow,
        start_minute: u16,
        end_minute: u16,
    },
    UpdateRule {
        id: Ulid,
        kind: Option<RuleKind>,
        window: Option<RuleWindow>,
        start_minute: Option<u16>,
        end_minute: Option<u16>,
    },
    DeleteRule {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        location_id: Ulid,
        staff_id: Option<Ulid>,
        customer_id: Ulid,
        start: Ms,
        items: Vec<ServiceItem>,
        channel: BookingChannel,
    },
    ConfirmBooking {
        id: Ulid,
    },
    CancelBooking {
        id: Ulid,
        reason: Option<String>,
    },
    RescheduleBooking {
        id: Ulid,
        start: Ms,
    },
    CompleteBooking {
        id: Ulid,
    },
    MarkNoShow {
        id: Ulid,
    },
    SelectLocations,
    SelectRules {
        location_id: Ulid,
    },
    SelectBookings {
        location_id: Ulid,
    },
    SelectAvailableDates {
        location_id: Ulid,
        staff_id: Option<Ulid>,
        duration_minutes: u32,
        start_date: NaiveDate,
        days: u16,
    },
    SelectTimeSlots {
        location_id: Ulid,
        staff_id: Option<Ulid>,
        duration_minutes: u32,
        date: NaiveDate,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "locations" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("locations", 2, values.len()));
            }
            let auto_confirm = if values.len() >= 3 {
                parse_bool(&values[2])?
            } else {
                true
            };
            let slot_granularity_min = if values.len() >= 4 {
                parse_u16(&values[3])?
            } else {
                DEFAULT_SLOT_GRANULARITY_MIN
            };
            Ok(Command::InsertLocation {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                auto_confirm,
                slot_granularity_min,
            })
        }
        "staff" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("staff", 3, values.len()));
            }
            Ok(Command::InsertStaff {
                id: parse_ulid(&values[0])?,
                location_id: parse_ulid(&values[1])?,
                name: parse_string(&values[2])?,
            })
        }
        "rules" => {
            if values.len() < 8 {
                return Err(SqlError::WrongArity("rules", 8, values.len()));
            }
            let weekday = parse_u16_or_null(&values[4])?;
            let date = parse_date_or_null(&values[5])?;
            let window = rule_window(weekday, date)?;
            Ok(Command::InsertRule {
                id: parse_ulid(&values[0])?,
                location_id: parse_ulid(&values[1])?,
                staff_id: parse_ulid_or_null(&values[2])?,
                kind: parse_rule_kind(&values[3])?,
                window,
                start_minute: parse_u16(&values[6])?,
                end_minute: parse_u16(&values[7])?,
            })
        }
        "bookings" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("bookings", 6, values.len()));
            }
            let channel = if values.len() >= 7 {
                parse_channel(&values[6])?
            } else {
                BookingChannel::Online
            };
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                location_id: parse_ulid(&values[1])?,
                staff_id: parse_ulid_or_null(&values[2])?,
                customer_id: parse_ulid(&values[3])?,
                start: parse_i64(&values[4])?,
                items: parse_items(&values[5])?,
                channel,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut fields: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = assignment_column(a)?;
        fields.push((col, &a.value));
    }
    let field = |name: &str| fields.iter().find(|(c, _)| c == name).map(|(_, e)| *e);

    match table.as_str() {
        "bookings" => {
            let status = field("status");
            let start = field("start");
            if status.is_some() && start.is_some() {
                return Err(SqlError::Parse("one transition per statement".into()));
            }
            if let Some(expr) = start {
                return Ok(Command::RescheduleBooking {
                    id,
                    start: parse_i64_expr(expr)?,
                });
            }
            let Some(expr) = status else {
                return Err(SqlError::MissingFilter("status"));
            };
            match parse_string_expr(expr)?.as_str() {
                "confirmed" => Ok(Command::ConfirmBooking { id }),
                "cancelled" => {
                    let reason = match field("cancellation_reason") {
                        Some(e) => Some(parse_string_expr(e)?),
                        None => None,
                    };
                    Ok(Command::CancelBooking { id, reason })
                }
                "completed" => Ok(Command::CompleteBooking { id }),
                "no_show" => Ok(Command::MarkNoShow { id }),
                other => Err(SqlError::Parse(format!("cannot transition to '{other}'"))),
            }
        }
        "locations" => {
            let name = match field("name") {
                Some(e) => Some(parse_string_expr(e)?),
                None => None,
            };
            let auto_confirm = match field("auto_confirm") {
                Some(e) => Some(parse_bool(e)?),
                None => None,
            };
            let slot_granularity_min = match field("granularity") {
                Some(e) => Some(parse_u16(e)?),
                None => None,
            };
            Ok(Command::UpdateLocation {
                id,
                name,
                auto_confirm,
                slot_granularity_min,
            })
        }
        "rules" => {
            let kind = match field("kind") {
                Some(e) => Some(parse_rule_kind(e)?),
                None => None,
            };
            let weekday = match field("weekday") {
                Some(e) => parse_u16_or_null(e)?,
                None => None,
            };
            let date = match field("date") {
                Some(e) => parse_date_or_null(e)?,
                None => None,
            };
            let window = match (weekday, date) {
                (None, None) => None,
                _ => Some(rule_window(weekday, date)?),
            };
            let start_minute = match field("start_minute") {
                Some(e) => Some(parse_u16(e)?),
                None => None,
            };
            let end_minute = match field("end_minute") {
                Some(e) => Some(parse_u16(e)?),
                None => None,
            };
            Ok(Command::UpdateRule {
                id,
                kind,
                window,
                start_minute,
                end_minute,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table == "bookings" {
        return Err(SqlError::Unsupported(
            "bookings are cancelled, not deleted".into(),
        ));
    }
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "locations" => Ok(Command::DeleteLocation { id }),
        "staff" => Ok(Command::DeleteStaff { id }),
        "rules" => Ok(Command::DeleteRule { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

#[derive(Default)]
struct Filters {
    location_id: Option<Ulid>,
    staff_id: Option<Ulid>,
    duration: Option<u32>,
    start_date: Option<NaiveDate>,
    date: Option<NaiveDate>,
    days: Option<u16>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "locations" => Ok(Command::SelectLocations),
        "rules" => Ok(Command::SelectRules {
            location_id: filters
                .location_id
                .ok_or(SqlError::MissingFilter("location_id"))?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            location_id: filters
                .location_id
                .ok_or(SqlError::MissingFilter("location_id"))?,
        }),
        "available_dates" => Ok(Command::SelectAvailableDates {
            location_id: filters
                .location_id
                .ok_or(SqlError::MissingFilter("location_id"))?,
            staff_id: filters.staff_id,
            duration_minutes: filters.duration.ok_or(SqlError::MissingFilter("duration"))?,
            start_date: filters
                .start_date
                .ok_or(SqlError::MissingFilter("start_date"))?,
            days: filters.days.ok_or(SqlError::MissingFilter("days"))?,
        }),
        "time_slots" => Ok(Command::SelectTimeSlots {
            location_id: filters
                .location_id
                .ok_or(SqlError::MissingFilter("location_id"))?,
            staff_id: filters.staff_id,
            duration_minutes: filters.duration.ok_or(SqlError::MissingFilter("duration"))?,
            date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => {
                let Some(col) = expr_column_name(left) else {
                    return Ok(());
                };
                match col.as_str() {
                    "location_id" => filters.location_id = Some(parse_ulid_expr(right)?),
                    "staff_id" => filters.staff_id = Some(parse_ulid_expr(right)?),
                    "duration" => filters.duration = Some(parse_u32(right)?),
                    "start_date" => filters.start_date = Some(parse_date_expr(right)?),
                    "date" => filters.date = Some(parse_date_expr(right)?),
                    "days" => filters.days = Some(parse_u16(right)?),
                    _ => {}
                }
            }
            _ => {}
        }
    }
    Ok(())
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        Ok(s.clone())
    } else {
        Err(SqlError::Parse(format!("expected string, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_expr(expr)
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        Ok(None)
    } else {
        parse_ulid_expr(expr).map(Some)
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let v = parse_i64_expr(expr)?;
    u16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u16 range")))
}

fn parse_u16_or_null(expr: &Expr) -> Result<Option<u16>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        Ok(None)
    } else {
        parse_u16(expr).map(Some)
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}")))
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        Ok(None)
    } else {
        parse_date_expr(expr).map(Some)
    }
}

fn parse_rule_kind(expr: &Expr) -> Result<RuleKind, SqlError> {
    let s = parse_string_expr(expr)?;
    RuleKind::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown rule kind '{s}'")))
}

fn parse_channel(expr: &Expr) -> Result<BookingChannel, SqlError> {
    let s = parse_string_expr(expr)?;
    match s.as_str() {
        "online" => Ok(BookingChannel::Online),
        "manual" => Ok(BookingChannel::Manual),
        other => Err(SqlError::Parse(format!("unknown channel '{other}'"))),
    }
}

/// Service line items arrive as a JSON array column.
fn parse_items(expr: &Expr) -> Result<Vec<ServiceItem>, SqlError> {
    let s = parse_string_expr(expr)?;
    serde_json::from_str(&s).map_err(|e| SqlError::Parse(format!("bad items: {e}")))
}

/// A weekly weekday and a one-off date are mutually exclusive.
fn rule_window(weekday: Option<u16>, date: Option<NaiveDate>) -> Result<RuleWindow, SqlError> {
    match (weekday, date) {
        (Some(w), None) => {
            if w > 6 {
                return Err(SqlError::Parse(format!("weekday {w} out of 0..=6")));
            }
            Ok(RuleWindow::Weekly { weekday: w as u8 })
        }
        (None, Some(date)) => Ok(RuleWindow::Date { date }),
        (Some(_), Some(_)) => Err(SqlError::Parse(
            "weekday and date are mutually exclusive".into(),
        )),
        (None, None) => Err(SqlError::MissingFilter("weekday or date")),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
