use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::lifecycle::AppointmentStatus;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertClient {
        client: Client,
    },
    InsertPackage {
        package: Package,
    },
    InsertPurchase {
        purchase: PackagePurchase,
    },
    InsertAppointment {
        id: Ulid,
        client: ClientRef,
        date: NaiveDate,
        start: Min,
        purchase_id: Option<Ulid>,
        package_id: Option<Ulid>,
        preferences: Option<String>,
    },
    /// Reschedule; a missing date keeps the appointment's current day.
    MoveAppointment {
        id: Ulid,
        date: Option<NaiveDate>,
        start: Min,
    },
    SetStatus {
        id: Ulid,
        status: AppointmentStatus,
        cancel_reason: Option<String>,
        paid_amount: Option<u64>,
    },
    MarkMessage {
        id: Ulid,
        status: OutboundStatus,
    },
    SelectAppointments {
        date: NaiveDate,
    },
    SelectSlots {
        date: NaiveDate,
    },
    SelectLanes {
        date: NaiveDate,
    },
    SelectOutbound,
    Listen {
        channel: String,
    },
    Unlisten {
        channel: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches('"').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper == "UNLISTEN *" {
        return Ok(Command::Unlisten { channel: None });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches('"').to_string();
        return Ok(Command::Unlisten { channel: Some(channel) });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column → value pairs of one row, named by the statement's column list
/// or, without one, by the table's default column order.
struct Row {
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn required(&self, table: &'static str, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(table, col))
    }

    /// A present, non-NULL value.
    fn optional(&self, col: &str) -> Option<&Expr> {
        self.get(col).filter(|e| !is_null(e))
    }
}

const CLIENT_COLUMNS: &[&str] = &["id", "kind", "name", "email", "phone", "parent_ids", "birth_date"];
const PACKAGE_COLUMNS: &[&str] = &["id", "name", "duration", "requires_advance_payment", "advance_amount"];
const PURCHASE_COLUMNS: &[&str] = &["id", "package_id", "client_type", "client_id"];
const APPOINTMENT_COLUMNS: &[&str] = &[
    "id",
    "client_type",
    "client_id",
    "date",
    "start_time",
    "package_purchase_id",
    "package_id",
    "preferences",
];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let defaults = match table.as_str() {
        "clients" => CLIENT_COLUMNS,
        "packages" => PACKAGE_COLUMNS,
        "package_purchases" => PURCHASE_COLUMNS,
        "appointments" => APPOINTMENT_COLUMNS,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() {
        return Err(SqlError::WrongArity(values.len(), columns.len()));
    }
    let row = Row {
        cells: columns.into_iter().zip(values).collect(),
    };

    match table.as_str() {
        "clients" => {
            let kind = parse_string(row.required("clients", "kind")?)?;
            let mut client = Client::new(
                parse_ulid(row.required("clients", "id")?)?,
                ClientKind::parse(&kind).ok_or_else(|| SqlError::Parse(format!("bad client kind: {kind}")))?,
                parse_string(row.required("clients", "name")?)?,
            );
            client.email = row.optional("email").map(parse_string).transpose()?;
            client.phone = row.optional("phone").map(parse_string).transpose()?;
            client.parent_ids = row
                .optional("parent_ids")
                .map(parse_ulid_list)
                .transpose()?
                .unwrap_or_default();
            client.birth_date = row.optional("birth_date").map(parse_date).transpose()?;
            Ok(Command::InsertClient { client })
        }
        "packages" => Ok(Command::InsertPackage {
            package: Package {
                id: parse_ulid(row.required("packages", "id")?)?,
                name: parse_string(row.required("packages", "name")?)?,
                duration_minutes: parse_i32(row.required("packages", "duration")?)?,
                requires_advance_payment: row
                    .optional("requires_advance_payment")
                    .map(parse_bool)
                    .transpose()?
                    .unwrap_or(false),
                advance_payment_amount: row
                    .optional("advance_amount")
                    .map(parse_u64)
                    .transpose()?
                    .unwrap_or(0),
            },
        }),
        "package_purchases" => Ok(Command::InsertPurchase {
            purchase: PackagePurchase {
                id: parse_ulid(row.required("package_purchases", "id")?)?,
                package_id: parse_ulid(row.required("package_purchases", "package_id")?)?,
                client: parse_client_ref(&row, "package_purchases")?,
            },
        }),
        _ => Ok(Command::InsertAppointment {
            id: parse_ulid(row.required("appointments", "id")?)?,
            client: parse_client_ref(&row, "appointments")?,
            date: parse_date(row.required("appointments", "date")?)?,
            start: parse_time(row.required("appointments", "start_time")?)?,
            purchase_id: row.optional("package_purchase_id").map(parse_ulid).transpose()?,
            package_id: row.optional("package_id").map(parse_ulid).transpose()?,
            preferences: row.optional("preferences").map(parse_string).transpose()?,
        }),
    }
}

fn parse_client_ref(row: &Row, table: &'static str) -> Result<ClientRef, SqlError> {
    let kind = parse_string(row.required(table, "client_type")?)?;
    let kind = ClientKind::parse(&kind).ok_or_else(|| SqlError::Parse(format!("bad client_type: {kind}")))?;
    Ok(ClientRef::new(kind, parse_ulid(row.required(table, "client_id")?)?))
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table_name = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;
    let mut cells = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        cells.push((col, a.value.clone()));
    }
    let row = Row { cells };

    match table_name.as_str() {
        "appointments" => {
            if let Some(status) = row.get("status") {
                let status = parse_string(status)?;
                let status = AppointmentStatus::parse(&status)
                    .ok_or_else(|| SqlError::Parse(format!("bad status: {status}")))?;
                return Ok(Command::SetStatus {
                    id,
                    status,
                    cancel_reason: row.optional("cancel_reason").map(parse_string).transpose()?,
                    paid_amount: row.optional("paid_amount").map(parse_u64).transpose()?,
                });
            }
            Ok(Command::MoveAppointment {
                id,
                date: row.optional("date").map(parse_date).transpose()?,
                start: parse_time(row.required("appointments", "start_time")?)?,
            })
        }
        "outbound_messages" => {
            let status = parse_string(row.required("outbound_messages", "status")?)?;
            Ok(Command::MarkMessage {
                id,
                status: OutboundStatus::parse(&status)
                    .ok_or_else(|| SqlError::Parse(format!("bad message status: {status}")))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table_name)),
    }
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
    if table == "outbound_messages" {
        return Ok(Command::SelectOutbound);
    }

    let mut date = None;
    if let Some(selection) = &select.selection {
        extract_date_filter(selection, &mut date)?;
    }
    let date = date.ok_or(SqlError::MissingFilter("date"));

    match table.as_str() {
        "appointments" => Ok(Command::SelectAppointments { date: date? }),
        "slots" => Ok(Command::SelectSlots { date: date? }),
        "lanes" => Ok(Command::SelectLanes { date: date? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_date_filter(expr: &Expr, date: &mut Option<NaiveDate>) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_date_filter(left, date)?;
                extract_date_filter(right, date)?;
            }
            ast::BinaryOperator::Eq if expr_column_name(left).as_deref() == Some("date") => {
                *date = Some(parse_date(right)?);
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::DollarQuotedString(ast::DollarQuotedString { value: s, .. })) => {
            Ok(s.clone())
        }
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

/// Comma-separated ULIDs; an empty string is an empty list.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    parse_string(expr)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}"))))
        .collect()
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<Min, SqlError> {
    let s = parse_string(expr)?;
    parse_hhmm(&s).ok_or_else(|| SqlError::Parse(format!("bad time {s}, expected HH:MM")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
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

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(got, columns) => {
                write!(f, "{got} values for {columns} columns")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
