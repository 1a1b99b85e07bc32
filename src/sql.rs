use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertStaff {
        id: Ulid,
        name: String,
    },
    DeleteStaff {
        id: Ulid,
    },
    InsertService {
        id: Ulid,
        name: String,
        duration_min: u32,
        price_cents: i64,
    },
    DeleteService {
        id: Ulid,
    },
    InsertRule {
        id: Ulid,
        staff_id: Ulid,
        weekday: u8,
        start_min: u32,
        end_min: u32,
        services: Option<Vec<Ulid>>,
    },
    DeleteRule {
        id: Ulid,
    },
    InsertBlackout {
        id: Ulid,
        staff_id: Option<Ulid>,
        start_day: NaiveDate,
        end_day: NaiveDate,
    },
    DeleteBlackout {
        id: Ulid,
    },
    UpdateSettings {
        timezone: Option<String>,
        slot_grid_minutes: Option<u32>,
        lead_time_minutes: Option<u32>,
        max_advance_days: Option<u32>,
        /// Outer None: not mentioned. Inner None: cleared with NULL.
        payout_account: Option<Option<String>>,
    },
    UpdatePolicy {
        no_show_fee: Option<Option<FeePolicy>>,
        cancel_fee: Option<Option<FeePolicy>>,
        refund_restores_credit: Option<bool>,
    },
    InsertCard {
        code: String,
        amount_cents: i64,
        expires_at: Option<Ms>,
    },
    InsertHold {
        id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        start: Ms,
    },
    DeleteHold {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        customer: String,
        start: Ms,
        gift_code: Option<String>,
        hold_id: Option<Ulid>,
    },
    ConfirmCard {
        booking_id: Ulid,
        method_ref: String,
    },
    InsertAction {
        booking_id: Ulid,
        action: MoneyAction,
        amount_cents: Option<i64>,
        idempotency_key: Option<String>,
    },
    SelectStaff,
    SelectServices,
    SelectRules {
        staff_id: Option<Ulid>,
    },
    SelectBlackouts,
    SelectSettings,
    SelectPolicy,
    SelectCard {
        code: String,
    },
    SelectLedger {
        code: String,
    },
    SelectHolds {
        staff_id: Option<Ulid>,
    },
    SelectBookings {
        id: Option<Ulid>,
        staff_id: Option<Ulid>,
    },
    SelectAttempts {
        booking_id: Ulid,
    },
    SelectSlots {
        service_id: Ulid,
        staff_id: Option<Ulid>,
        from: Option<Ms>,
        to: Option<Ms>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN ") {
        let target = trimmed[9..].trim().trim_matches(';');
        return Ok(if target == "*" {
            Command::UnlistenAll
        } else {
            Command::Unlisten { channel: target.to_string() }
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(table, assignments, selection)
        }
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "staff" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("staff", 2, values.len()));
            }
            Ok(Command::InsertStaff {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "services" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("services", 4, values.len()));
            }
            Ok(Command::InsertService {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                duration_min: parse_u32(&values[2])?,
                price_cents: parse_i64(&values[3])?,
            })
        }
        "rules" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("rules", 5, values.len()));
            }
            let services = if values.len() >= 6 {
                parse_ulid_list_or_null(&values[5])?
            } else {
                None
            };
            Ok(Command::InsertRule {
                id: parse_ulid(&values[0])?,
                staff_id: parse_ulid(&values[1])?,
                weekday: parse_u8(&values[2])?,
                start_min: parse_u32(&values[3])?,
                end_min: parse_u32(&values[4])?,
                services,
            })
        }
        "blackouts" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("blackouts", 4, values.len()));
            }
            Ok(Command::InsertBlackout {
                id: parse_ulid(&values[0])?,
                staff_id: parse_ulid_or_null(&values[1])?,
                start_day: parse_date(&values[2])?,
                end_day: parse_date(&values[3])?,
            })
        }
        "cards" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("cards", 2, values.len()));
            }
            let expires_at = if values.len() >= 3 {
                parse_i64_or_null(&values[2])?
            } else {
                None
            };
            Ok(Command::InsertCard {
                code: parse_string(&values[0])?,
                amount_cents: parse_i64(&values[1])?,
                expires_at,
            })
        }
        "holds" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("holds", 4, values.len()));
            }
            Ok(Command::InsertHold {
                id: parse_ulid(&values[0])?,
                staff_id: parse_ulid(&values[1])?,
                service_id: parse_ulid(&values[2])?,
                start: parse_i64(&values[3])?,
            })
        }
        "bookings" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("bookings", 5, values.len()));
            }
            let gift_code = if values.len() >= 6 {
                parse_string_or_null(&values[5])?
            } else {
                None
            };
            let hold_id = if values.len() >= 7 {
                parse_ulid_or_null(&values[6])?
            } else {
                None
            };
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                staff_id: parse_ulid(&values[1])?,
                service_id: parse_ulid(&values[2])?,
                customer: parse_string(&values[3])?,
                start: parse_i64(&values[4])?,
                gift_code,
                hold_id,
            })
        }
        "actions" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("actions", 2, values.len()));
            }
            let amount_cents = if values.len() >= 3 {
                parse_i64_or_null(&values[2])?
            } else {
                None
            };
            let idempotency_key = if values.len() >= 4 {
                parse_string_or_null(&values[3])?
            } else {
                None
            };
            Ok(Command::InsertAction {
                booking_id: parse_ulid(&values[0])?,
                action: parse_action(&values[1])?,
                amount_cents,
                idempotency_key,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "staff" => Ok(Command::DeleteStaff { id }),
        "services" => Ok(Command::DeleteService { id }),
        "rules" => Ok(Command::DeleteRule { id }),
        "blackouts" => Ok(Command::DeleteBlackout { id }),
        "holds" => Ok(Command::DeleteHold { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;

    match table.as_str() {
        "settings" => {
            let (mut timezone, mut grid, mut lead, mut advance, mut payout) =
                (None, None, None, None, None);
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "timezone" => timezone = Some(parse_string(&a.value)?),
                    "slot_grid_minutes" => grid = Some(parse_u32(&a.value)?),
                    "lead_time_minutes" => lead = Some(parse_u32(&a.value)?),
                    "max_advance_days" => advance = Some(parse_u32(&a.value)?),
                    "payout_account" => payout = Some(parse_string_or_null(&a.value)?),
                    other => {
                        return Err(SqlError::Parse(format!("unknown settings column: {other}")));
                    }
                }
            }
            Ok(Command::UpdateSettings {
                timezone,
                slot_grid_minutes: grid,
                lead_time_minutes: lead,
                max_advance_days: advance,
                payout_account: payout,
            })
        }
        "policy" => {
            let (mut no_show, mut cancel, mut restore) = (None, None, None);
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "no_show_fee" => no_show = Some(parse_fee_or_null(&a.value)?),
                    "cancel_fee" => cancel = Some(parse_fee_or_null(&a.value)?),
                    "refund_restores_credit" => restore = Some(parse_bool(&a.value)?),
                    other => {
                        return Err(SqlError::Parse(format!("unknown policy column: {other}")));
                    }
                }
            }
            Ok(Command::UpdatePolicy {
                no_show_fee: no_show,
                cancel_fee: cancel,
                refund_restores_credit: restore,
            })
        }
        "bookings" => {
            let booking_id = extract_where_id(selection)?;
            for a in assignments {
                if assignment_column(a)? == "method_ref" {
                    return Ok(Command::ConfirmCard {
                        booking_id,
                        method_ref: parse_string(&a.value)?,
                    });
                }
            }
            Err(SqlError::Unsupported("only method_ref is updatable on bookings".into()))
        }
        _ => Err(SqlError::UnknownTable(table)),
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

    match table.as_str() {
        "staff" => Ok(Command::SelectStaff),
        "services" => Ok(Command::SelectServices),
        "rules" => Ok(Command::SelectRules {
            staff_id: extract_eq_ulid(&select.selection, "staff_id")?,
        }),
        "blackouts" => Ok(Command::SelectBlackouts),
        "settings" => Ok(Command::SelectSettings),
        "policy" => Ok(Command::SelectPolicy),
        "cards" => Ok(Command::SelectCard {
            code: extract_eq_string(&select.selection, "code")?
                .ok_or(SqlError::MissingFilter("code"))?,
        }),
        "ledger" => Ok(Command::SelectLedger {
            code: extract_eq_string(&select.selection, "code")?
                .ok_or(SqlError::MissingFilter("code"))?,
        }),
        "holds" => Ok(Command::SelectHolds {
            staff_id: extract_eq_ulid(&select.selection, "staff_id")?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            id: extract_eq_ulid(&select.selection, "id")?,
            staff_id: extract_eq_ulid(&select.selection, "staff_id")?,
        }),
        "attempts" => Ok(Command::SelectAttempts {
            booking_id: extract_eq_ulid(&select.selection, "booking_id")?
                .ok_or(SqlError::MissingFilter("booking_id"))?,
        }),
        "slots" => {
            let (mut service_id, mut staff_id, mut from, mut to) = (None, None, None, None);
            if let Some(selection) = &select.selection {
                extract_slot_filters(selection, &mut service_id, &mut staff_id, &mut from, &mut to)?;
            }
            Ok(Command::SelectSlots {
                service_id: service_id.ok_or(SqlError::MissingFilter("service_id"))?,
                staff_id,
                from,
                to,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_slot_filters(
    expr: &Expr,
    service_id: &mut Option<Ulid>,
    staff_id: &mut Option<Ulid>,
    from: &mut Option<Ms>,
    to: &mut Option<Ms>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_slot_filters(left, service_id, staff_id, from, to)?;
                extract_slot_filters(right, service_id, staff_id, from, to)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left);
                if col.as_deref() == Some("service_id") {
                    *service_id = Some(parse_ulid_expr(right)?);
                } else if col.as_deref() == Some("staff_id") {
                    *staff_id = Some(parse_ulid_expr(right)?);
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *from = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *to = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        },
        _ => {}
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
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty assignment target".into()))
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
    extract_eq_ulid(selection, "id")?.ok_or(SqlError::MissingFilter("id"))
}

/// Single `col = <value>` filter. None when the WHERE clause is absent
/// or names other columns.
fn extract_eq_ulid(selection: &Option<Expr>, col: &str) -> Result<Option<Ulid>, SqlError> {
    match extract_eq_expr(selection, col) {
        Some(expr) => Ok(Some(parse_ulid_expr(expr)?)),
        None => Ok(None),
    }
}

fn extract_eq_string(selection: &Option<Expr>, col: &str) -> Result<Option<String>, SqlError> {
    match extract_eq_expr(selection, col) {
        Some(expr) => Ok(Some(parse_string(expr)?)),
        None => Ok(None),
    }
}

fn extract_eq_expr<'a>(selection: &'a Option<Expr>, col: &str) -> Option<&'a Expr> {
    fn walk<'a>(expr: &'a Expr, col: &str) -> Option<&'a Expr> {
        match expr {
            Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
                walk(left, col).or_else(|| walk(right, col))
            }
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                (expr_column_name(left).as_deref() == Some(col)).then_some(right.as_ref())
            }
            _ => None,
        }
    }
    selection.as_ref().and_then(|sel| walk(sel, col))
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?,
            )),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Rule service restriction, encoded as a comma-separated ULID string.
fn parse_ulid_list_or_null(expr: &Expr) -> Result<Option<Vec<Ulid>>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => {
                let ids = s
                    .split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(|part| {
                        Ulid::from_string(part)
                            .map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(ids))
            }
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Inclusive blackout day as a 'YYYY-MM-DD' string.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date: {e}")))
}

/// Fee column encoding: 'percent:50', 'flat:2000', or NULL to clear.
fn parse_fee_or_null(expr: &Expr) -> Result<Option<FeePolicy>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => parse_fee_str(s).map(Some),
            _ => Err(SqlError::Parse(format!(
                "expected fee string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_fee_str(s: &str) -> Result<FeePolicy, SqlError> {
    if let Some(pct) = s.strip_prefix("percent:") {
        let pct = pct
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad percent fee: {e}")))?;
        Ok(FeePolicy::Percent(pct))
    } else if let Some(cents) = s.strip_prefix("flat:") {
        let cents = cents
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad flat fee: {e}")))?;
        Ok(FeePolicy::Flat(cents))
    } else {
        Err(SqlError::Parse(format!("bad fee policy: {s}")))
    }
}

fn parse_action(expr: &Expr) -> Result<MoneyAction, SqlError> {
    let s = parse_string(expr)?;
    MoneyAction::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown action: {s}")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64_expr(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            _ => Ok(Some(parse_i64_expr(expr)?)),
        }
    } else {
        Ok(Some(parse_i64_expr(expr)?))
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
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
