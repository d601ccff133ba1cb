//! SQL 渲染
//!
//! 标识符来自已校验的描述符，统一加双引号；值一律绑定为参数。

use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};
use strata_domain_core::{Entity, EntityDescriptor};
use strata_errors::{AppError, AppResult};
use strata_ports::{Condition, Selection};

pub(crate) type Builder = QueryBuilder<'static, Sqlite>;

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

/// 按 JSON 值的形状绑定参数；对象与数组以 JSON 文本存储。
/// 超出 i64 的无符号整数无法无损存储，直接拒绝
pub(crate) fn push_value(qb: &mut Builder, value: &Value) -> AppResult<()> {
    match value {
        Value::Null => {
            qb.push_bind(None::<String>);
        }
        Value::Bool(b) => {
            qb.push_bind(*b);
        }
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => {
                qb.push_bind(i);
            }
            (None, _) if n.is_u64() => {
                return Err(AppError::invalid_argument(format!(
                    "integer {} is out of range for SQLite",
                    n
                )));
            }
            (None, Some(f)) => {
                qb.push_bind(f);
            }
            (None, None) => {
                qb.push_bind(n.to_string());
            }
        },
        Value::String(s) => {
            qb.push_bind(s.clone());
        }
        other => {
            qb.push_bind(other.to_string());
        }
    }
    Ok(())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// 校验查询引用的列都属于该实体
pub(crate) fn validate_selection<E: Entity>(
    descriptor: &EntityDescriptor<E>,
    selection: &Selection,
) -> AppResult<()> {
    match selection
        .columns()
        .into_iter()
        .find(|column| !descriptor.has_column(column))
    {
        Some(unknown) => Err(AppError::invalid_argument(format!(
            "unknown column `{}` on `{}`",
            unknown,
            descriptor.table()
        ))),
        None => Ok(()),
    }
}

fn push_condition(qb: &mut Builder, condition: &Condition) -> AppResult<()> {
    match condition {
        Condition::Compare { column, op, value } => {
            qb.push(quote(column));
            match (op, value) {
                (strata_ports::CompareOp::Eq, Value::Null) => {
                    qb.push(" IS NULL");
                }
                (strata_ports::CompareOp::Ne, Value::Null) => {
                    qb.push(" IS NOT NULL");
                }
                _ => {
                    qb.push(format!(" {} ", op.as_sql()));
                    push_value(qb, value)?;
                }
            }
        }
        Condition::Like { column, pattern } => {
            qb.push(quote(column));
            qb.push(" LIKE ");
            qb.push_bind(pattern.clone());
        }
        Condition::IsNull(column) => {
            qb.push(quote(column));
            qb.push(" IS NULL");
        }
        Condition::IsNotNull(column) => {
            qb.push(quote(column));
            qb.push(" IS NOT NULL");
        }
        Condition::InList { column, values } => {
            if values.is_empty() {
                qb.push("0");
                return Ok(());
            }
            qb.push(quote(column));
            qb.push(" IN (");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                push_value(qb, value)?;
            }
            qb.push(")");
        }
        Condition::And(items) => push_group(qb, items, " AND ", "1")?,
        Condition::Or(items) => push_group(qb, items, " OR ", "0")?,
        Condition::Not(inner) => {
            qb.push("NOT (");
            push_condition(qb, inner)?;
            qb.push(")");
        }
    }
    Ok(())
}

fn push_group(
    qb: &mut Builder,
    items: &[Condition],
    separator: &str,
    empty: &str,
) -> AppResult<()> {
    if items.is_empty() {
        qb.push(empty);
        return Ok(());
    }
    qb.push("(");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            qb.push(separator);
        }
        push_condition(qb, item)?;
    }
    qb.push(")");
    Ok(())
}

fn push_where(qb: &mut Builder, conditions: &[Condition]) -> AppResult<()> {
    for (i, condition) in conditions.iter().enumerate() {
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        push_condition(qb, condition)?;
    }
    Ok(())
}

fn push_order(qb: &mut Builder, selection: &Selection) {
    for (i, (column, direction)) in selection.ordering().iter().enumerate() {
        qb.push(if i == 0 { " ORDER BY " } else { ", " });
        qb.push(quote(column));
        qb.push(" ");
        qb.push(direction.as_sql());
    }
}

fn push_paging(qb: &mut Builder, limit: Option<u64>, offset: Option<u64>) {
    match (limit, offset) {
        (None, None) => {}
        (limit, offset) => {
            qb.push(" LIMIT ");
            qb.push_bind(limit.map(to_i64).unwrap_or(-1));
            if let Some(offset) = offset {
                qb.push(" OFFSET ");
                qb.push_bind(to_i64(offset));
            }
        }
    }
}

fn push_select_body(qb: &mut Builder, table: &str, selection: &Selection) -> AppResult<()> {
    qb.push("SELECT * FROM ");
    qb.push(quote(table));
    push_where(qb, selection.conditions())?;
    push_order(qb, selection);
    push_paging(qb, selection.limit_value(), selection.offset_value());
    Ok(())
}

pub(crate) fn select(table: &str, selection: &Selection) -> AppResult<Builder> {
    let mut qb = QueryBuilder::new("");
    push_select_body(&mut qb, table, selection)?;
    Ok(qb)
}

/// 统计塑形查询的行数（保留其 limit / offset）
pub(crate) fn count(table: &str, selection: &Selection) -> AppResult<Builder> {
    let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM (");
    push_select_body(&mut qb, table, selection)?;
    qb.push(")");
    Ok(qb)
}

/// `LIMIT 1` 短路的存在性查询
pub(crate) fn exists(table: &str, selection: &Selection) -> AppResult<Builder> {
    let mut qb = QueryBuilder::new("SELECT EXISTS(SELECT 1 FROM ");
    qb.push(quote(table));
    push_where(&mut qb, selection.conditions())?;
    push_paging(&mut qb, Some(1), selection.offset_value());
    qb.push(")");
    Ok(qb)
}

pub(crate) fn insert(table: &str, columns: &[(&str, &Value)]) -> AppResult<Builder> {
    let mut qb = QueryBuilder::new("INSERT INTO ");
    qb.push(quote(table));
    if columns.is_empty() {
        qb.push(" DEFAULT VALUES");
        return Ok(qb);
    }

    qb.push(" (");
    for (i, (column, _)) in columns.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push(quote(column));
    }
    qb.push(") VALUES (");
    for (i, (_, value)) in columns.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        push_value(&mut qb, value)?;
    }
    qb.push(")");
    Ok(qb)
}

pub(crate) fn update(
    table: &str,
    columns: &[(&str, &Value)],
    key_column: &str,
    key: &Value,
) -> AppResult<Builder> {
    let mut qb = QueryBuilder::new("UPDATE ");
    qb.push(quote(table));
    qb.push(" SET ");
    for (i, (column, value)) in columns.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push(quote(column));
        qb.push(" = ");
        push_value(&mut qb, value)?;
    }
    qb.push(" WHERE ");
    qb.push(quote(key_column));
    qb.push(" = ");
    push_value(&mut qb, key)?;
    Ok(qb)
}

pub(crate) fn delete_where(table: &str, conditions: &[Condition]) -> AppResult<Builder> {
    let mut qb = QueryBuilder::new("DELETE FROM ");
    qb.push(quote(table));
    push_where(&mut qb, conditions)?;
    Ok(qb)
}
