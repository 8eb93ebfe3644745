//! Statement building for the write layer.
//!
//! Table and column names are interpolated into SQL text, so they must only
//! ever come from code (contract processors, the rollback log this crate
//! writes itself) and never from chain data. Values are always bound through
//! `?` placeholders, except SQL `NULL`, which is written as a literal so the
//! statement stays valid whatever the column type is.

use crate::error::DbError;
use crate::rollback::Condition;
use crate::value::{Row, Value};

/// SQL text with `?` placeholders plus the values to bind, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Quote an identifier (`assets` → `"assets"`).
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `"a" = ? AND "b" IS NULL` over the primary-key columns of `row`.
///
/// A key column missing from `row` is treated as `NULL`.
pub fn primary_condition(row: &Row, primary_key: &[String]) -> Condition {
    let mut parts = Vec::with_capacity(primary_key.len());
    let mut values = Vec::new();
    for col in primary_key {
        match row.get(col) {
            Some(v) if !v.is_null() => {
                parts.push(format!("{} = ?", quote_ident(col)));
                values.push(v.clone());
            }
            _ => parts.push(format!("{} IS NULL", quote_ident(col))),
        }
    }
    Condition::new(parts.join(" AND "), values)
}

/// Multi-row `INSERT`. Every row must have exactly the same columns.
pub fn insert_statement(
    table: &str,
    rows: &[Row],
    returning: &[String],
) -> Result<Statement, DbError> {
    let first = rows.first().ok_or_else(|| DbError::EmptyStatement {
        table: table.to_string(),
    })?;
    let columns: Vec<String> = first.keys().cloned().collect();
    if columns.is_empty() {
        return Err(DbError::EmptyStatement {
            table: table.to_string(),
        });
    }
    if rows
        .iter()
        .any(|r| r.len() != columns.len() || !columns.iter().all(|c| r.contains_key(c)))
    {
        return Err(DbError::InvalidBatch {
            table: table.to_string(),
        });
    }

    let mut params = Vec::with_capacity(rows.len() * columns.len());
    let tuples: Vec<String> = rows
        .iter()
        .map(|r| {
            let slots: Vec<&str> = columns
                .iter()
                .map(|c| match &r[c] {
                    v if v.is_null() => "NULL",
                    v => {
                        params.push(v.clone());
                        "?"
                    }
                })
                .collect();
            format!("({})", slots.join(", "))
        })
        .collect();

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(table),
        column_list(&columns),
        tuples.join(", ")
    );
    if !returning.is_empty() {
        sql.push_str(" RETURNING ");
        sql.push_str(&column_list(returning));
    }

    Ok(Statement { sql, params })
}

/// `UPDATE ... SET ... WHERE <condition>`.
pub fn update_statement(
    table: &str,
    values: &Row,
    condition: &Condition,
) -> Result<Statement, DbError> {
    if values.is_empty() {
        return Err(DbError::EmptyStatement {
            table: table.to_string(),
        });
    }

    let mut params = Vec::with_capacity(values.len() + condition.values.len());
    let assignments: Vec<String> = values
        .iter()
        .map(|(col, v)| {
            if v.is_null() {
                format!("{} = NULL", quote_ident(col))
            } else {
                params.push(v.clone());
                format!("{} = ?", quote_ident(col))
            }
        })
        .collect();
    params.extend(condition.values.iter().cloned());

    Ok(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(table),
            assignments.join(", "),
            condition.sql
        ),
        params,
    })
}

/// `DELETE FROM ... WHERE <condition>`.
pub fn delete_statement(table: &str, condition: &Condition) -> Statement {
    Statement {
        sql: format!("DELETE FROM {} WHERE {}", quote_ident(table), condition.sql),
        params: condition.values.clone(),
    }
}

/// `SELECT <columns | *> FROM ... WHERE <condition>`.
pub fn select_statement(table: &str, columns: Option<&[String]>, condition: &Condition) -> Statement {
    let projection = match columns {
        Some(cols) if !cols.is_empty() => column_list(cols),
        _ => "*".to_string(),
    };
    Statement {
        sql: format!(
            "SELECT {} FROM {} WHERE {}",
            projection,
            quote_ident(table),
            condition.sql
        ),
        params: condition.values.clone(),
    }
}

/// Rewrite `?` placeholders as `$1, $2, ...` for backends that number them.
///
/// Question marks inside quoted strings or identifiers are left alone.
pub fn numbered_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    let mut quote: Option<char> = None;
    for ch in sql.chars() {
        match (quote, ch) {
            (None, '\'' | '"') => {
                quote = Some(ch);
                out.push(ch);
            }
            (Some(q), c) if c == q => {
                quote = None;
                out.push(ch);
            }
            (None, '?') => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(ch),
        }
    }
    out
}
