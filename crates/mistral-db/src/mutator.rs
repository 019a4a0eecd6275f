//! Generic row access: load, compare-and-swap update, and row locks.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use tracing::{debug, instrument};

use crate::error::{DbError, Result};
use crate::models::Model;
use crate::session::Session;

fn select_by_id<M: Model>() -> String {
    format!(
        "SELECT {} FROM {} WHERE id = ?1",
        M::COLUMNS.join(", "),
        M::TABLE
    )
}

fn check_column<M: Model>(column: &str) -> Result<()> {
    if M::COLUMNS.contains(&column) {
        Ok(())
    } else {
        Err(DbError::InvalidArgument(format!(
            "{} has no column {column}",
            M::TABLE
        )))
    }
}

/// Load one row by primary key.
pub fn load<M: Model>(session: &Session, id: &str) -> Result<Option<M>> {
    let row = session
        .conn()?
        .prepare_cached(&select_by_id::<M>())?
        .query_row([id], M::from_row)
        .optional()?;
    Ok(row)
}

/// Conditional update: set `values` on row `id` only if every `specimen`
/// column still holds the expected value.
///
/// Exactly one `UPDATE` is issued. A `NULL` in the specimen matches with
/// `IS NULL`. Returns the reloaded row and the affected count; a count of 0
/// means the row changed (or vanished) underneath the caller, which is the
/// normal outcome for the losers of a capture race.
#[instrument(skip(session, specimen, values), fields(table = M::TABLE, session = session.id()))]
pub fn update_on_match<M: Model>(
    session: &Session,
    id: &str,
    specimen: &[(&str, Value)],
    values: &[(&str, Value)],
) -> Result<(Option<M>, usize)> {
    if values.is_empty() {
        return Err(DbError::InvalidArgument(
            "update_on_match needs at least one value to set".to_string(),
        ));
    }

    let mut params: Vec<Value> = Vec::with_capacity(values.len() + specimen.len() + 1);
    let mut assignments = Vec::with_capacity(values.len());
    for (column, value) in values {
        check_column::<M>(column)?;
        if *column == "id" {
            return Err(DbError::InvalidArgument("the id column is immutable".to_string()));
        }
        params.push(value.clone());
        assignments.push(format!("{column} = ?{}", params.len()));
    }

    params.push(Value::Text(id.to_string()));
    let mut conditions = vec![format!("id = ?{}", params.len())];
    for (column, expected) in specimen {
        check_column::<M>(column)?;
        match expected {
            Value::Null => conditions.push(format!("{column} IS NULL")),
            other => {
                params.push(other.clone());
                conditions.push(format!("{column} = ?{}", params.len()));
            }
        }
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        M::TABLE,
        assignments.join(", "),
        conditions.join(" AND ")
    );
    let affected = session.conn()?.execute(&sql, params_from_iter(params))?;
    debug!(id, affected, "update on match");

    if affected == 0 {
        return Ok((None, 0));
    }
    Ok((load::<M>(session, id)?, affected))
}

/// Lock row `id` for the rest of the session's transaction, then read it.
///
/// SQLite has no `SELECT ... FOR UPDATE`; the lock is the compatibility lock
/// keyed by `table:id`, so it only excludes sessions of the same
/// [`crate::Database`].
#[instrument(skip(session), fields(table = M::TABLE, session = session.id()))]
pub fn acquire_lock<M: Model>(session: &Session, id: &str) -> Result<M> {
    session.require_tx()?;
    let key = format!("{}:{}", M::TABLE, id);
    session.database().compat_locks().acquire(&key, session.id());
    load::<M>(session, id)?.ok_or_else(|| DbError::NotFound {
        table: M::TABLE,
        id: id.to_string(),
    })
}

/// SQL text parameter helper for specimen/value lists.
pub fn text(value: impl Into<String>) -> Value {
    Value::Text(value.into())
}

pub fn opt_text(value: Option<impl Into<String>>) -> Value {
    value.map_or(Value::Null, |v| Value::Text(v.into()))
}
