//! Scoped unit of work against the store.
//!
//! A [`Transaction`] checks a connection out of the pool on creation and
//! commits only when [`Transaction::commit`] is called; on every other exit
//! path, including errors and panics, dropping the value rolls the
//! transaction back and releases the connection. Repository capability sets
//! ([`SchemaOperations`](crate::catalog::SchemaOperations),
//! [`JobOperations`](crate::jobs::JobOperations),
//! [`TaskQueueOperations`](crate::jobs::TaskQueueOperations)) are traits
//! implemented for this type: callers acquire one transaction, invoke any
//! number of repository methods on it, and decide commit versus rollback once.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Column, PgConnection, Postgres, Row};

use crate::error::Result;

/// A single-threaded unit of work holding one pooled connection.
///
/// Not shared between callers: concurrent consumers each hold their own
/// transaction. Nested transactions are not supported.
pub struct Transaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl Transaction {
    pub(crate) fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }

    /// Commit the unit of work.
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Explicitly roll back. Dropping the transaction without committing has
    /// the same effect.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    /// The connection backing this transaction, for executing queries.
    pub(crate) fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Run a read-only query and collect the rows into
    /// `column name -> value` maps, for surfaces that inspect tables rather
    /// than entities (diagnostics, dumps).
    pub async fn query_rows(&mut self, sql: &str) -> Result<Vec<BTreeMap<String, JsonValue>>> {
        let rows = sqlx::query(sql).fetch_all(&mut *self.tx).await?;
        Ok(Self::rows_to_maps(&rows))
    }

    /// Collect rows into `column name -> value` maps.
    ///
    /// The schema stores text and integer columns only; anything else decodes
    /// as null.
    pub fn rows_to_maps(rows: &[PgRow]) -> Vec<BTreeMap<String, JsonValue>> {
        rows.iter()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|col| {
                        let idx = col.ordinal();
                        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
                            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
                        } else if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
                            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
                        } else if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
                            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
                        } else {
                            JsonValue::Null
                        };
                        (col.name().to_string(), value)
                    })
                    .collect()
            })
            .collect()
    }
}
