//! Persistent store backed by PostgreSQL.
//!
//! The [`Store`] owns the connection pool, creates or verifies the schema on
//! open, and hands out [`Transaction`]s. All database updates run inside
//! transactions so that a crash of the service or a worker can never leave
//! the database in an inconsistent state: no job is lost once a user has been
//! told it was submitted.
//!
//! Timestamps are stored as text in a fixed encoding so that the schema is
//! inspectable with plain SQL; the codec helpers here are the single place
//! where that encoding lives.

use std::fmt::Display;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::error::{Error, Result};
use crate::transaction::Transaction;

/// Format for encoded datetimes.
const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";
/// Format for encoded dates.
const DATE_FORMAT: &str = "%Y/%m/%d";

/// Persistent store for bundles, datasets, variables, jobs and tasks.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Version of the database schema written to the metadata table.
    pub const SCHEMA_VERSION: &'static str = "V1";

    /// Open the store, creating the schema on first use.
    ///
    /// Fails if the database was created by a software version with a
    /// different schema identifier, or if the metadata singleton is missing
    /// or duplicated.
    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let store = Self { pool };
        store.init_metadata().await?;
        store.check_metadata().await?;
        info!(schema = Self::SCHEMA_VERSION, "store opened");
        Ok(store)
    }

    /// Begin a new unit of work.
    pub async fn begin(&self) -> Result<Transaction> {
        Ok(Transaction::new(self.pool.begin().await?))
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Write the metadata singleton if the table is empty.
    async fn init_metadata(&self) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata (schema, creation_date)
            SELECT $1, $2
            WHERE NOT EXISTS (SELECT 1 FROM metadata)
            "#,
        )
        .bind(Self::SCHEMA_VERSION)
        .bind(Self::encode_datetime(Some(Utc::now().naive_utc())))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Verify the metadata singleton matches the schema this code expects.
    async fn check_metadata(&self) -> Result<()> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT schema FROM metadata")
            .fetch_all(&self.pool)
            .await?;

        match rows.as_slice() {
            [schema] if schema == Self::SCHEMA_VERSION => Ok(()),
            [schema] => Err(Error::SchemaVersion {
                found: schema.clone(),
                expected: Self::SCHEMA_VERSION.to_string(),
            }),
            _ => Err(Error::MetadataCorrupted),
        }
    }

    /// Encode a datetime as text, compatible with [`Store::decode_datetime`].
    /// Absent values encode as the empty string.
    pub fn encode_datetime(dt: Option<NaiveDateTime>) -> String {
        match dt {
            None => String::new(),
            Some(dt) => dt.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    /// Decode a datetime encoded by [`Store::encode_datetime`].
    pub fn decode_datetime(s: &str) -> Result<Option<NaiveDateTime>> {
        if s.is_empty() {
            return Ok(None);
        }
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .map(Some)
            .map_err(|_| Error::Corrupt(format!("invalid stored timestamp {s:?}")))
    }

    /// Encode a date as text, compatible with [`Store::decode_date`].
    pub fn encode_date(d: Option<NaiveDate>) -> String {
        match d {
            None => String::new(),
            Some(d) => d.format(DATE_FORMAT).to_string(),
        }
    }

    /// Decode a date encoded by [`Store::encode_date`].
    pub fn decode_date(s: &str) -> Result<Option<NaiveDate>> {
        if s.is_empty() {
            return Ok(None);
        }
        NaiveDate::parse_from_str(s, DATE_FORMAT)
            .map(Some)
            .map_err(|_| Error::Corrupt(format!("invalid stored date {s:?}")))
    }

    /// Decode a JSON-serialised property bag column.
    pub fn decode_spec(s: &str) -> Result<serde_json::Value> {
        serde_json::from_str(s).map_err(|e| Error::Corrupt(format!("unreadable spec column: {e}")))
    }

    /// Render a quoted `IN (...)` value list.
    ///
    /// Only safe for values drawn from a closed enumeration (the job and task
    /// state enums); everything user-supplied is bound as a parameter.
    pub fn render_state_list<I>(states: I) -> String
    where
        I: IntoIterator,
        I::Item: Display,
    {
        states
            .into_iter()
            .map(|s| format!("'{s}'"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn datetime_round_trips_through_encoding() {
        let dt = NaiveDate::from_ymd_opt(2023, 4, 17)
            .unwrap()
            .and_hms_opt(9, 30, 5)
            .unwrap();
        let encoded = Store::encode_datetime(Some(dt));
        assert_eq!(encoded, "2023/04/17 09:30:05");
        assert_eq!(Store::decode_datetime(&encoded).unwrap(), Some(dt));
    }

    #[test]
    fn absent_datetime_encodes_as_empty_string() {
        assert_eq!(Store::encode_datetime(None), "");
        assert_eq!(Store::decode_datetime("").unwrap(), None);
    }

    #[test]
    fn date_round_trips_through_encoding() {
        let d = NaiveDate::from_ymd_opt(1981, 9, 1).unwrap();
        let encoded = Store::encode_date(Some(d));
        assert_eq!(encoded, "1981/09/01");
        assert_eq!(Store::decode_date(&encoded).unwrap(), Some(d));
    }

    #[test]
    fn malformed_timestamp_is_rejected() {
        assert!(Store::decode_datetime("17-04-2023").is_err());
        assert!(Store::decode_date("not a date").is_err());
    }

    #[test]
    fn state_list_renders_quoted_values() {
        assert_eq!(Store::render_state_list(["NEW", "RUNNING"]), "'NEW','RUNNING'");
        assert_eq!(Store::render_state_list(Vec::<String>::new()), "");
    }
}
