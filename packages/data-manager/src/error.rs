use thiserror::Error;

/// Errors surfaced by the data manager.
#[derive(Debug, Error)]
pub enum Error {
    /// A catalog file was missing, malformed, or carried a value outside its
    /// enumeration (temporal/spatial resolution).
    #[error("catalog error: {0}")]
    Catalog(String),

    /// The database was created by a different version of the software.
    #[error("database schema {found} does not match expected schema {expected}")]
    SchemaVersion { found: String, expected: String },

    /// The metadata singleton is absent or duplicated.
    #[error("database metadata is missing or duplicated")]
    MetadataCorrupted,

    /// A lookup by id returned nothing.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// An insert collided with an existing primary key.
    #[error("{entity} {id} already exists")]
    Conflict { entity: &'static str, id: String },

    /// A job or task property bag is missing a recognized key or holds an
    /// unusable value.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Stored data that should be well-formed could not be decoded.
    #[error("stored data corrupted: {0}")]
    Corrupt(String),

    /// The database rejected or could not complete an operation.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classify an insert failure: unique-key violations become [`Error::Conflict`],
/// everything else stays a storage error.
pub(crate) fn conflict_or_storage(err: sqlx::Error, entity: &'static str, id: String) -> Error {
    if let sqlx::Error::Database(db) = &err {
        if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) {
            return Error::Conflict { entity, id };
        }
    }
    Error::Storage(err)
}
