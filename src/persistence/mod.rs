//! Persistence layer modules.

pub mod agent_repo;
pub mod catalog;
pub mod db;
pub mod migrations;
pub mod schema;
pub mod session_repo;
pub mod spawn_repo;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AppError, Result};

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

pub use catalog::StorageCatalog;
pub use db::Store;

/// Encode a timestamp with fixed precision so text ordering matches time ordering.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a timestamp column written by [`encode_ts`].
pub(crate) fn decode_ts(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}

/// Decode an optional timestamp column.
pub(crate) fn decode_opt_ts(column: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| decode_ts(column, s)).transpose()
}
