//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// An identifier prefix matched more than one record.
    Ambiguous(String),
    /// Unknown agent, profile or executable; raised before any mutation.
    Precondition(String),
    /// The store stayed locked after the retry budget was spent.
    LockContention(String),
    /// A migration removed more rows than allowed and was rolled back.
    DataLoss {
        /// Migration that was aborted.
        migration: String,
        /// Table whose row count dropped.
        table: String,
        /// Row count before the migration body ran.
        before: i64,
        /// Row count after the migration body ran.
        after: i64,
    },
    /// Lineage cycle, dangling parent or excessive depth.
    Corruption(String),
    /// Worker process could not be launched or supervised.
    Process(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Ambiguous(msg) => write!(f, "ambiguous: {msg}"),
            Self::Precondition(msg) => write!(f, "precondition: {msg}"),
            Self::LockContention(msg) => write!(f, "lock contention: {msg}"),
            Self::DataLoss {
                migration,
                table,
                before,
                after,
            } => write!(
                f,
                "data loss: migration {migration} reduced {table} from {before} to {after} rows"
            ),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
