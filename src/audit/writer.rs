//! Append-only JSONL sink, one file per prefix and calendar day.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

use super::{AuditEntry, AuditLogger};
use crate::{AppError, Result};

/// The file currently receiving lines.
struct DailyFile {
    date: NaiveDate,
    out: BufWriter<File>,
}

impl DailyFile {
    fn append(&mut self, line: &str) -> std::io::Result<()> {
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

/// Writes audit entries to `<log_dir>/<prefix>-YYYY-MM-DD.jsonl`.
///
/// The first write after midnight (UTC) switches to a new file. Each line is
/// flushed before `log_entry` returns, so a crash loses at most the entry in
/// flight.
pub struct JsonlAuditWriter {
    log_dir: PathBuf,
    prefix: String,
    current: Mutex<Option<DailyFile>>,
}

impl JsonlAuditWriter {
    /// Create a writer for `prefix` files under `log_dir`, creating the
    /// directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub fn new(log_dir: PathBuf, prefix: &str) -> Result<Self> {
        fs::create_dir_all(&log_dir).map_err(|e| {
            AppError::Io(format!("cannot create log directory {}: {e}", log_dir.display()))
        })?;
        Ok(Self {
            log_dir,
            prefix: prefix.to_owned(),
            current: Mutex::new(None),
        })
    }

    /// File that receives entries written on `date`.
    #[must_use]
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.log_dir.join(format!("{}-{date}.jsonl", self.prefix))
    }

    fn open(&self, date: NaiveDate) -> Result<DailyFile> {
        let path = self.path_for(date);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AppError::Io(format!("cannot open {}: {e}", path.display())))?;
        debug!(path = %path.display(), "audit log opened");
        Ok(DailyFile {
            date,
            out: BufWriter::new(file),
        })
    }
}

impl AuditLogger for JsonlAuditWriter {
    fn log_entry(&self, entry: AuditEntry) -> Result<()> {
        let line = serde_json::to_string(&entry)
            .map_err(|e| AppError::Io(format!("cannot encode audit entry: {e}")))?;
        let today = Utc::now().date_naive();

        let mut current = self
            .current
            .lock()
            .map_err(|_| AppError::Io(format!("{} audit writer poisoned", self.prefix)))?;
        let file = match current.take() {
            Some(file) if file.date == today => file,
            _ => self.open(today)?,
        };
        let file = current.insert(file);

        file.append(&line).map_err(|e| {
            warn!(prefix = self.prefix, %e, "audit append failed");
            AppError::Io(format!("audit append failed: {e}"))
        })
    }
}
