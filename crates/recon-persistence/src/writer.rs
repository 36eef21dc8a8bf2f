//! JSON Lines trade log.
//!
//! One line per position event, appended to a file per UTC day:
//! - each line is a complete JSON object
//! - an interrupted write only damages the last line
//! - reopening never truncates earlier records

use crate::error::PersistenceResult;
use chrono::{DateTime, Utc};
use recon_core::{PersistAction, Position};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One persisted position event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub action: PersistAction,
    pub recorded_at: DateTime<Utc>,
    /// Snapshot at the time of the event; absent for `delete_all_positions`.
    pub position: Option<Position>,
}

/// Destination for trade records.
pub trait RecordSink: Send {
    /// Durably append one record.
    fn append(&mut self, record: &TradeRecord) -> PersistenceResult<()>;

    /// Release any open handle.
    fn close(&mut self) -> PersistenceResult<()>;
}

struct ActiveFile {
    writer: BufWriter<File>,
    date: String,
    records_written: usize,
}

/// Daily-rotated JSON Lines writer (`trades_YYYY-MM-DD.jsonl`).
pub struct TradeLogWriter {
    base_dir: PathBuf,
    active: Option<ActiveFile>,
}

impl TradeLogWriter {
    /// Create a writer under `base_dir`, creating the directory if needed.
    pub fn new(base_dir: impl AsRef<Path>) -> PersistenceResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            active: None,
        })
    }

    /// Path of the file holding records for `date` (`YYYY-MM-DD`).
    pub fn path_for(&self, date: &str) -> PathBuf {
        self.base_dir.join(format!("trades_{date}.jsonl"))
    }

    fn close_active(&mut self) {
        if let Some(active) = self.active.take() {
            Self::finish(active);
        }
    }

    fn finish(mut active: ActiveFile) {
        if let Err(e) = active.writer.flush() {
            warn!(?e, "Failed to flush trade log on close");
        }
        info!(
            date = %active.date,
            records = active.records_written,
            "Closed trade log"
        );
    }

    /// Active file for `date`, rotating away from any other day's file.
    fn open(&mut self, date: &str) -> PersistenceResult<&mut ActiveFile> {
        let active = match self.active.take() {
            Some(active) if active.date == date => active,
            stale => {
                if let Some(old) = stale {
                    Self::finish(old);
                }
                let path = self.path_for(date);
                info!(path = %path.display(), "Opening trade log (append mode)");
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                ActiveFile {
                    writer: BufWriter::new(file),
                    date: date.to_string(),
                    records_written: 0,
                }
            }
        };
        Ok(self.active.insert(active))
    }
}

impl RecordSink for TradeLogWriter {
    fn append(&mut self, record: &TradeRecord) -> PersistenceResult<()> {
        let date = record.recorded_at.format("%Y-%m-%d").to_string();
        let line = serde_json::to_string(record)?;

        let result = self.open(&date).and_then(|active| {
            writeln!(active.writer, "{line}")?;
            active.writer.flush()?;
            active.records_written += 1;
            Ok(())
        });

        if result.is_err() {
            // Reopen on the next attempt rather than reuse a failed handle.
            self.active = None;
        } else {
            debug!(action = %record.action, date = %date, "Trade record written");
        }
        result
    }

    fn close(&mut self) -> PersistenceResult<()> {
        self.close_active();
        Ok(())
    }
}

impl Drop for TradeLogWriter {
    fn drop(&mut self) {
        self.close_active();
    }
}
