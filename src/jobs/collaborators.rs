//! Outbound collaborators: message delivery and report files.

use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

/// Delivers one message to a user. `false` means not delivered (the record stays unsent and is
/// retried by the next run).
pub trait Notifier: Send + Sync {
    fn deliver(&self, uuid: &str, text: &str) -> bool;
}

/// Logs each message instead of sending it.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn deliver(&self, uuid: &str, text: &str) -> bool {
        info!("notify {}: {}", uuid, text);
        true
    }
}

/// Writes a named report of string rows.
pub trait ReportWriter: Send + Sync {
    /// Returns where the report landed.
    fn write(&self, filename: &str, rows: &[Vec<String>]) -> Result<PathBuf>;
}

/// CSV files under one directory (created on first write).
#[derive(Clone, Debug)]
pub struct CsvReportWriter {
    dir: PathBuf,
}

impl CsvReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ReportWriter for CsvReportWriter {
    fn write(&self, filename: &str, rows: &[Vec<String>]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create report dir {}", self.dir.display()))?;
        let path = self.dir.join(filename);
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_path(&path)
            .with_context(|| format!("create report {}", path.display()))?;
        for row in rows {
            writer
                .write_record(row)
                .with_context(|| format!("write report {}", path.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("flush report {}", path.display()))?;
        info!("Report written: {} ({} rows)", path.display(), rows.len());
        Ok(path)
    }
}
