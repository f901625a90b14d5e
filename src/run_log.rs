//! Run log: one line per completed acquisition.
//!
//! ```text
//! file_name	motorX	motorY
//! run_X0.0_Y0.0_0it_3.0OV_20T1_15T2_10E	0	0
//! ```
//!
//! The stage columns are present only when stages are scanned. The log is the
//! input of the processing pass and the record used to pick a resume index.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use scan_core::{ScanError, ScanResult};
use tracing::{info, warn};

const FILE_NAME: &str = "file_name";

/// What to do with a log left over from a previous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingLogAction {
    /// Remove it and start a fresh log
    Delete,
    /// Keep it and append new entries
    Append,
    /// Stop without touching it
    Abort,
}

/// One completed acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLogEntry {
    /// Output base name passed to the acquisition binary
    pub file_name: String,
    /// Stage positions at acquisition time, in log column order
    pub positions: Vec<f64>,
}

/// Handle on a run-log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLog {
    path: PathBuf,
    axes: Vec<String>,
}

impl RunLog {
    /// Log at `path` with one position column per stage axis.
    pub fn new(path: impl Into<PathBuf>, axes: Vec<String>) -> Self {
        Self {
            path: path.into(),
            axes,
        }
    }

    /// Open an existing log, taking the stage columns from its header.
    pub fn open(path: impl Into<PathBuf>) -> ScanResult<Self> {
        let path = path.into();
        let mut reader = reader(&path)?;
        let headers = reader.headers().map_err(|e| log_error(&path, e))?;
        match headers.get(0) {
            Some(FILE_NAME) => {}
            other => {
                return Err(ScanError::RunLog {
                    path,
                    message: format!("expected '{FILE_NAME}' header, found {other:?}"),
                })
            }
        }
        let axes = headers.iter().skip(1).map(str::to_string).collect();
        Ok(Self { path, axes })
    }

    /// Log file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stage columns.
    pub fn axes(&self) -> &[String] {
        &self.axes
    }

    /// Get the log ready for a new run.
    ///
    /// When a log already exists `decide` chooses whether to delete it, append
    /// to it, or abort the run.
    pub fn prepare<F>(&self, decide: F) -> ScanResult<()>
    where
        F: FnOnce(&Path) -> ExistingLogAction,
    {
        if self.path.exists() {
            match decide(&self.path) {
                ExistingLogAction::Abort => {
                    return Err(ScanError::Aborted(format!(
                        "run log {} already exists",
                        self.path.display()
                    )));
                }
                ExistingLogAction::Append => {
                    let existing = Self::open(&self.path)?;
                    if existing.axes != self.axes {
                        return Err(ScanError::RunLog {
                            path: self.path.clone(),
                            message: format!(
                                "stage columns {:?} do not match configured axes {:?}",
                                existing.axes, self.axes
                            ),
                        });
                    }
                    info!(path = %self.path.display(), "appending to existing run log");
                    return Ok(());
                }
                ExistingLogAction::Delete => {
                    warn!(path = %self.path.display(), "deleting existing run log");
                    fs::remove_file(&self.path)?;
                }
            }
        }

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut header = vec![FILE_NAME.to_string()];
        header.extend(self.axes.iter().cloned());
        self.write_record(&header, false)
    }

    /// Append one completed acquisition.
    pub fn append(&self, entry: &RunLogEntry) -> ScanResult<()> {
        if entry.positions.len() != self.axes.len() {
            return Err(ScanError::RunLog {
                path: self.path.clone(),
                message: format!(
                    "entry {} has {} positions for {} stage columns",
                    entry.file_name,
                    entry.positions.len(),
                    self.axes.len()
                ),
            });
        }
        let mut record = vec![entry.file_name.clone()];
        record.extend(entry.positions.iter().map(f64::to_string));
        self.write_record(&record, true)
    }

    /// Every entry in file order.
    pub fn entries(&self) -> ScanResult<Vec<RunLogEntry>> {
        let mut reader = reader(&self.path)?;
        reader
            .records()
            .enumerate()
            .map(|(i, record)| -> ScanResult<RunLogEntry> {
                let record = record.map_err(|e| log_error(&self.path, e))?;
                let mut fields = record.iter();
                let file_name = fields.next().unwrap_or_default().to_string();
                let positions = fields
                    .map(|f| f.trim().parse::<f64>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| ScanError::RunLog {
                        path: self.path.clone(),
                        message: format!("line {}: {e}", i + 2),
                    })?;
                Ok(RunLogEntry {
                    file_name,
                    positions,
                })
            })
            .collect()
    }

    fn write_record(&self, record: &[String], append: bool) -> ScanResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);
        writer
            .write_record(record)
            .map_err(|e| log_error(&self.path, e))?;
        writer.flush()?;
        Ok(())
    }
}

fn reader(path: &Path) -> ScanResult<csv::Reader<fs::File>> {
    csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .map_err(|e| log_error(path, e))
}

fn log_error(path: &Path, error: csv::Error) -> ScanError {
    ScanError::RunLog {
        path: path.to_path_buf(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axes() -> Vec<String> {
        vec!["motorX".to_string(), "motorY".to_string()]
    }

    #[test]
    fn test_prepare_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("run_files.log");
        let log = RunLog::new(&path, axes());

        log.prepare(|_| unreachable!("no existing log")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "file_name\tmotorX\tmotorY\n");
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_files.log");
        let log = RunLog::new(&path, axes());
        log.prepare(|_| ExistingLogAction::Delete).unwrap();

        let entry = RunLogEntry {
            file_name: "run_X2.5_Y90.0_0it_3.0OV_20T1_15T2_10E".to_string(),
            positions: vec![2.5, 90.0],
        };
        log.append(&entry).unwrap();

        let reopened = RunLog::open(&path).unwrap();
        assert_eq!(reopened.axes(), axes().as_slice());
        assert_eq!(reopened.entries().unwrap(), vec![entry]);
        assert!(fs::read_to_string(&path).unwrap().ends_with("\t2.5\t90\n"));
    }

    #[test]
    fn test_log_without_stages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_files.log");
        let log = RunLog::new(&path, Vec::new());
        log.prepare(|_| ExistingLogAction::Delete).unwrap();
        log.append(&RunLogEntry {
            file_name: "run_0it_3.0OV_20T1_15T2_10E".to_string(),
            positions: Vec::new(),
        })
        .unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "file_name\nrun_0it_3.0OV_20T1_15T2_10E\n"
        );
        assert_eq!(log.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_existing_log_actions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_files.log");
        let log = RunLog::new(&path, Vec::new());
        log.prepare(|_| ExistingLogAction::Delete).unwrap();
        let entry = RunLogEntry {
            file_name: "first".to_string(),
            positions: Vec::new(),
        };
        log.append(&entry).unwrap();

        let err = log.prepare(|_| ExistingLogAction::Abort).unwrap_err();
        assert!(matches!(err, ScanError::Aborted(_)));
        assert_eq!(log.entries().unwrap().len(), 1);

        log.prepare(|_| ExistingLogAction::Append).unwrap();
        assert_eq!(log.entries().unwrap(), vec![entry]);

        log.prepare(|_| ExistingLogAction::Delete).unwrap();
        assert!(log.entries().unwrap().is_empty());
    }

    #[test]
    fn test_append_rejects_mismatched_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_files.log");
        RunLog::new(&path, axes()).prepare(|_| ExistingLogAction::Delete).unwrap();

        let err = RunLog::new(&path, Vec::new())
            .prepare(|_| ExistingLogAction::Append)
            .unwrap_err();
        assert!(matches!(err, ScanError::RunLog { .. }));

        let log = RunLog::new(&path, axes());
        let err = log
            .append(&RunLogEntry {
                file_name: "x".to_string(),
                positions: vec![1.0],
            })
            .unwrap_err();
        assert!(matches!(err, ScanError::RunLog { .. }));
    }
}
