use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use scan_core::{ScanError, ScanResult};
use tempfile::NamedTempFile;
use tracing::debug;

/// A tab-separated table held as text cells.
///
/// Columns the scan does not know about are carried through unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct TsvTable {
    path: PathBuf,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TsvTable {
    /// Read a table with a header row.
    pub fn load(path: impl AsRef<Path>) -> ScanResult<Self> {
        let path = path.as_ref().to_path_buf();
        let load_error = |message: String| ScanError::SettingsLoad {
            path: path.clone(),
            message,
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(&path)
            .map_err(|e| load_error(e.to_string()))?;

        let headers = reader
            .headers()
            .map_err(|e| load_error(e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();

        let rows = reader
            .records()
            .map(|record| {
                record
                    .map(|r| r.iter().map(str::to_string).collect())
                    .map_err(|e| load_error(e.to_string()))
            })
            .collect::<ScanResult<Vec<Vec<String>>>>()?;

        debug!(path = %path.display(), rows = rows.len(), "settings table loaded");
        Ok(Self {
            path,
            headers,
            rows,
        })
    }

    /// File the table was loaded from and is persisted to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Column names in file order.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Number of data rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table has no data rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a named column.
    pub fn column(&self, name: &str) -> ScanResult<usize> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ScanError::MissingColumn {
                path: self.path.clone(),
                column: name.to_string(),
            })
    }

    /// Cell text, if the row and column exist.
    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        self.rows.get(row)?.get(column).map(String::as_str)
    }

    /// Parse every cell of a column as `u32`.
    pub fn parse_column(&self, column: usize) -> ScanResult<Vec<u32>> {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let text = row.get(column).map(String::as_str).unwrap_or_default();
                parse_id(text).ok_or_else(|| ScanError::SettingsLoad {
                    path: self.path.clone(),
                    message: format!(
                        "row {}: '{}' in column '{}' is not an integer id",
                        i + 1,
                        text,
                        self.headers[column]
                    ),
                })
            })
            .collect()
    }

    /// Overwrite `column` in every row for which `select(row_index)` is true.
    pub fn set_where<F>(&mut self, column: usize, value: &str, mut select: F)
    where
        F: FnMut(usize) -> bool,
    {
        for (i, row) in self.rows.iter_mut().enumerate() {
            if select(i) {
                if let Some(cell) = row.get_mut(column) {
                    value.clone_into(cell);
                }
            }
        }
    }

    /// Sibling path holding the previous on-disk version (`name_backup.ext`).
    pub fn backup_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match self.path.extension() {
            Some(ext) => format!("{stem}_backup.{}", ext.to_string_lossy()),
            None => format!("{stem}_backup"),
        };
        self.path.with_file_name(name)
    }

    /// Serialize the table as tab-separated text.
    pub fn to_tsv(&self) -> ScanResult<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(Vec::new());
        writer
            .write_record(&self.headers)
            .and_then(|_| self.rows.iter().try_for_each(|row| writer.write_record(row)))
            .map_err(|e| self.persist_error(io::Error::other(e)))?;
        writer
            .into_inner()
            .map_err(|e| self.persist_error(io::Error::other(e.to_string())))
    }

    /// Copy the current file to [`backup_path`](Self::backup_path), then
    /// atomically replace the file with the in-memory table.
    ///
    /// A failure at any point leaves the primary file either untouched or
    /// fully rewritten.
    pub fn persist(&self) -> ScanResult<()> {
        self.persist_with(|file, body| file.write_all(body))
    }

    pub(crate) fn persist_with<F>(&self, write_body: F) -> ScanResult<()>
    where
        F: FnOnce(&mut dyn Write, &[u8]) -> io::Result<()>,
    {
        let body = self.to_tsv()?;

        let backup = self.backup_path();
        fs::copy(&self.path, &backup).map_err(|source| ScanError::PersistFailure {
            path: backup.clone(),
            source,
        })?;

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let permissions = fs::metadata(&self.path)
            .map(|m| m.permissions())
            .map_err(|e| self.persist_error(e))?;
        let mut staged = NamedTempFile::new_in(dir).map_err(|e| self.persist_error(e))?;
        // the staged file starts out owner-only
        write_body(staged.as_file_mut(), &body)
            .and_then(|_| staged.as_file().set_permissions(permissions))
            .and_then(|_| staged.as_file_mut().sync_all())
            .map_err(|e| self.persist_error(e))?;
        staged
            .persist(&self.path)
            .map_err(|e| self.persist_error(e.error))?;

        debug!(path = %self.path.display(), rows = self.rows.len(), "settings table persisted");
        Ok(())
    }

    fn persist_error(&self, source: io::Error) -> ScanError {
        ScanError::PersistFailure {
            path: self.path.clone(),
            source,
        }
    }
}

/// Integer ids may have been written as floats (`3.0`) by other tools.
fn parse_id(text: &str) -> Option<u32> {
    let text = text.trim();
    text.parse::<u32>().ok().or_else(|| {
        let value = text.parse::<f64>().ok()?;
        (value.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(&value))
            .then_some(value as u32)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "portID\tslaveID\tslotID\tchannelID\tNote\n0\t0\t2\t5\tref\n0\t0\t2\t6\t\n";

    fn write_table(dir: &Path) -> PathBuf {
        let path = dir.join("bias_settings.tsv");
        fs::write(&path, TABLE).unwrap();
        path
    }

    #[test]
    fn test_load_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let table = TsvTable::load(write_table(dir.path())).unwrap();

        assert_eq!(table.len(), 2);
        let slot = table.column("slotID").unwrap();
        assert_eq!(table.parse_column(slot).unwrap(), vec![2, 2]);
        assert_eq!(table.cell(0, 4), Some("ref"));

        let err = table.column("Overvoltage").unwrap_err();
        assert!(matches!(err, ScanError::MissingColumn { ref column, .. } if column == "Overvoltage"));
    }

    #[test]
    fn test_missing_file_is_settings_load() {
        let dir = tempfile::tempdir().unwrap();
        let err = TsvTable::load(dir.path().join("nope.tsv")).unwrap_err();
        assert!(matches!(err, ScanError::SettingsLoad { .. }));
    }

    #[test]
    fn test_unknown_columns_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_table(dir.path());
        let table = TsvTable::load(&path).unwrap();

        table.persist().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), TABLE);
    }

    #[test]
    fn test_persist_keeps_backup_of_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_table(dir.path());
        let mut table = TsvTable::load(&path).unwrap();
        let channel = table.column("channelID").unwrap();

        table.set_where(channel, "9", |row| row == 1);
        table.persist().unwrap();

        let backup = dir.path().join("bias_settings_backup.tsv");
        assert_eq!(table.backup_path(), backup);
        assert_eq!(fs::read_to_string(&backup).unwrap(), TABLE);
        let reloaded = TsvTable::load(&path).unwrap();
        assert_eq!(reloaded.cell(1, channel), Some("9"));
        assert_eq!(reloaded, table);
    }

    #[cfg(unix)]
    #[test]
    fn test_persist_keeps_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = write_table(dir.path());
        fs::set_permissions(&path, fs::Permissions::from_mode(0o664)).unwrap();

        TsvTable::load(&path).unwrap().persist().unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o664);
    }

    #[test]
    fn test_failed_write_leaves_primary_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_table(dir.path());
        let mut table = TsvTable::load(&path).unwrap();
        let slot = table.column("slotID").unwrap();
        table.set_where(slot, "7", |_| true);

        let err = table
            .persist_with(|file, body| {
                file.write_all(&body[..body.len() / 2])?;
                Err(io::Error::other("disk full"))
            })
            .unwrap_err();

        assert!(matches!(err, ScanError::PersistFailure { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), TABLE);
        // no staging files left behind
        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 2);
    }

    #[test]
    fn test_parse_id_accepts_integral_floats() {
        assert_eq!(parse_id("3"), Some(3));
        assert_eq!(parse_id(" 4.0 "), Some(4));
        assert_eq!(parse_id("4.5"), None);
        assert_eq!(parse_id("-1"), None);
    }
}
