//! CSV lookup-table plumbing.
//!
//! Every state table in this app is a flat CSV file with a fixed header row,
//! readable by Splunk's `inputlookup`. Concurrent alert-action invocations can
//! touch the same table, so all read-modify-write cycles go through
//! [`with_exclusive_lock`]: an advisory `flock` on a sidecar `.lock` file,
//! with rewrites landing via temp file + rename.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BridgeError;

fn io_err(path: &Path, source: std::io::Error) -> BridgeError {
    BridgeError::LookupIo {
        path: path.display().to_string(),
        source,
    }
}

fn format_err(path: &Path, source: csv::Error) -> BridgeError {
    BridgeError::LookupFormat {
        path: path.display().to_string(),
        source,
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Run `f` while holding an exclusive advisory lock for `path`.
///
/// The lock lives on a sidecar file so that rewrites that replace the table
/// inode do not invalidate it. The lock is released when the guard file is
/// closed, even if `f` errors.
pub fn with_exclusive_lock<R>(
    path: &Path,
    f: impl FnOnce() -> Result<R, BridgeError>,
) -> Result<R, BridgeError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| io_err(path, e))?;
        }
    }

    let guard = OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path(path))
        .map_err(|e| io_err(path, e))?;
    guard.lock_exclusive().map_err(|e| io_err(path, e))?;

    let result = f();

    let _ = fs2::FileExt::unlock(&guard);
    result
}

/// Read all rows of a lookup table. A missing file is an empty table.
pub fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, BridgeError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut reader = csv::Reader::from_reader(file);
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row.map_err(|e| format_err(path, e))?);
    }
    Ok(rows)
}

/// Replace the entire table with `rows` (header included), atomically.
///
/// Callers that are doing read-modify-write must wrap the whole cycle in
/// [`with_exclusive_lock`]; this function only guarantees that readers never
/// observe a half-written file.
pub fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| io_err(path, e))?;
        }
    }

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let file = File::create(&tmp).map_err(|e| io_err(path, e))?;
        let mut writer = csv::Writer::from_writer(file);
        if rows.is_empty() {
            // serde-derived headers only exist alongside a row; keep the
            // previous header line so the table stays a valid lookup.
            if let Some(header) = existing_header(path) {
                writer
                    .write_record(header.iter())
                    .map_err(|e| format_err(path, e))?;
            }
        }
        for row in rows {
            writer.serialize(row).map_err(|e| format_err(path, e))?;
        }
        writer.flush().map_err(|e| io_err(path, e))?;
    }

    fs::rename(&tmp, path).map_err(|e| io_err(path, e))
}

fn existing_header(path: &Path) -> Option<csv::StringRecord> {
    let file = File::open(path).ok()?;
    let mut reader = csv::Reader::from_reader(file);
    reader.headers().ok().cloned()
}

/// Append a single row, creating the file with a header row if needed.
pub fn append_row<T: Serialize>(path: &Path, row: &T) -> Result<(), BridgeError> {
    if !path.exists() {
        return write_rows(path, std::slice::from_ref(row));
    }

    let file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| io_err(path, e))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.serialize(row).map_err(|e| format_err(path, e))?;
    writer.flush().map_err(|e| io_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Row {
        ip: String,
        comment: String,
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<Row> = read_rows(&dir.path().join("absent.csv")).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        let rows = vec![
            Row {
                ip: "10.0.0.1".to_string(),
                comment: "gateway".to_string(),
            },
            Row {
                ip: "10.0.0.2".to_string(),
                comment: "dns".to_string(),
            },
        ];

        write_rows(&path, &rows).unwrap();
        let loaded: Vec<Row> = read_rows(&path).unwrap();
        assert_eq!(loaded, rows);

        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("ip,comment"));
    }

    #[test]
    fn append_creates_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");

        append_row(
            &path,
            &Row {
                ip: "1.1.1.1".to_string(),
                comment: "first".to_string(),
            },
        )
        .unwrap();
        append_row(
            &path,
            &Row {
                ip: "2.2.2.2".to_string(),
                comment: "second".to_string(),
            },
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("ip,comment").count(), 1);
        let loaded: Vec<Row> = read_rows(&path).unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn empty_rewrite_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        write_rows(
            &path,
            &[Row {
                ip: "1.1.1.1".to_string(),
                comment: "only".to_string(),
            }],
        )
        .unwrap();

        write_rows::<Row>(&path, &[]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), "ip,comment");
        let rows: Vec<Row> = read_rows(&path).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn lock_releases_between_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");

        let value = with_exclusive_lock(&path, || Ok(1)).unwrap();
        assert_eq!(value, 1);
        // A second acquisition after release must succeed.
        let value = with_exclusive_lock(&path, || Ok(2)).unwrap();
        assert_eq!(value, 2);
    }
}
