//! Archive container I/O.
//!
//! An archive is a zip file:
//!
//! ```text
//! manifest.json          format version, source schema version, table list
//! tables/<name>.jsonl    line 1: column names; then one JSON array per row
//! ```
//!
//! Entries carry a fixed timestamp so that the same data always produces
//! the same bytes. The file itself is written atomically.

use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};

use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::archive::hash::sha256_hex;
use crate::archive::types::{
    BackupArchive, Column, FORMAT_VERSION, MANIFEST_ENTRY, Manifest, TableData, TableManifest,
    Value, table_entry,
};
use crate::error::{Error, Result};

/// Write content to a file atomically.
///
/// This function:
/// 1. Writes content to a uniquely named temporary file next to the target
/// 2. Calls `fsync` to ensure data is on disk
/// 3. Atomically renames the temp file to the target path
///
/// If any step fails, the original file (if any) remains untouched.
///
/// # Errors
///
/// Returns an error if any file operation fails.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let temp_path = PathBuf::from(temp_name);

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(content)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }

    Ok(())
}

/// Serialize a table as JSONL: a header line of column names, then rows.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_table(table: &TableData) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let header: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
    serde_json::to_writer(&mut out, &header)?;
    out.push(b'\n');

    for row in &table.rows {
        let cells: Vec<serde_json::Value> = row
            .iter()
            .zip(&table.columns)
            .map(|(value, column)| value.to_cell(column.kind))
            .collect();
        serde_json::to_writer(&mut out, &cells)?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Parse a JSONL table payload against its manifest entry.
///
/// # Errors
///
/// Returns `InvalidArchive` naming the entry and line for a header that
/// disagrees with the manifest, a malformed line, or a cell that does not
/// fit its column.
pub fn decode_table(entry: &TableManifest, bytes: &[u8]) -> Result<Vec<Vec<Value>>> {
    let name = table_entry(&entry.name);
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::invalid_archive(format!("{name}: not valid UTF-8")))?;

    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let Some((_, header_line)) = lines.next() else {
        return Err(Error::invalid_archive(format!("{name}: missing header line")));
    };
    let header: Vec<String> = serde_json::from_str(header_line)
        .map_err(|e| Error::invalid_archive(format!("{name} line 1: {e}")))?;
    let expected: Vec<&str> = entry.columns.iter().map(|c| c.name.as_str()).collect();
    if header != expected {
        return Err(Error::invalid_archive(format!(
            "{name}: header {header:?} does not match manifest columns {expected:?}"
        )));
    }

    let mut rows = Vec::with_capacity(entry.row_count);
    for (idx, line) in lines {
        let line_num = idx + 1;
        let cells: Vec<serde_json::Value> = serde_json::from_str(line)
            .map_err(|e| Error::invalid_archive(format!("{name} line {line_num}: {e}")))?;
        if cells.len() != entry.columns.len() {
            return Err(Error::invalid_archive(format!(
                "{name} line {line_num}: expected {} values, found {}",
                entry.columns.len(),
                cells.len()
            )));
        }
        rows.push(decode_row(&name, line_num, &entry.columns, &cells)?);
    }
    Ok(rows)
}

fn decode_row(
    name: &str,
    line_num: usize,
    columns: &[Column],
    cells: &[serde_json::Value],
) -> Result<Vec<Value>> {
    columns
        .iter()
        .zip(cells)
        .map(|(column, cell)| {
            Value::from_json(cell, column.kind).ok_or_else(|| {
                Error::invalid_archive(format!(
                    "{name} line {line_num}: value {cell} does not fit column {}",
                    column.name
                ))
            })
        })
        .collect()
}

impl BackupArchive {
    /// Serialize the archive into zip bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or compression fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut payloads = Vec::with_capacity(self.tables.len());
        let mut tables = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            let payload = encode_table(table)?;
            tables.push(TableManifest {
                name: table.name.clone(),
                columns: table.columns.clone(),
                row_count: table.rows.len(),
                sha256: sha256_hex(&payload),
            });
            payloads.push(payload);
        }

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            source_schema_version: self.source_schema_version.clone(),
            generated_at: self.generated_at,
            tables,
        };

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default());

        zip.start_file(MANIFEST_ENTRY, options)?;
        zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())?;

        for (table, payload) in manifest.tables.iter().zip(&payloads) {
            zip.start_file(table_entry(&table.name), options)?;
            zip.write_all(payload)?;
        }

        Ok(zip.finish()?.into_inner())
    }

    /// Write the archive to `path` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or any file operation fails.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        atomic_write(path, &self.to_bytes()?)
    }

    /// Read and validate an archive file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArchive` for an unknown format version, a missing
    /// entry, a hash or row count mismatch, or a malformed payload, and
    /// `Zip` if the file is not a zip container.
    pub fn read_from(path: &Path) -> Result<Self> {
        let mut zip = ZipArchive::new(File::open(path)?)?;

        let manifest: Manifest = serde_json::from_slice(&read_entry(&mut zip, MANIFEST_ENTRY)?)
            .map_err(|e| Error::invalid_archive(format!("{MANIFEST_ENTRY}: {e}")))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(Error::invalid_archive(format!(
                "unsupported format version {} (expected {FORMAT_VERSION})",
                manifest.format_version
            )));
        }

        let mut tables: Vec<TableData> = Vec::with_capacity(manifest.tables.len());
        for entry in &manifest.tables {
            if tables.iter().any(|t| t.name == entry.name) {
                return Err(Error::invalid_archive(format!(
                    "table {} listed twice",
                    entry.name
                )));
            }

            let payload = read_entry(&mut zip, &table_entry(&entry.name))?;
            let actual = sha256_hex(&payload);
            if actual != entry.sha256 {
                return Err(Error::invalid_archive(format!(
                    "{}: content hash mismatch",
                    table_entry(&entry.name)
                )));
            }

            let rows = decode_table(entry, &payload)?;
            if rows.len() != entry.row_count {
                return Err(Error::invalid_archive(format!(
                    "{}: manifest lists {} rows, payload has {}",
                    table_entry(&entry.name),
                    entry.row_count,
                    rows.len()
                )));
            }

            tables.push(TableData {
                name: entry.name.clone(),
                columns: entry.columns.clone(),
                rows,
            });
        }

        Ok(Self {
            source_schema_version: manifest.source_schema_version,
            generated_at: manifest.generated_at,
            tables,
        })
    }
}

fn read_entry<R: Read + Seek>(zip: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut entry = match zip.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => {
            return Err(Error::invalid_archive(format!("missing entry {name}")));
        }
        Err(e) => return Err(e.into()),
    };
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::types::ColumnType;
    use crate::migrate::SchemaVersion;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn sample() -> BackupArchive {
        BackupArchive {
            source_schema_version: SchemaVersion::parse("004").unwrap(),
            generated_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            tables: vec![TableData {
                name: "decks".to_string(),
                columns: vec![
                    Column {
                        name: "id".to_string(),
                        kind: ColumnType::Integer,
                        nullable: false,
                    },
                    Column {
                        name: "name".to_string(),
                        kind: ColumnType::Text,
                        nullable: false,
                    },
                    Column {
                        name: "archived".to_string(),
                        kind: ColumnType::Boolean,
                        nullable: false,
                    },
                ],
                rows: vec![
                    vec![
                        Value::Integer(1),
                        Value::Text("Blue-Eyes".to_string()),
                        Value::Bool(false),
                    ],
                    vec![
                        Value::Integer(2),
                        Value::Text("Line\nbreak".to_string()),
                        Value::Bool(true),
                    ],
                ],
            }],
        }
    }

    /// Rewrite one zip entry, keeping the others.
    fn rewrite_entry(path: &Path, target: &str, content: &[u8]) {
        let mut zip = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entries = Vec::new();
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).unwrap();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).unwrap();
            entries.push((entry.name().to_string(), bytes));
        }

        let mut out = ZipWriter::new(File::create(path).unwrap());
        for (name, bytes) in entries {
            out.start_file(name.as_str(), SimpleFileOptions::default())
                .unwrap();
            if name == target {
                out.write_all(content).unwrap();
            } else {
                out.write_all(&bytes).unwrap();
            }
        }
        out.finish().unwrap();
    }

    #[test]
    fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("backup.zip");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_encode_table_layout() {
        let archive = sample();
        let text = String::from_utf8(encode_table(&archive.tables[0]).unwrap()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], r#"["id","name","archived"]"#);
        assert_eq!(lines[1], r#"[1,"Blue-Eyes",false]"#);
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_same_archive_same_bytes() {
        let archive = sample();
        assert_eq!(archive.to_bytes().unwrap(), archive.to_bytes().unwrap());
    }

    #[test]
    fn test_write_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup.zip");
        let archive = sample();

        archive.write_to(&path).unwrap();
        let back = BackupArchive::read_from(&path).unwrap();

        assert_eq!(back, archive);
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup.zip");
        sample().write_to(&path).unwrap();

        rewrite_entry(
            &path,
            "tables/decks.jsonl",
            b"[\"id\",\"name\",\"archived\"]\n[1,\"Exodia\",false]\n[2,\"x\",true]\n",
        );

        let err = BackupArchive::read_from(&path).unwrap_err();
        assert!(
            matches!(err, Error::InvalidArchive { ref reason } if reason.contains("hash mismatch"))
        );
    }

    #[test]
    fn test_unknown_format_version_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup.zip");
        sample().write_to(&path).unwrap();

        let mut manifest: serde_json::Value = {
            let mut zip = ZipArchive::new(File::open(&path).unwrap()).unwrap();
            serde_json::from_slice(&read_entry(&mut zip, MANIFEST_ENTRY).unwrap()).unwrap()
        };
        manifest["format_version"] = serde_json::json!(99);
        rewrite_entry(&path, MANIFEST_ENTRY, manifest.to_string().as_bytes());

        let err = BackupArchive::read_from(&path).unwrap_err();
        assert!(
            matches!(err, Error::InvalidArchive { ref reason } if reason.contains("format version"))
        );
    }

    #[test]
    fn test_decode_reports_line_number() {
        let archive = sample();
        let entry = TableManifest {
            name: "decks".to_string(),
            columns: archive.tables[0].columns.clone(),
            row_count: 2,
            sha256: String::new(),
        };
        let payload = b"[\"id\",\"name\",\"archived\"]\n[1,\"a\",false]\n[2,\"b\"]\n";

        let err = decode_table(&entry, payload).unwrap_err();
        assert!(matches!(err, Error::InvalidArchive { ref reason } if reason.contains("line 3")));
    }

    #[test]
    fn test_not_a_zip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup.zip");
        fs::write(&path, b"definitely not a zip").unwrap();

        assert!(matches!(
            BackupArchive::read_from(&path),
            Err(Error::Zip(_))
        ));
    }
}
