//! Append-only CSV audit ledgers.
//!
//! Two ledgers exist: the migration ledger (one row per transferred asset)
//! and the reconciliation ledger (one row per asset and collection touched by
//! reconcile, repair, restore or rewrite). Rows are never edited; a re-run
//! appends to the file if its header matches.
//!
//! Each append is serialized to a buffer first and written with a single
//! `write_all` followed by `sync_data`, so a crash can at worst leave one
//! truncated trailing line. Readers drop that line with a warning, and
//! writers cut it off before appending.

pub mod lock;

pub use lock::RunLock;

use crate::error::{RelayError, Result};
use crate::models::{AssetState, TransferOutcome, TransferStatus};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const MIGRATION_HEADER: [&str; 6] = [
    "identifier",
    "source_locator",
    "destination_locator",
    "status",
    "error",
    "downstream_docs_updated",
];

pub const RECONCILIATION_HEADER: [&str; 5] =
    ["identifier", "collection", "docs_found", "docs_updated", "notes"];

/// Leading notes tag of reconciliation rows written by a restore pass.
pub const RESTORE_NOTES_PREFIX: &str = "restore";

const LEGACY_MIGRATION_HEADER: [&str; 5] = ["public_id", "old_url", "new_url", "status", "error"];

const LEGACY_MIGRATION_WITH_DOCS_HEADER: [&str; 6] = [
    "public_id",
    "old_url",
    "new_url",
    "status",
    "error",
    "db_docs_updated",
];

/// Known ledger layouts, identified by their header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerSchema {
    Migration,
    Reconciliation,
    /// Written by earlier tooling; read-only.
    LegacyMigration,
    /// Written by earlier tooling; read-only.
    LegacyMigrationWithDocs,
}

impl LedgerSchema {
    pub fn header(&self) -> &'static [&'static str] {
        match self {
            LedgerSchema::Migration => &MIGRATION_HEADER,
            LedgerSchema::Reconciliation => &RECONCILIATION_HEADER,
            LedgerSchema::LegacyMigration => &LEGACY_MIGRATION_HEADER,
            LedgerSchema::LegacyMigrationWithDocs => &LEGACY_MIGRATION_WITH_DOCS_HEADER,
        }
    }

    /// Identify a header record.
    pub fn detect(header: &csv::StringRecord) -> Option<Self> {
        let fields: Vec<&str> = header.iter().map(str::trim).collect();
        [
            LedgerSchema::Migration,
            LedgerSchema::Reconciliation,
            LedgerSchema::LegacyMigration,
            LedgerSchema::LegacyMigrationWithDocs,
        ]
        .into_iter()
        .find(|schema| schema.header() == fields.as_slice())
    }

    pub fn is_migration(&self) -> bool {
        !matches!(self, LedgerSchema::Reconciliation)
    }
}

/// A row type with a fixed ledger layout.
pub trait LedgerRow: Serialize {
    const SCHEMA: LedgerSchema;
}

/// One transferred asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRow {
    pub identifier: String,
    pub source_locator: String,
    pub destination_locator: String,
    pub status: TransferStatus,
    pub error: String,
    /// `-1` when reconciliation raised an error.
    pub downstream_docs_updated: i64,
}

impl LedgerRow for MigrationRow {
    const SCHEMA: LedgerSchema = LedgerSchema::Migration;
}

impl MigrationRow {
    /// Transferred but nothing downstream was updated.
    pub fn needs_repair(&self) -> bool {
        self.status == TransferStatus::Ok && self.downstream_docs_updated == 0
    }

    pub fn is_ok(&self) -> bool {
        self.status == TransferStatus::Ok
    }
}

impl From<&TransferOutcome> for MigrationRow {
    fn from(outcome: &TransferOutcome) -> Self {
        Self {
            identifier: outcome.id.clone(),
            source_locator: outcome.source_locator.clone(),
            destination_locator: outcome.dest_locator.clone(),
            status: outcome.status,
            error: outcome.error.clone(),
            downstream_docs_updated: outcome.docs_updated,
        }
    }
}

/// One asset reconciled against one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationRow {
    pub identifier: String,
    /// Empty when nothing matched in any collection.
    pub collection: String,
    pub docs_found: u64,
    pub docs_updated: u64,
    pub notes: String,
}

impl ReconciliationRow {
    /// Rows written by a restore pass, which move references backwards.
    pub fn is_restore(&self) -> bool {
        self.notes
            .split(';')
            .next()
            .is_some_and(|head| head == RESTORE_NOTES_PREFIX)
    }
}

impl LedgerRow for ReconciliationRow {
    const SCHEMA: LedgerSchema = LedgerSchema::Reconciliation;
}

impl AssetState {
    /// Derive the lifecycle state of an asset from its ledger rows.
    pub fn from_rows(migration: &MigrationRow, repairs: &[ReconciliationRow]) -> Self {
        let state = AssetState::after_migration(migration.status, migration.downstream_docs_updated);
        let repaired: u64 = repairs
            .iter()
            .filter(|r| r.identifier == migration.identifier && !r.is_restore())
            .map(|r| r.docs_updated)
            .sum();
        state.after_repair(repaired)
    }
}

fn ledger_io(action: &str, path: &Path, err: std::io::Error) -> RelayError {
    RelayError::Io {
        message: format!("Failed to {} {}: {}", action, path.display(), err),
        path: Some(path.to_path_buf()),
        source: Some(err),
    }
}

fn encode_record<S: Serialize + ?Sized>(record: &S) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(Vec::new());
    writer.serialize(record)?;
    writer.into_inner().map_err(|e| RelayError::Csv {
        message: e.to_string(),
        source: None,
    })
}

/// Parse the first record of `bytes` as a header.
fn read_header(bytes: &[u8]) -> Result<Option<csv::StringRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut record = csv::StringRecord::new();
    if reader.read_record(&mut record)? {
        Ok(Some(record))
    } else {
        Ok(None)
    }
}

/// Append-only writer for one ledger file.
///
/// Safe to share between tasks; appends are serialized by an internal lock.
pub struct LedgerWriter<R> {
    path: PathBuf,
    file: Mutex<File>,
    _row: PhantomData<fn(&R)>,
}

impl<R: LedgerRow> LedgerWriter<R> {
    /// Open a ledger for appending.
    ///
    /// A missing or empty file gets the header. An existing file with the
    /// same header is resumed. Any other header is a `LedgerSchema` error;
    /// the file is left untouched.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| ledger_io("create directory", parent, e))?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| ledger_io("open", &path, e))?;

        let mut existing = Vec::new();
        file.read_to_end(&mut existing)
            .map_err(|e| ledger_io("read", &path, e))?;

        let expected = R::SCHEMA.header();
        if existing.iter().all(u8::is_ascii_whitespace) {
            if !existing.is_empty() {
                file.set_len(0).map_err(|e| ledger_io("truncate", &path, e))?;
                file.seek(SeekFrom::Start(0))
                    .map_err(|e| ledger_io("seek", &path, e))?;
            }
            let header = encode_record(expected)?;
            write_durable(&mut file, &header).map_err(|e| ledger_io("write header to", &path, e))?;
            info!("Created ledger {}", path.display());
        } else {
            let header = read_header(&existing)?.unwrap_or_default();
            if LedgerSchema::detect(&header) != Some(R::SCHEMA) {
                return Err(RelayError::LedgerSchema {
                    path,
                    header: header.iter().collect::<Vec<_>>().join(","),
                });
            }
            if existing.last() != Some(&b'\n') {
                // An unterminated quoted field would swallow every later append.
                let keep = existing
                    .iter()
                    .rposition(|b| *b == b'\n')
                    .map_or(0, |i| i + 1);
                warn!(
                    "Ledger {} ends with a truncated line; dropping {} trailing bytes",
                    path.display(),
                    existing.len() - keep
                );
                file.set_len(keep as u64)
                    .map_err(|e| ledger_io("truncate", &path, e))?;
                if keep == 0 {
                    let header = encode_record(expected)?;
                    write_durable(&mut file, &header)
                        .map_err(|e| ledger_io("write header to", &path, e))?;
                }
            }
            info!("Resuming ledger {}", path.display());
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            _row: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row and sync it to disk.
    pub fn append(&self, row: &R) -> Result<()> {
        let bytes = encode_record(row)?;
        let mut file = self.file.lock().map_err(|_| RelayError::Io {
            message: format!("Ledger {} lock poisoned", self.path.display()),
            path: Some(self.path.clone()),
            source: None,
        })?;
        write_durable(&mut file, &bytes).map_err(|e| ledger_io("append to", &self.path, e))?;
        debug!("Appended {} bytes to {}", bytes.len(), self.path.display());
        Ok(())
    }
}

fn write_durable(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_data()
}

/// Parsed ledger: schema plus complete records.
struct RawLedger {
    schema: LedgerSchema,
    records: Vec<(u64, csv::StringRecord)>,
}

fn read_raw(path: &Path) -> Result<RawLedger> {
    let bytes = fs::read(path).map_err(|e| ledger_io("read", path, e))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes.as_slice());

    let header = reader.headers()?.clone();
    let schema = LedgerSchema::detect(&header).ok_or_else(|| RelayError::LedgerSchema {
        path: path.to_path_buf(),
        header: header.iter().collect::<Vec<_>>().join(","),
    })?;
    let width = schema.header().len();

    let mut records = Vec::new();
    for result in reader.records() {
        match result {
            Ok(record) => {
                let line = record.position().map(|p| p.line()).unwrap_or(0);
                records.push((line, record));
            }
            Err(e) => warn!("Skipping unreadable row in {}: {}", path.display(), e),
        }
    }

    if !bytes.is_empty() && bytes.last() != Some(&b'\n') {
        if let Some((line, _)) = records.pop() {
            warn!(
                "Skipping truncated trailing row at {}:{}",
                path.display(),
                line
            );
        }
    }

    records.retain(|(line, record)| {
        let blank = record.len() == 1 && record.get(0).is_some_and(|f| f.trim().is_empty());
        if blank {
            return false;
        }
        if record.len() != width {
            warn!(
                "Skipping malformed row at {}:{} ({} fields, expected {})",
                path.display(),
                line,
                record.len(),
                width
            );
            return false;
        }
        true
    });

    Ok(RawLedger { schema, records })
}

fn parse_status(raw: &str) -> TransferStatus {
    if raw.trim().eq_ignore_ascii_case("ok") {
        TransferStatus::Ok
    } else {
        TransferStatus::Failed
    }
}

fn field(record: &csv::StringRecord, index: usize) -> String {
    record.get(index).unwrap_or_default().to_string()
}

fn parse_count<T: std::str::FromStr + Default>(raw: &str) -> Option<T> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(T::default());
    }
    raw.parse().ok()
}

/// Read a migration ledger, current or legacy layout.
pub fn read_migration_ledger(path: impl AsRef<Path>) -> Result<Vec<MigrationRow>> {
    let path = path.as_ref();
    let raw = read_raw(path)?;
    if !raw.schema.is_migration() {
        return Err(RelayError::LedgerSchema {
            path: path.to_path_buf(),
            header: RECONCILIATION_HEADER.join(","),
        });
    }

    let mut rows = Vec::with_capacity(raw.records.len());
    for (line, record) in raw.records {
        let docs = match raw.schema {
            LedgerSchema::LegacyMigration => Some(0),
            _ => parse_count::<i64>(record.get(5).unwrap_or_default()),
        };
        let Some(downstream_docs_updated) = docs else {
            warn!("Skipping row with invalid docs count at {}:{}", path.display(), line);
            continue;
        };
        rows.push(MigrationRow {
            identifier: field(&record, 0),
            source_locator: field(&record, 1),
            destination_locator: field(&record, 2),
            status: parse_status(record.get(3).unwrap_or_default()),
            error: field(&record, 4),
            downstream_docs_updated,
        });
    }
    debug!("Read {} migration rows from {}", rows.len(), path.display());
    Ok(rows)
}

/// Read a reconciliation ledger.
pub fn read_reconciliation_ledger(path: impl AsRef<Path>) -> Result<Vec<ReconciliationRow>> {
    let path = path.as_ref();
    let raw = read_raw(path)?;
    if raw.schema != LedgerSchema::Reconciliation {
        return Err(RelayError::LedgerSchema {
            path: path.to_path_buf(),
            header: raw.schema.header().join(","),
        });
    }

    let mut rows = Vec::with_capacity(raw.records.len());
    for (line, record) in raw.records {
        let (Some(docs_found), Some(docs_updated)) = (
            parse_count::<u64>(record.get(2).unwrap_or_default()),
            parse_count::<u64>(record.get(3).unwrap_or_default()),
        ) else {
            warn!("Skipping row with invalid counts at {}:{}", path.display(), line);
            continue;
        };
        rows.push(ReconciliationRow {
            identifier: field(&record, 0),
            collection: field(&record, 1),
            docs_found,
            docs_updated,
            notes: field(&record, 4),
        });
    }
    Ok(rows)
}
