use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use semver::Version;
use thiserror::Error;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::manifest::{
    batch_entry_name, is_valid_record_type, min_supported_app_version, sha256_hex, ChecksumSet,
    Manifest, CHECKSUMS_ENTRY, MANIFEST_ENTRY, SUPPORTED_FORMAT_VERSIONS,
};
use super::BackupPackage;
use crate::model::{Record, RecordBatch};

const PARTIAL_SUFFIX: &str = "partial";

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("package archive is unreadable or truncated: {0}")]
    Archive(String),
    #[error("package entry missing: {0}")]
    MissingEntry(String),
    #[error("unexpected package entry: {0}")]
    UnexpectedEntry(String),
    #[error("invalid checksum file: {0}")]
    ChecksumFile(String),
    #[error("manifest checksum mismatch: expected {expected}, found {actual}")]
    ManifestChecksum { expected: String, actual: String },
    #[error("batch {record_type} checksum mismatch: expected {expected}, found {actual}")]
    BatchChecksum {
        record_type: String,
        expected: String,
        actual: String,
    },
    #[error("failed to parse manifest.json: {0}")]
    ManifestParse(String),
    #[error("unsupported package format version {found} (supported: {supported:?})")]
    UnsupportedFormat {
        found: u32,
        supported: &'static [u32],
    },
    #[error("invalid app version {0:?} in manifest")]
    InvalidAppVersion(String),
    #[error("package app version {found} is older than the minimum supported {minimum}")]
    AppVersionTooOld { found: Version, minimum: Version },
    #[error("invalid record type name {0:?}")]
    InvalidRecordType(String),
    #[error("duplicate batch for record type {0}")]
    DuplicateBatch(String),
    #[error("batch {record_type} declares {expected} records but carries {actual}")]
    CountMismatch {
        record_type: String,
        expected: u64,
        actual: u64,
    },
    #[error("batch {record_type} line {line} is malformed: {reason}")]
    MalformedBatch {
        record_type: String,
        line: usize,
        reason: String,
    },
    #[error("failed to encode batch {record_type}: {reason}")]
    Encode { record_type: String, reason: String },
    #[error("failed to read package {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl IntegrityError {
    /// Stable short name, used as error context.
    pub fn kind(&self) -> &'static str {
        match self {
            IntegrityError::Archive(_) => "archive",
            IntegrityError::MissingEntry(_) => "missing_entry",
            IntegrityError::UnexpectedEntry(_) => "unexpected_entry",
            IntegrityError::ChecksumFile(_) => "checksum_file",
            IntegrityError::ManifestChecksum { .. } => "manifest_checksum",
            IntegrityError::BatchChecksum { .. } => "batch_checksum",
            IntegrityError::ManifestParse(_) => "manifest_parse",
            IntegrityError::UnsupportedFormat { .. } => "unsupported_format",
            IntegrityError::InvalidAppVersion(_) => "invalid_app_version",
            IntegrityError::AppVersionTooOld { .. } => "app_version_too_old",
            IntegrityError::InvalidRecordType(_) => "invalid_record_type",
            IntegrityError::DuplicateBatch(_) => "duplicate_batch",
            IntegrityError::CountMismatch { .. } => "count_mismatch",
            IntegrityError::MalformedBatch { .. } => "malformed_batch",
            IntegrityError::Encode { .. } => "encode",
            IntegrityError::Io { .. } => "io",
        }
    }
}

fn archive_err(err: impl std::fmt::Display) -> IntegrityError {
    IntegrityError::Archive(err.to_string())
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub min_app_version: Version,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            min_app_version: min_supported_app_version(),
        }
    }
}

pub(crate) fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>, IntegrityError> {
    let mut out = Vec::new();
    for record in &batch.records {
        if let Some((field, _)) = record
            .fields
            .iter()
            .find(|(_, value)| matches!(value, crate::model::FieldValue::Real(v) if !v.is_finite()))
        {
            return Err(IntegrityError::Encode {
                record_type: batch.record_type.clone(),
                reason: format!("field {field} holds a non-finite number"),
            });
        }
        serde_json::to_writer(&mut out, record).map_err(|err| IntegrityError::Encode {
            record_type: batch.record_type.clone(),
            reason: err.to_string(),
        })?;
        out.push(b'\n');
    }
    Ok(out)
}

fn decode_batch(record_type: &str, payload: &[u8]) -> Result<Vec<Record>, IntegrityError> {
    let text = std::str::from_utf8(payload).map_err(|err| IntegrityError::MalformedBatch {
        record_type: record_type.to_string(),
        line: 0,
        reason: err.to_string(),
    })?;
    let mut records = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Record =
            serde_json::from_str(line).map_err(|err| IntegrityError::MalformedBatch {
                record_type: record_type.to_string(),
                line: idx + 1,
                reason: err.to_string(),
            })?;
        records.push(record);
    }
    Ok(records)
}

impl BackupPackage {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IntegrityError> {
        Self::load_with(path, &LoadOptions::default())
    }

    pub fn load_with(path: impl AsRef<Path>, options: &LoadOptions) -> Result<Self, IntegrityError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| IntegrityError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let package = Self::from_archive_bytes(&bytes, options)?;
        tracing::info!(
            target: "dossier",
            event = "package_loaded",
            path = %path.display(),
            record_types = package.batches.len(),
            records = package.total_records()
        );
        Ok(package)
    }

    /// Verifies every checksum before parsing a single batch; a package is
    /// either returned fully verified or not at all.
    pub fn from_archive_bytes(bytes: &[u8], options: &LoadOptions) -> Result<Self, IntegrityError> {
        let mut entries = read_entries(bytes)?;

        let checksum_bytes = entries
            .remove(CHECKSUMS_ENTRY)
            .ok_or_else(|| IntegrityError::MissingEntry(CHECKSUMS_ENTRY.into()))?;
        let checksum_text = std::str::from_utf8(&checksum_bytes)
            .map_err(|err| IntegrityError::ChecksumFile(err.to_string()))?;
        let checksums = ChecksumSet::parse(checksum_text)?;

        let manifest_bytes = entries
            .remove(MANIFEST_ENTRY)
            .ok_or_else(|| IntegrityError::MissingEntry(MANIFEST_ENTRY.into()))?;
        let actual = sha256_hex(&manifest_bytes);
        if actual != checksums.manifest {
            return Err(IntegrityError::ManifestChecksum {
                expected: checksums.manifest.clone(),
                actual,
            });
        }
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|err| IntegrityError::ManifestParse(err.to_string()))?;
        check_versions(&manifest, options)?;

        let mut seen = BTreeSet::new();
        let mut payloads = Vec::with_capacity(manifest.record_types.len());
        for record_type in &manifest.record_types {
            if !is_valid_record_type(record_type) {
                return Err(IntegrityError::InvalidRecordType(record_type.clone()));
            }
            if !seen.insert(record_type.clone()) {
                return Err(IntegrityError::DuplicateBatch(record_type.clone()));
            }
            let entry = batch_entry_name(record_type);
            let payload = entries
                .remove(&entry)
                .ok_or_else(|| IntegrityError::MissingEntry(entry.clone()))?;
            let expected = checksums.batches.get(record_type).ok_or_else(|| {
                IntegrityError::ChecksumFile(format!("no checksum for {entry}"))
            })?;
            let actual = sha256_hex(&payload);
            if &actual != expected {
                return Err(IntegrityError::BatchChecksum {
                    record_type: record_type.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
            payloads.push(payload);
        }
        if let Some(extra) = entries.keys().next() {
            return Err(IntegrityError::UnexpectedEntry(extra.clone()));
        }
        if let Some(extra) = checksums.batches.keys().find(|t| !seen.contains(*t)) {
            return Err(IntegrityError::ChecksumFile(format!(
                "checksum listed for {} which the manifest does not declare",
                batch_entry_name(extra)
            )));
        }

        let mut batches = Vec::with_capacity(payloads.len());
        for (record_type, payload) in manifest.record_types.iter().zip(&payloads) {
            let records = decode_batch(record_type, payload)?;
            let expected = manifest.count(record_type);
            if records.len() as u64 != expected {
                return Err(IntegrityError::CountMismatch {
                    record_type: record_type.clone(),
                    expected,
                    actual: records.len() as u64,
                });
            }
            batches.push(RecordBatch::new(record_type.clone(), records));
        }

        Ok(BackupPackage {
            manifest,
            manifest_bytes,
            batches,
            payloads,
            checksums,
        })
    }

    /// Deterministic zip: manifest, batches in manifest order, checksums.
    pub fn to_archive_bytes(&self) -> Result<Vec<u8>, IntegrityError> {
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

        zip.start_file(MANIFEST_ENTRY, options).map_err(archive_err)?;
        zip.write_all(&self.manifest_bytes).map_err(archive_err)?;
        for (batch, payload) in self.batches.iter().zip(&self.payloads) {
            zip.start_file(batch_entry_name(&batch.record_type), options)
                .map_err(archive_err)?;
            zip.write_all(payload).map_err(archive_err)?;
        }
        zip.start_file(CHECKSUMS_ENTRY, options).map_err(archive_err)?;
        zip.write_all(self.checksums.render().as_bytes())
            .map_err(archive_err)?;

        let cursor = zip.finish().map_err(archive_err)?;
        Ok(cursor.into_inner())
    }

    /// Writes next to `path` first and renames, so a crash never leaves a
    /// half-written package under the final name.
    pub fn write_archive(&self, path: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create package directory {}", parent.display()))?;
        }
        let bytes = self.to_archive_bytes()?;
        let partial = partial_path(path);
        fs::write(&partial, &bytes)
            .with_context(|| format!("write package {}", partial.display()))?;
        fs::rename(&partial, path).with_context(|| {
            format!("rename {} -> {}", partial.display(), path.display())
        })?;
        tracing::info!(
            target: "dossier",
            event = "package_written",
            path = %path.display(),
            bytes = bytes.len(),
            records = self.total_records()
        );
        Ok(path.to_path_buf())
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    path.with_file_name(name)
}

fn read_entries(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, IntegrityError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(archive_err)?;
    let mut entries = BTreeMap::new();
    for idx in 0..archive.len() {
        let mut file = archive.by_index(idx).map_err(archive_err)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|err| IntegrityError::Archive(format!("{name}: {err}")))?;
        if entries.insert(name.clone(), buf).is_some() {
            return Err(IntegrityError::UnexpectedEntry(format!("{name} (duplicate)")));
        }
    }
    Ok(entries)
}

fn check_versions(manifest: &Manifest, options: &LoadOptions) -> Result<(), IntegrityError> {
    if !SUPPORTED_FORMAT_VERSIONS.contains(&manifest.format_version) {
        return Err(IntegrityError::UnsupportedFormat {
            found: manifest.format_version,
            supported: SUPPORTED_FORMAT_VERSIONS,
        });
    }
    let found = Version::parse(&manifest.app_version)
        .map_err(|_| IntegrityError::InvalidAppVersion(manifest.app_version.clone()))?;
    if found < options.min_app_version {
        return Err(IntegrityError::AppVersionTooOld {
            found,
            minimum: options.min_app_version.clone(),
        });
    }
    Ok(())
}
