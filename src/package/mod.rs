//! The portable package: manifest, one batch per record type, and the
//! checksum envelope that protects both.

pub mod archive;
pub mod export;
pub mod manifest;
pub mod summary;

pub use archive::{IntegrityError, LoadOptions};
pub use export::{export, export_database, ExportError, ExportOptions, RecordSource, SqliteSource};
pub use manifest::{ChecksumSet, Manifest, FORMAT_VERSION};
pub use summary::{dry_run_summarize, IssueKind, PackageSummary, ReferenceIssue, TypeSummary};

use std::collections::BTreeSet;

use crate::model::RecordBatch;
use manifest::sha256_hex;

/// Immutable once sealed or loaded. Keeps the exact serialized bytes so a
/// loaded package re-archives byte for byte.
#[derive(Debug, Clone)]
pub struct BackupPackage {
    manifest: Manifest,
    manifest_bytes: Vec<u8>,
    batches: Vec<RecordBatch>,
    payloads: Vec<Vec<u8>>,
    checksums: ChecksumSet,
}

impl BackupPackage {
    /// Fills the manifest's type list and counts from `batches`, serializes
    /// everything and computes the checksums.
    pub fn seal(mut manifest: Manifest, batches: Vec<RecordBatch>) -> Result<Self, IntegrityError> {
        let mut seen = BTreeSet::new();
        manifest.record_types.clear();
        manifest.counts.clear();
        let mut checksums = ChecksumSet::default();
        let mut payloads = Vec::with_capacity(batches.len());
        for batch in &batches {
            if !manifest::is_valid_record_type(&batch.record_type) {
                return Err(IntegrityError::InvalidRecordType(batch.record_type.clone()));
            }
            if !seen.insert(batch.record_type.clone()) {
                return Err(IntegrityError::DuplicateBatch(batch.record_type.clone()));
            }
            let payload = archive::encode_batch(batch)?;
            checksums
                .batches
                .insert(batch.record_type.clone(), sha256_hex(&payload));
            manifest.record_types.push(batch.record_type.clone());
            manifest
                .counts
                .insert(batch.record_type.clone(), batch.len() as u64);
            payloads.push(payload);
        }

        let manifest_bytes =
            serde_json::to_vec_pretty(&manifest).map_err(|err| IntegrityError::Encode {
                record_type: manifest::MANIFEST_ENTRY.to_string(),
                reason: err.to_string(),
            })?;
        checksums.manifest = sha256_hex(&manifest_bytes);

        Ok(Self {
            manifest,
            manifest_bytes,
            batches,
            payloads,
            checksums,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn batch(&self, record_type: &str) -> Option<&RecordBatch> {
        self.batches.iter().find(|b| b.record_type == record_type)
    }

    pub fn checksums(&self) -> &ChecksumSet {
        &self.checksums
    }

    pub fn total_records(&self) -> usize {
        self.batches.iter().map(RecordBatch::len).sum()
    }
}
