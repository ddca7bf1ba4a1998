use std::fs;
use std::io::Cursor;

use anyhow::Result;
use dossier_lib::keys::NaturalKeyRegistry;
use dossier_lib::model::{FieldValue, Record, RecordBatch};
use dossier_lib::package::{dry_run_summarize, BackupPackage, IntegrityError, IssueKind, LoadOptions};
use proptest::prelude::*;
use tempfile::tempdir;

#[path = "util.rs"]
mod util;

use util::*;

/// Flips one byte in the middle of `entry`'s compressed data.
fn flip_inside(bytes: &mut [u8], entry: &str) {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
    let file = archive.by_name(entry).unwrap();
    let offset = (file.data_start() + file.compressed_size() / 2) as usize;
    bytes[offset] ^= 0xff;
}

#[test]
fn one_flipped_byte_rejects_the_whole_package() -> Result<()> {
    let dir = tempdir()?;
    let package = package(vec![
        RecordBatch::new("accounts", vec![account(1, "alice"), account(2, "bob")]),
        RecordBatch::new("memberships", vec![membership(1, "alice", "admin")]),
    ]);
    let path = package.write_archive(dir.path().join("backup.zip"))?;

    let mut bytes = fs::read(&path)?;
    flip_inside(&mut bytes, "data/memberships.jsonl");
    fs::write(&path, &bytes)?;

    let err = BackupPackage::load(&path).unwrap_err();
    assert!(
        matches!(
            err,
            IntegrityError::Archive(_) | IntegrityError::BatchChecksum { .. }
        ),
        "unexpected error: {err}"
    );
    Ok(())
}

#[tokio::test]
async fn corrupted_package_restores_zero_records() -> Result<()> {
    let dir = tempdir()?;
    let dest = create_store(&dir.path().join("dest.db")).await?;
    let package = package(vec![RecordBatch::new("accounts", vec![account(1, "alice")])]);
    let path = package.write_archive(dir.path().join("backup.zip"))?;

    let mut bytes = fs::read(&path)?;
    flip_inside(&mut bytes, "manifest.json");
    fs::write(&path, &bytes)?;

    assert!(BackupPackage::load(&path).is_err());
    assert_eq!(count(&dest, "accounts").await, 0);
    Ok(())
}

#[test]
fn truncated_file_is_an_integrity_error() -> Result<()> {
    let dir = tempdir()?;
    let package = package(vec![RecordBatch::new("accounts", vec![account(1, "alice")])]);
    let path = package.write_archive(dir.path().join("backup.zip"))?;
    let bytes = fs::read(&path)?;
    fs::write(&path, &bytes[..bytes.len() - 10])?;

    let err = BackupPackage::load(&path).unwrap_err();
    assert_eq!(err.kind(), "archive");
    Ok(())
}

#[test]
fn packages_from_newer_minimums_are_refused() {
    let bytes = package(vec![RecordBatch::new("accounts", vec![account(1, "alice")])])
        .to_archive_bytes()
        .unwrap();
    let options = LoadOptions {
        min_app_version: semver::Version::new(9, 0, 0),
    };
    let err = BackupPackage::from_archive_bytes(&bytes, &options).unwrap_err();
    assert!(matches!(err, IntegrityError::AppVersionTooOld { .. }));
}

#[test]
fn offline_summary_flags_references_to_outside_records() {
    let package = package(vec![
        RecordBatch::new("accounts", vec![account(1, "alice")]),
        RecordBatch::new("memberships", vec![membership(1, "alice", "admin")]),
    ]);
    let summary = dry_run_summarize(&package, &NaturalKeyRegistry::with_defaults());
    assert_eq!(summary.total_records, 2);
    assert!(summary.is_clean());
    let memberships = &summary.types["memberships"];
    assert_eq!(memberships.external_refs, 1);
}

#[test]
fn offline_summary_flags_records_missing_declared_key_fields() {
    let package = package(vec![RecordBatch::new(
        "memberships",
        vec![
            Record::new(Some(1)).with_field("account_id", account_ref("alice").into()),
            membership(2, "bob", "editor").with_field("role_id", FieldValue::Null),
            membership(3, "carol", "admin"),
        ],
    )]);
    let summary = dry_run_summarize(&package, &NaturalKeyRegistry::with_defaults());
    let memberships = &summary.types["memberships"];
    assert_eq!(memberships.incomplete_keys, 2);
    let flagged: Vec<_> = summary
        .issues
        .iter()
        .filter(|i| i.kind == IssueKind::IncompleteKey)
        .map(|i| (i.source_id, i.target.clone()))
        .collect();
    assert_eq!(
        flagged,
        vec![
            (Some(1), "memberships#1 lacks role_id".to_string()),
            (Some(2), "memberships#2 lacks role_id".to_string()),
        ]
    );
    assert!(summary.render_human().contains("Incomplete"));
}

#[test]
fn offline_summary_flags_duplicate_keys_within_a_batch() {
    let package = package(vec![
        RecordBatch::new(
            "accounts",
            vec![account(1, "alice"), account(2, "bob"), account(3, "alice")],
        ),
        RecordBatch::new("roles", vec![Record::new(Some(1)).with_field("name", FieldValue::text("alice"))]),
    ]);
    let summary = dry_run_summarize(&package, &NaturalKeyRegistry::with_defaults());
    assert_eq!(summary.types["accounts"].duplicate_keys, 1);
    assert_eq!(summary.types["roles"].duplicate_keys, 0);
    let duplicates: Vec<_> = summary
        .issues
        .iter()
        .filter(|i| i.kind == IssueKind::DuplicateKey)
        .collect();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0].source_id, Some(3));
    assert!(duplicates[0].target.contains("first at #1"), "{}", duplicates[0].target);
}

fn arb_account() -> impl Strategy<Value = (String, Option<String>, Option<i64>)> {
    (
        "[a-z][a-z0-9_.]{0,11}",
        proptest::option::of("[a-z]{1,8}@example\\.com"),
        proptest::option::of(-1000i64..1000),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn sealed_packages_load_back_unchanged(accounts in proptest::collection::vec(arb_account(), 0..12)) {
        let records: Vec<Record> = accounts
            .into_iter()
            .enumerate()
            .map(|(idx, (username, email, score))| {
                let mut record = account(idx as i64 + 1, &username);
                if let Some(email) = email {
                    record = record.with_field("email", FieldValue::text(email));
                }
                if let Some(score) = score {
                    record = record.with_field("score", FieldValue::Integer(score));
                }
                record
            })
            .collect();
        let sealed = package(vec![RecordBatch::new("accounts", records)]);
        let bytes = sealed.to_archive_bytes().unwrap();
        let loaded = BackupPackage::from_archive_bytes(&bytes, &LoadOptions::default()).unwrap();
        prop_assert_eq!(loaded.batches(), sealed.batches());
        prop_assert_eq!(loaded.to_archive_bytes().unwrap(), bytes);
    }
}
