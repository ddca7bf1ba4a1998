use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::Result;
use assert_cmd::Command;
use dossier_lib::model::RecordBatch;
use dossier_lib::report::verify_checksum;
use dossier_lib::restore::lock::lock_path_for;
use dossier_lib::restore::RestoreLock;
use serde_json::Value;
use tempfile::tempdir;

#[path = "util.rs"]
mod util;

use util::*;

fn dossier() -> Result<Command> {
    let mut cmd = Command::cargo_bin("dossier")?;
    cmd.env_remove("DOSSIER_CONFIG").env("DOSSIER_LOG", "off");
    Ok(cmd)
}

fn describe(output: &Output) -> String {
    format!(
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn restore(package: &Path, db: &Path, reports: &Path, extra: &[&str]) -> Result<Output> {
    Ok(dossier()?
        .arg("restore-from-package")
        .arg(package)
        .arg("--db")
        .arg(db)
        .arg("--report-dir")
        .arg(reports)
        .args(extra)
        .output()?)
}

async fn reopen(path: &Path) -> Result<sqlx::SqlitePool> {
    dossier_lib::db::open_sqlite_pool(path, false).await
}

/// Destination where the role `editor` exists twice.
async fn ambiguous_fixture(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let db = dir.join("dest.db");
    let pool = create_store(&db).await?;
    sqlx::query("INSERT INTO roles (name) VALUES ('editor'), ('editor')")
        .execute(&pool)
        .await?;
    pool.close().await;

    let package = package(vec![
        RecordBatch::new("accounts", vec![account(1, "alice")]),
        RecordBatch::new("memberships", vec![membership(1, "alice", "editor")]),
    ]);
    let path = package.write_archive(dir.join("ambiguous.zip"))?;
    Ok((db, path))
}

#[tokio::test]
async fn backup_verify_restore_round_trip() -> Result<()> {
    let tmp = tempdir()?;
    let source_db = tmp.path().join("source.db");
    let source = create_store(&source_db).await?;
    seed_source(&source).await?;
    source.close().await;

    let dest_db = tmp.path().join("dest.db");
    let dest = create_store(&dest_db).await?;
    seed_destination(&dest).await?;
    dest.close().await;

    let package_path = tmp.path().join("nightly.zip");
    let output = dossier()?
        .args(["create-backup", "--label", "nightly", "--db"])
        .arg(&source_db)
        .arg("--output")
        .arg(&package_path)
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));
    assert!(package_path.exists());

    let output = dossier()?
        .args(["verify-package", "--json"])
        .arg(&package_path)
        .output()?;
    assert!(output.status.success(), "{}", describe(&output));
    let verified: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(verified["verified"], Value::Bool(true));
    assert_eq!(verified["summary"]["totalRecords"], 11);

    let reports = tmp.path().join("reports");
    let output = restore(&package_path, &dest_db, &reports, &["--format", "structured"])?;
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));

    let report: Value = serde_json::from_slice(&output.stdout)?;
    assert!(verify_checksum(&report));
    assert_eq!(report["status"], "completed");
    assert_eq!(report["totals"]["inserted"], 11);

    let written: Vec<_> = fs::read_dir(&reports)?.collect::<std::io::Result<_>>()?;
    assert_eq!(written.len(), 1);
    let on_disk: Value = serde_json::from_slice(&fs::read(written[0].path())?)?;
    assert_eq!(on_disk["report"], report);

    let dest = reopen(&dest_db).await?;
    assert_eq!(membership_pairs(&dest).await.len(), 2);
    dest.close().await;
    Ok(())
}

#[tokio::test]
async fn corrupted_package_exits_with_integrity_code() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("dest.db");
    create_store(&db).await?.close().await;

    let path = package(vec![RecordBatch::new(
        "accounts",
        vec![account(1, "alice"), account(2, "bob")],
    )])
    .write_archive(tmp.path().join("backup.zip"))?;
    let mut bytes = fs::read(&path)?;
    let offset = {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.clone()))?;
        let entry = archive.by_name("data/accounts.jsonl")?;
        (entry.data_start() + entry.compressed_size() / 2) as usize
    };
    bytes[offset] ^= 0xff;
    fs::write(&path, &bytes)?;

    let output = dossier()?.arg("verify-package").arg(&path).output()?;
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));

    let output = restore(&path, &db, &tmp.path().join("reports"), &[])?;
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    assert!(!tmp.path().join("reports").exists());

    let pool = reopen(&db).await?;
    assert_eq!(count(&pool, "accounts").await, 0);
    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn best_effort_restore_with_failures_exits_partial() -> Result<()> {
    let tmp = tempdir()?;
    let (db, path) = ambiguous_fixture(tmp.path()).await?;

    let output = restore(&path, &db, &tmp.path().join("reports"), &["--best-effort"])?;
    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("partial"), "{stdout}");

    let pool = reopen(&db).await?;
    assert_eq!(count(&pool, "accounts").await, 1);
    assert_eq!(count(&pool, "memberships").await, 0);
    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn dry_run_with_failures_exits_partial_and_writes_nothing() -> Result<()> {
    let tmp = tempdir()?;
    let (db, path) = ambiguous_fixture(tmp.path()).await?;

    let output = restore(&path, &db, &tmp.path().join("reports"), &["--dry-run"])?;
    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));

    let pool = reopen(&db).await?;
    assert_eq!(count(&pool, "accounts").await, 0);
    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn unresolvable_reference_in_full_mode_is_fatal() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("dest.db");
    create_store(&db).await?.close().await;
    let path = package(vec![
        RecordBatch::new("accounts", vec![account(1, "alice")]),
        RecordBatch::new("memberships", vec![membership(1, "alice", "ghost")]),
    ])
    .write_archive(tmp.path().join("backup.zip"))?;

    let output = restore(&path, &db, &tmp.path().join("reports"), &[])?;
    assert_eq!(output.status.code(), Some(3), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("memberships"));

    let pool = reopen(&db).await?;
    assert_eq!(count(&pool, "accounts").await, 1);
    assert_eq!(count(&pool, "memberships").await, 0);
    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn restore_into_a_locked_destination_is_refused() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("dest.db");
    create_store(&db).await?.close().await;
    let path = package(vec![RecordBatch::new("accounts", vec![account(1, "alice")])])
        .write_archive(tmp.path().join("backup.zip"))?;

    let held = RestoreLock::acquire("cli-lock-holder", Some(&lock_path_for(&db)))?;
    let output = restore(&path, &db, &tmp.path().join("reports"), &[])?;
    assert_eq!(output.status.code(), Some(3), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("already being restored"));
    drop(held);

    let output = restore(&path, &db, &tmp.path().join("reports"), &[])?;
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    Ok(())
}
