//! Integrity report for one restore run: what happened to every record,
//! which strategy wrote it, and where its id went.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::keys::CacheStats;
use crate::package::manifest::sha256_hex;
use crate::restore::{
    Anomaly, BatchDisposition, BatchState, RecordStatus, RestoreMode, RestoreRun, RunStatus, StrategyAttempt,
    StrategyKind,
};

pub const REPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeCounts {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Written, then undone by a batch rollback.
    pub rolled_back: u64,
}

impl TypeCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.skipped + self.failed + self.rolled_back
    }

    fn add(&mut self, other: &TypeCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.rolled_back += other.rolled_back;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemapEntry {
    pub record_type: String,
    pub source_id: Option<i64>,
    pub natural_key: Option<String>,
    pub destination_id: i64,
    /// `None` when the record matched an existing row and nothing was written.
    pub strategy: Option<StrategyKind>,
    pub updated: bool,
    pub matched_existing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEntry {
    pub record_type: String,
    pub source_id: Option<i64>,
    pub natural_key: Option<String>,
    pub reason: String,
    pub attempts: Vec<StrategyAttempt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub record_type: String,
    pub state: BatchState,
    pub disposition: BatchDisposition,
    pub records: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub report_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub started_at: String,
    pub mode: RestoreMode,
    pub best_effort: bool,
    pub destination: String,
    pub status: RunStatus,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub totals: TypeCounts,
    pub types: BTreeMap<String, TypeCounts>,
    /// Records written per strategy.
    pub strategies: BTreeMap<StrategyKind, u64>,
    pub anomalies: BTreeMap<Anomaly, u64>,
    /// Every source id mapped to a destination row, written or matched.
    /// Empty for dry runs, whose ids never persist.
    pub remap: Vec<RemapEntry>,
    pub failures: Vec<FailureEntry>,
    pub batches: Vec<BatchSummary>,
    pub cache: CacheStats,
    /// sha256 of the report's canonical JSON with this field empty.
    pub checksum: String,
}

impl IntegrityReport {
    pub fn type_counts(&self, record_type: &str) -> TypeCounts {
        self.types.get(record_type).copied().unwrap_or_default()
    }

    pub fn strategy_count(&self, kind: StrategyKind) -> u64 {
        self.strategies.get(&kind).copied().unwrap_or(0)
    }

    pub fn anomaly_count(&self, anomaly: Anomaly) -> u64 {
        self.anomalies.get(&anomaly).copied().unwrap_or(0)
    }

    pub fn remap_for(&self, record_type: &str, source_id: i64) -> Option<&RemapEntry> {
        self.remap
            .iter()
            .find(|e| e.record_type == record_type && e.source_id == Some(source_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    Structured,
    Human,
}

pub fn summarize(run: &RestoreRun) -> Result<IntegrityReport, serde_json::Error> {
    let mut types: BTreeMap<String, TypeCounts> = BTreeMap::new();
    let mut strategies = BTreeMap::new();
    let mut anomalies = BTreeMap::new();
    let mut remap = Vec::new();
    let mut failures = Vec::new();
    let mut batches = Vec::with_capacity(run.batches.len() + 1);

    for batch in run.all_batches() {
        let rolled_back = matches!(batch.disposition, BatchDisposition::RolledBack(_));
        batches.push(BatchSummary {
            record_type: batch.record_type.clone(),
            state: batch.state,
            disposition: batch.disposition.clone(),
            records: batch.outcomes.len() as u64,
        });

        for outcome in &batch.outcomes {
            let counts = types.entry(outcome.record_type.clone()).or_default();
            for anomaly in outcome.all_anomalies() {
                *anomalies.entry(anomaly).or_insert(0u64) += 1;
            }
            match &outcome.status {
                status if status.wrote() && rolled_back => counts.rolled_back += 1,
                RecordStatus::Inserted => counts.inserted += 1,
                RecordStatus::Updated => counts.updated += 1,
                RecordStatus::SkippedDuplicate => counts.skipped += 1,
                RecordStatus::Failed(reason) => {
                    counts.failed += 1;
                    failures.push(FailureEntry {
                        record_type: outcome.record_type.clone(),
                        source_id: outcome.source_id,
                        natural_key: outcome.natural_key.clone(),
                        reason: reason.clone(),
                        attempts: outcome.attempts.clone(),
                    });
                }
            }
            let matched_existing = outcome.status == RecordStatus::SkippedDuplicate;
            if rolled_back || !(matched_existing || outcome.status.wrote()) {
                continue;
            }
            if !matched_existing {
                if let Some(kind) = outcome.strategy {
                    *strategies.entry(kind).or_insert(0u64) += 1;
                }
            }
            if let (Some(destination_id), false) = (outcome.destination_id, run.is_dry_run()) {
                remap.push(RemapEntry {
                    record_type: outcome.record_type.clone(),
                    source_id: outcome.source_id,
                    natural_key: outcome.natural_key.clone(),
                    destination_id,
                    strategy: if matched_existing { None } else { outcome.strategy },
                    updated: outcome.status == RecordStatus::Updated,
                    matched_existing,
                });
            }
        }
    }

    let mut totals = TypeCounts::default();
    for counts in types.values() {
        totals.add(counts);
    }

    let mut report = IntegrityReport {
        report_version: REPORT_VERSION,
        run_id: run.run_id.to_string(),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        started_at: run.started_at.clone(),
        mode: run.mode.clone(),
        best_effort: run.best_effort,
        destination: run.destination.clone(),
        status: run.status,
        exit_code: run.exit_code(),
        duration_ms: run.duration_ms,
        totals,
        types,
        strategies,
        anomalies,
        remap,
        failures,
        batches,
        cache: run.cache,
        checksum: String::new(),
    };
    report.checksum = body_checksum(serde_json::to_value(&report)?)?;
    Ok(report)
}

/// Checksum over the canonical (key-sorted) JSON with `checksum` blanked.
fn body_checksum(mut value: Value) -> Result<String, serde_json::Error> {
    if let Some(object) = value.as_object_mut() {
        object.insert("checksum".into(), Value::String(String::new()));
    }
    Ok(sha256_hex(&serde_json::to_vec(&value)?))
}

/// Checks a report read back as JSON against its own checksum.
pub fn verify_checksum(report: &Value) -> bool {
    let Some(expected) = report.get("checksum").and_then(Value::as_str) else {
        return false;
    };
    match body_checksum(report.clone()) {
        Ok(actual) => actual == expected,
        Err(_) => false,
    }
}

pub fn render(report: &IntegrityReport, format: ReportFormat) -> Result<String, serde_json::Error> {
    match format {
        ReportFormat::Structured => serde_json::to_string_pretty(report),
        ReportFormat::Human => Ok(render_human(report)),
    }
}

fn render_human(report: &IntegrityReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Restore {} ({}{}) {} in {} ms",
        report.run_id,
        report.mode.label(),
        if report.best_effort { ", best effort" } else { "" },
        report.status,
        report.duration_ms
    );
    let _ = writeln!(
        out,
        "{:<24} {:>8} {:>8} {:>8} {:>7} {:>11}",
        "Type", "Inserted", "Updated", "Skipped", "Failed", "Rolled back"
    );
    for (record_type, c) in &report.types {
        let _ = writeln!(
            out,
            "{:<24} {:>8} {:>8} {:>8} {:>7} {:>11}",
            record_type, c.inserted, c.updated, c.skipped, c.failed, c.rolled_back
        );
    }
    let t = &report.totals;
    let _ = writeln!(
        out,
        "{:<24} {:>8} {:>8} {:>8} {:>7} {:>11}",
        "total", t.inserted, t.updated, t.skipped, t.failed, t.rolled_back
    );

    if !report.strategies.is_empty() {
        let parts: Vec<String> = report
            .strategies
            .iter()
            .map(|(kind, count)| format!("{}={count}", kind.as_str()))
            .collect();
        let _ = writeln!(out, "Strategies: {}", parts.join(" "));
    }
    if !report.anomalies.is_empty() {
        let parts: Vec<String> = report
            .anomalies
            .iter()
            .map(|(anomaly, count)| format!("{anomaly:?}={count}"))
            .collect();
        let _ = writeln!(out, "Anomalies: {}", parts.join(" "));
    }
    for batch in &report.batches {
        if let BatchDisposition::RolledBack(reason) = &batch.disposition {
            let _ = writeln!(out, "Rolled back {}: {reason}", batch.record_type);
        }
    }
    if !report.failures.is_empty() {
        let _ = writeln!(out, "Failures:");
        for failure in &report.failures {
            let label = failure.natural_key.clone().unwrap_or_else(|| {
                format!(
                    "{}#{}",
                    failure.record_type,
                    failure
                        .source_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "?".into())
                )
            });
            let _ = writeln!(out, "  {label}: {}", failure.reason);
        }
    }
    let _ = writeln!(out, "Checksum: {}", report.checksum);
    out
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RestoreReportFile<'a> {
    package_path: String,
    report: &'a IntegrityReport,
}

/// Writes `restore-YYYYMMDD-HHMMSS-<suffix>.json` under `reports_dir`. The
/// random suffix keeps reports of runs in the same second apart.
pub fn write_report(reports_dir: &Path, package_path: &Path, report: &IntegrityReport) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .with_context(|| format!("create reports directory {}", reports_dir.display()))?;

    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    let random = uuid::Uuid::new_v4().as_simple().to_string();
    let path = reports_dir.join(format!("restore-{timestamp}-{}.json", &random[..8]));
    let payload = RestoreReportFile {
        package_path: package_path.display().to_string(),
        report,
    };
    let json = serde_json::to_string_pretty(&payload).context("serialize restore report")?;
    fs::write(&path, json).with_context(|| format!("write restore report {}", path.display()))?;
    tracing::info!(target: "dossier", event = "report_written", path = %path.display());
    Ok(path)
}
