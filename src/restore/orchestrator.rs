use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, SqliteConnection, SqlitePool};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::access::DataAccessLayer;
use super::lock::{lock_path_for, RestoreLock};
use super::order::order_record_types;
use super::outcome::{
    Anomaly, BatchDisposition, BatchResult, BatchState, IllegalTransition, RecordOutcome, RecordStatus,
    RestoreRun, RunStatus, StrategyAttempt,
};
use super::strategy::{
    matches_existing, PlannedRecord, StrategyChain, StrategyContext, StrategyError, StrategyKind, WriteTarget,
};
use crate::db::open_sqlite_pool;
use crate::keys::{NaturalKeyRegistry, PackageIndex, ResolutionCache, ResolveError, SourceIdMap};
use crate::model::{Record, RecordBatch};
use crate::package::BackupPackage;
use crate::schema::SchemaCatalog;

/// Label of the run-level batch that retries carried forward references.
pub const DEFERRED_BATCH: &str = "deferred";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "types", rename_all = "snake_case")]
pub enum RestoreMode {
    /// Runs everything inside one transaction that is always rolled back.
    DryRun,
    Full,
    /// Only these record types; references to others must already exist.
    CriticalOnly(BTreeSet<String>),
}

impl RestoreMode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, RestoreMode::DryRun)
    }

    pub fn includes(&self, record_type: &str) -> bool {
        match self {
            RestoreMode::CriticalOnly(types) => types.contains(record_type),
            _ => true,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RestoreMode::DryRun => "dry_run",
            RestoreMode::Full => "full",
            RestoreMode::CriticalOnly(_) => "critical_only",
        }
    }
}

/// What to do with a record whose natural key exists at the destination
/// with different field values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    Update,
    Skip,
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub mode: RestoreMode,
    /// Commit batches that contain failed records instead of rolling back.
    pub best_effort: bool,
    pub on_conflict: ConflictPolicy,
    pub batch_timeout: Option<Duration>,
    /// Types whose failures never roll back their batch.
    pub skippable_types: BTreeSet<String>,
    /// Replaces the built-in batch order when non-empty.
    pub priority: Vec<String>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            mode: RestoreMode::Full,
            best_effort: false,
            on_conflict: ConflictPolicy::Update,
            batch_timeout: None,
            skippable_types: BTreeSet::new(),
            priority: Vec::new(),
        }
    }
}

impl RestoreOptions {
    pub fn with_mode(mut self, mode: RestoreMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    /// Whether a failed record of `record_type` rolls its batch back and
    /// halts the run.
    pub fn halts_on_failure(&self, record_type: &str) -> bool {
        !self.mode.is_dry_run() && !self.best_effort && !self.skippable_types.contains(record_type)
    }
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("destination {identity} is already being restored")]
    Locked { identity: String },
    #[error("restore lock {path}: {source}")]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("batch {record_type} rolled back: {reason}")]
    TransactionAbort { record_type: String, reason: String },
    #[error("destination schema: {0}")]
    Schema(String),
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
}

/// A destination store plus the identity its restore lock is keyed on.
#[derive(Debug, Clone)]
pub struct Destination {
    pool: SqlitePool,
    identity: String,
    lock_path: Option<PathBuf>,
}

impl Destination {
    /// Opens an existing database file; restores never create one.
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        let pool = open_sqlite_pool(db_path, false).await?;
        let identity = std::fs::canonicalize(db_path)
            .unwrap_or_else(|_| db_path.to_path_buf())
            .display()
            .to_string();
        Ok(Self {
            pool,
            identity,
            lock_path: Some(lock_path_for(db_path)),
        })
    }

    /// Wraps a pool with no backing lock file, e.g. an in-memory store.
    pub fn from_pool(pool: SqlitePool, identity: impl Into<String>) -> Self {
        Self {
            pool,
            identity: identity.into(),
            lock_path: None,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub struct Restorer {
    destination: Destination,
    registry: NaturalKeyRegistry,
    access: DataAccessLayer,
}

impl Restorer {
    pub fn new(destination: Destination, registry: NaturalKeyRegistry, access: DataAccessLayer) -> Self {
        Self {
            destination,
            registry,
            access,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub async fn restore(
        &self,
        package: &BackupPackage,
        options: &RestoreOptions,
    ) -> Result<RestoreRun, RestoreError> {
        let _lock = RestoreLock::acquire(
            &self.destination.identity,
            self.destination.lock_path.as_deref(),
        )?;
        let run_id = Uuid::now_v7();
        let started_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let clock = std::time::Instant::now();

        let mut pooled = self.destination.pool.acquire().await?;
        let conn: &mut SqliteConnection = &mut pooled;
        let catalog = SchemaCatalog::load(conn).await?;

        let selected = select_batches(package, options);
        for batch in &selected {
            if catalog.table(&batch.record_type).is_none()
                && !options.skippable_types.contains(&batch.record_type)
            {
                return Err(RestoreError::Schema(format!(
                    "destination has no table for record type {}",
                    batch.record_type
                )));
            }
        }

        let mut index = PackageIndex::build(package.batches(), &self.registry);
        if let RestoreMode::CriticalOnly(types) = &options.mode {
            index.retain_types(types);
        }

        info!(
            target: "dossier",
            event = "restore_start",
            run_id = %run_id,
            mode = options.mode.label(),
            best_effort = options.best_effort,
            destination = %self.destination.identity,
            batches = selected.len(),
            records = selected.iter().map(|b| b.len()).sum::<usize>()
        );

        let mut session = Session {
            env: RunEnv {
                registry: &self.registry,
                access: &self.access,
                options,
                catalog,
                index,
            },
            cache: ResolutionCache::new(),
            source_ids: SourceIdMap::new(),
            chain: StrategyChain::new(),
        };

        let progress = if options.mode.is_dry_run() {
            let mut outer = conn.begin().await?;
            let progress = session.run(&mut outer, &selected).await;
            outer.rollback().await?;
            info!(target: "dossier", event = "dry_run_rolled_back", run_id = %run_id);
            progress?
        } else {
            session.run(conn, &selected).await?
        };

        let any_failed = progress
            .batches
            .iter()
            .chain(progress.deferred.iter())
            .flat_map(|b| b.outcomes.iter())
            .any(|o| o.status.is_failed());
        let status = if progress.halted {
            RunStatus::Aborted
        } else if any_failed {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };

        let run = RestoreRun {
            run_id,
            mode: options.mode.clone(),
            best_effort: options.best_effort,
            status,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            destination: self.destination.identity.clone(),
            batches: progress.batches,
            deferred: progress.deferred,
            cache: session.cache.stats(),
        };

        info!(
            target: "dossier",
            event = "restore_finish",
            run_id = %run.run_id,
            status = %run.status,
            duration_ms = run.duration_ms,
            cache_hits = run.cache.hits,
            cache_misses = run.cache.misses
        );
        Ok(run)
    }
}

impl RestoreRun {
    /// The rollback that halted the run, if any.
    pub fn abort_error(&self) -> Option<RestoreError> {
        self.all_batches().find_map(|batch| match &batch.disposition {
            BatchDisposition::RolledBack(reason) => Some(RestoreError::TransactionAbort {
                record_type: batch.record_type.clone(),
                reason: reason.clone(),
            }),
            _ => None,
        })
    }
}

/// Batches to run, in dependency order, restricted by the mode.
fn select_batches<'p>(package: &'p BackupPackage, options: &RestoreOptions) -> Vec<&'p RecordBatch> {
    let types = package
        .batches()
        .iter()
        .map(|b| b.record_type.clone())
        .collect();
    order_record_types(types, &options.priority)
        .into_iter()
        .filter(|t| options.mode.includes(t))
        .filter_map(|t| package.batch(&t))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    First,
    Retry,
    /// The run-level deferred pass; nothing may wait any longer.
    Final,
}

impl Pass {
    fn may_wait(self) -> bool {
        self != Pass::Final
    }
}

enum Step {
    Done(RecordOutcome),
    /// A reference targets a package record not restored yet.
    Waiting,
}

#[derive(Debug, Clone, Copy)]
struct Carried<'p> {
    record_type: &'p str,
    record: &'p Record,
}

struct Progress {
    batches: Vec<BatchResult>,
    deferred: Option<BatchResult>,
    halted: bool,
}

/// Read-only state shared by every record of a run.
struct RunEnv<'r> {
    registry: &'r NaturalKeyRegistry,
    access: &'r DataAccessLayer,
    options: &'r RestoreOptions,
    catalog: SchemaCatalog,
    index: PackageIndex,
}

impl RunEnv<'_> {
    fn context<'s>(
        &'s self,
        cache: &'s mut ResolutionCache,
        source_ids: &'s SourceIdMap,
    ) -> StrategyContext<'s> {
        StrategyContext {
            registry: self.registry,
            catalog: &self.catalog,
            index: &self.index,
            access: self.access,
            cache,
            source_ids,
        }
    }
}

struct Session<'r> {
    env: RunEnv<'r>,
    cache: ResolutionCache,
    source_ids: SourceIdMap,
    chain: StrategyChain,
}

impl<'r> Session<'r> {
    async fn run<'p>(
        &mut self,
        conn: &mut SqliteConnection,
        batches: &[&'p RecordBatch],
    ) -> Result<Progress, RestoreError> {
        let mut results = Vec::with_capacity(batches.len());
        let mut carried = Vec::new();
        let mut halted = false;

        for &batch in batches {
            if halted {
                results.push(BatchResult {
                    record_type: batch.record_type.clone(),
                    state: BatchState::Pending,
                    disposition: BatchDisposition::NotAttempted,
                    outcomes: Vec::new(),
                });
                continue;
            }
            let (result, mut waiting) = self.run_batch(conn, batch).await?;
            halted = !result.committed();
            carried.append(&mut waiting);
            results.push(result);
        }

        let deferred = match (halted, carried.is_empty()) {
            (_, true) => None,
            (true, false) => Some(abandon(carried)),
            (false, false) => {
                let result = self.run_deferred(conn, carried).await?;
                halted = !result.committed();
                Some(result)
            }
        };

        Ok(Progress {
            batches: results,
            deferred,
            halted,
        })
    }

    async fn run_batch<'p>(
        &mut self,
        conn: &mut SqliteConnection,
        batch: &'p RecordBatch,
    ) -> Result<(BatchResult, Vec<Carried<'p>>), RestoreError> {
        let record_type = batch.record_type.as_str();
        let deadline = self.env.options.batch_timeout.map(|limit| Instant::now() + limit);
        let marks = (self.cache.checkpoint(), self.source_ids.checkpoint());
        self.chain.prepare_batch(record_type);
        info!(
            target: "dossier",
            event = "batch_begin",
            record_type,
            records = batch.len()
        );

        let mut tx = conn.begin().await?;
        let mut state = BatchState::Pending;
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut waiting = Vec::new();
        for record in &batch.records {
            match self
                .restore_record(&mut tx, record_type, record, Pass::First, deadline, &mut state)
                .await?
            {
                Step::Done(outcome) => outcomes.push(outcome),
                Step::Waiting => waiting.push(record),
            }
        }

        // Forward references inside the batch: retry while a pass helps.
        while !waiting.is_empty() {
            let before = waiting.len();
            debug!(target: "dossier", event = "batch_retry_pass", record_type, waiting = before);
            let mut still = Vec::new();
            for record in waiting {
                match self
                    .restore_record(&mut tx, record_type, record, Pass::Retry, deadline, &mut state)
                    .await?
                {
                    Step::Done(outcome) => outcomes.push(outcome),
                    Step::Waiting => still.push(record),
                }
            }
            waiting = still;
            if waiting.len() == before {
                break;
            }
        }

        let halts = self.env.options.halts_on_failure(record_type);
        if halts && outcomes.iter().any(|o| o.status.is_failed()) {
            tx.rollback().await?;
            self.cache.rollback_to(marks.0);
            self.source_ids.rollback_to(marks.1);
            for record in waiting {
                outcomes.push(abandoned(record_type, record, "batch rolled back"));
            }
            let reason = first_failure(&outcomes);
            warn!(
                target: "dossier",
                event = "batch_rollback",
                record_type,
                reason = %reason
            );
            return Ok((
                BatchResult {
                    record_type: record_type.to_string(),
                    state: state.transition(BatchState::Failed)?,
                    disposition: BatchDisposition::RolledBack(reason),
                    outcomes,
                },
                Vec::new(),
            ));
        }

        tx.commit().await?;
        info!(
            target: "dossier",
            event = "batch_commit",
            record_type,
            state = ?state,
            written = outcomes.iter().filter(|o| o.status.wrote()).count(),
            failed = outcomes.iter().filter(|o| o.status.is_failed()).count(),
            carried = waiting.len()
        );
        let carried = waiting
            .into_iter()
            .map(|record| Carried {
                record_type: batch.record_type.as_str(),
                record,
            })
            .collect();
        Ok((
            BatchResult {
                record_type: record_type.to_string(),
                state: state.transition(BatchState::Success)?,
                disposition: BatchDisposition::Committed,
                outcomes,
            },
            carried,
        ))
    }

    async fn run_deferred(
        &mut self,
        conn: &mut SqliteConnection,
        carried: Vec<Carried<'_>>,
    ) -> Result<BatchResult, RestoreError> {
        let deadline = self.env.options.batch_timeout.map(|limit| Instant::now() + limit);
        let marks = (self.cache.checkpoint(), self.source_ids.checkpoint());
        self.chain.prepare_batch(DEFERRED_BATCH);
        info!(target: "dossier", event = "deferred_pass_begin", records = carried.len());

        let mut tx = conn.begin().await?;
        let mut state = BatchState::Pending;
        let mut outcomes = Vec::with_capacity(carried.len());
        // Carried records may reference each other: keep retrying while a
        // pass makes progress, then give the rest one pass that cannot wait.
        let mut waiting = carried;
        loop {
            let before = waiting.len();
            let mut still = Vec::new();
            for item in waiting {
                match self
                    .restore_record(&mut tx, item.record_type, item.record, Pass::Retry, deadline, &mut state)
                    .await?
                {
                    Step::Done(outcome) => outcomes.push(outcome),
                    Step::Waiting => still.push(item),
                }
            }
            waiting = still;
            if waiting.is_empty() || waiting.len() == before {
                break;
            }
            debug!(target: "dossier", event = "deferred_retry_pass", waiting = waiting.len());
        }
        for item in &waiting {
            if let Step::Done(outcome) = self
                .restore_record(&mut tx, item.record_type, item.record, Pass::Final, deadline, &mut state)
                .await?
            {
                outcomes.push(outcome);
            }
        }

        let halts = outcomes
            .iter()
            .any(|o| o.status.is_failed() && self.env.options.halts_on_failure(&o.record_type));
        let (state, disposition) = if halts {
            tx.rollback().await?;
            self.cache.rollback_to(marks.0);
            self.source_ids.rollback_to(marks.1);
            let reason = first_failure(&outcomes);
            warn!(target: "dossier", event = "batch_rollback", record_type = DEFERRED_BATCH, reason = %reason);
            (state.transition(BatchState::Failed)?, BatchDisposition::RolledBack(reason))
        } else {
            tx.commit().await?;
            info!(target: "dossier", event = "batch_commit", record_type = DEFERRED_BATCH, state = ?state);
            (state.transition(BatchState::Success)?, BatchDisposition::Committed)
        };

        Ok(BatchResult {
            record_type: DEFERRED_BATCH.to_string(),
            state,
            disposition,
            outcomes,
        })
    }

    async fn restore_record(
        &mut self,
        conn: &mut SqliteConnection,
        record_type: &str,
        record: &Record,
        pass: Pass,
        deadline: Option<Instant>,
        state: &mut BatchState,
    ) -> Result<Step, RestoreError> {
        let natural_key = self.env.registry.natural_key(record_type, record);
        let mut outcome = RecordOutcome {
            record_type: record_type.to_string(),
            source_id: record.source_id,
            natural_key: natural_key.as_ref().map(ToString::to_string),
            status: RecordStatus::Inserted,
            strategy: None,
            destination_id: None,
            attempts: Vec::new(),
            anomalies: Vec::new(),
        };
        if pass != Pass::First {
            outcome.anomalies.push(Anomaly::Deferred);
        }

        let mut target = WriteTarget::Insert;
        if let Some(key) = &natural_key {
            let existing = self
                .env
                .context(&mut self.cache, &self.source_ids)
                .resolver()
                .lookup(conn, key)
                .await;
            match existing {
                Ok(None) => {}
                Ok(Some(id)) => {
                    let same = match self.env.catalog.table(record_type) {
                        Some(table) => {
                            let mut cx = self.env.context(&mut self.cache, &self.source_ids);
                            matches_existing(conn, &mut cx, table, id, record).await
                        }
                        None => Ok(false),
                    };
                    match same {
                        Ok(true) => return Ok(Step::Done(self.skipped(outcome, id))),
                        Err(err) if err.is_pending() && pass.may_wait() => return Ok(Step::Waiting),
                        _ if self.env.options.on_conflict == ConflictPolicy::Skip => {
                            return Ok(Step::Done(self.skipped(outcome, id)))
                        }
                        _ => target = WriteTarget::Update(id),
                    }
                }
                Err(err) if err.is_pending() && pass.may_wait() => return Ok(Step::Waiting),
                // Existence cannot be checked; the raw strategy may still map it.
                Err(ResolveError::BareSurrogate { .. }) => {}
                Err(err) => {
                    let err = StrategyError::from(err);
                    outcome.anomalies.push(err.anomaly());
                    outcome.status = RecordStatus::Failed(format!("natural key lookup failed: {err}"));
                    log_failure(&outcome);
                    return Ok(Step::Done(outcome));
                }
            }
        }

        let planned = PlannedRecord {
            record_type,
            record,
            natural_key: natural_key.as_ref(),
            target,
        };
        for kind in StrategyKind::CHAIN {
            let mark = self.cache.checkpoint();
            let mut savepoint = conn.begin().await?;
            let result = {
                let mut cx = self.env.context(&mut self.cache, &self.source_ids);
                let attempt = self.chain.apply(kind, &mut savepoint, &mut cx, &planned);
                match deadline.map(|d| d.saturating_duration_since(Instant::now())) {
                    Some(limit) if limit.is_zero() => Err(StrategyError::Timeout(Duration::ZERO)),
                    Some(limit) => match tokio::time::timeout(limit, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(StrategyError::Timeout(limit)),
                    },
                    None => attempt.await,
                }
            };

            match result {
                Ok(id) => {
                    savepoint.commit().await?;
                    let id = match planned.natural_key {
                        Some(key) => self.cache.record(key, id),
                        None => id,
                    };
                    if let Some(source_id) = record.source_id {
                        self.source_ids.record(record_type, source_id, id);
                    }
                    *state = state.escalate(kind)?;
                    outcome.status = match target {
                        WriteTarget::Insert => RecordStatus::Inserted,
                        WriteTarget::Update(_) => RecordStatus::Updated,
                    };
                    outcome.strategy = Some(kind);
                    outcome.destination_id = Some(id);
                    debug!(
                        target: "dossier",
                        event = "record_restored",
                        record = %outcome.label(),
                        strategy = kind.as_str(),
                        id
                    );
                    return Ok(Step::Done(outcome));
                }
                Err(err) => {
                    savepoint.rollback().await?;
                    self.cache.rollback_to(mark);
                    if err.is_pending() && pass.may_wait() {
                        return Ok(Step::Waiting);
                    }
                    *state = state.escalate(kind)?;
                    debug!(
                        target: "dossier",
                        event = "strategy_failed",
                        record = %outcome.label(),
                        strategy = kind.as_str(),
                        error = %err
                    );
                    outcome.attempts.push(StrategyAttempt {
                        strategy: kind,
                        error: err.to_string(),
                        anomaly: Some(err.anomaly()),
                    });
                }
            }
        }

        let mut reason = outcome
            .attempts
            .last()
            .map(|attempt| attempt.error.clone())
            .unwrap_or_default();
        if pass == Pass::Final && outcome.attempts.iter().any(|a| a.anomaly == Some(Anomaly::Deferred)) {
            outcome.anomalies.push(Anomaly::Unresolved);
            reason = format!("unresolved reference after the deferred pass: {reason}");
        }
        outcome.status = RecordStatus::Failed(reason);
        log_failure(&outcome);
        Ok(Step::Done(outcome))
    }

    fn skipped(&mut self, mut outcome: RecordOutcome, id: i64) -> RecordOutcome {
        if let Some(source_id) = outcome.source_id {
            self.source_ids.record(&outcome.record_type, source_id, id);
        }
        outcome.status = RecordStatus::SkippedDuplicate;
        outcome.destination_id = Some(id);
        outcome
    }
}

/// Carried records of a run that halted before the deferred pass.
fn abandon(carried: Vec<Carried<'_>>) -> BatchResult {
    BatchResult {
        record_type: DEFERRED_BATCH.to_string(),
        state: BatchState::Pending,
        disposition: BatchDisposition::NotAttempted,
        outcomes: carried
            .into_iter()
            .map(|item| abandoned(item.record_type, item.record, "run halted before the deferred pass"))
            .collect(),
    }
}

fn abandoned(record_type: &str, record: &Record, why: &str) -> RecordOutcome {
    RecordOutcome {
        record_type: record_type.to_string(),
        source_id: record.source_id,
        natural_key: None,
        status: RecordStatus::Failed(format!("waiting on a forward reference; {why}")),
        strategy: None,
        destination_id: None,
        attempts: Vec::new(),
        anomalies: vec![Anomaly::Deferred],
    }
}

fn first_failure(outcomes: &[RecordOutcome]) -> String {
    outcomes
        .iter()
        .find_map(|o| match &o.status {
            RecordStatus::Failed(reason) => Some(format!("{}: {reason}", o.label())),
            _ => None,
        })
        .unwrap_or_else(|| "record failed".into())
}

fn log_failure(outcome: &RecordOutcome) {
    if let RecordStatus::Failed(reason) = &outcome.status {
        warn!(
            target: "dossier",
            event = "record_failed",
            record = %outcome.label(),
            attempts = outcome.attempts.len(),
            reason = %reason
        );
    }
}
