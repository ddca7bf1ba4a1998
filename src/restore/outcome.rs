use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::orchestrator::RestoreMode;
use super::strategy::StrategyKind;
use crate::keys::CacheStats;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RecordStatus {
    Inserted,
    Updated,
    SkippedDuplicate,
    Failed(String),
}

impl RecordStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, RecordStatus::Failed(_))
    }

    /// Inserted or updated: the record wrote a row.
    pub fn wrote(&self) -> bool {
        matches!(self, RecordStatus::Inserted | RecordStatus::Updated)
    }
}

/// Notable conditions a record ran into, counted by the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    Ambiguous,
    Unresolved,
    Deferred,
    BareSurrogate,
    TimedOut,
    Rejected,
    TypeMismatch,
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyAttempt {
    pub strategy: StrategyKind,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<Anomaly>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub record_type: String,
    pub source_id: Option<i64>,
    pub natural_key: Option<String>,
    pub status: RecordStatus,
    /// Strategy that wrote the row; `None` for skips and failures.
    pub strategy: Option<StrategyKind>,
    pub destination_id: Option<i64>,
    /// Failed attempts in the order they ran.
    pub attempts: Vec<StrategyAttempt>,
    /// Conditions seen outside a strategy attempt (e.g. deferral).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<Anomaly>,
}

impl RecordOutcome {
    pub fn label(&self) -> String {
        match (&self.natural_key, self.source_id) {
            (Some(key), _) => key.clone(),
            (None, Some(id)) => format!("{}#{id}", self.record_type),
            (None, None) => format!("{}#?", self.record_type),
        }
    }

    pub fn all_anomalies(&self) -> impl Iterator<Item = Anomaly> + '_ {
        self.anomalies
            .iter()
            .copied()
            .chain(self.attempts.iter().filter_map(|a| a.anomaly))
    }
}

/// Lifecycle of one batch. It advances to the deepest strategy any of its
/// records needed and ends committed (`Success`) or rolled back (`Failed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    StrategyA,
    StrategyB,
    StrategyC,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal batch transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: BatchState,
    pub to: BatchState,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Success | BatchState::Failed)
    }

    pub fn can_transition(self, to: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, to),
            (Pending, StrategyA)
                | (Pending, Success)
                | (Pending, Failed)
                | (StrategyA, StrategyB)
                | (StrategyA, Success)
                | (StrategyA, Failed)
                | (StrategyB, StrategyC)
                | (StrategyB, Success)
                | (StrategyB, Failed)
                | (StrategyC, Success)
                | (StrategyC, Failed)
        )
    }

    pub fn transition(self, to: BatchState) -> Result<BatchState, IllegalTransition> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(IllegalTransition { from: self, to })
        }
    }

    /// Steps forward until the batch is at least at `kind`'s state.
    pub fn escalate(self, kind: StrategyKind) -> Result<BatchState, IllegalTransition> {
        let target = BatchState::from(kind);
        let mut state = self;
        while state.depth() < target.depth() {
            let next = match state {
                BatchState::Pending => BatchState::StrategyA,
                BatchState::StrategyA => BatchState::StrategyB,
                BatchState::StrategyB => BatchState::StrategyC,
                other => return Err(IllegalTransition { from: other, to: target }),
            };
            state = state.transition(next)?;
        }
        Ok(state)
    }

    fn depth(self) -> u8 {
        match self {
            BatchState::Pending => 0,
            BatchState::StrategyA => 1,
            BatchState::StrategyB => 2,
            BatchState::StrategyC => 3,
            BatchState::Success | BatchState::Failed => 4,
        }
    }
}

impl From<StrategyKind> for BatchState {
    fn from(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::StrategyA => BatchState::StrategyA,
            StrategyKind::StrategyB => BatchState::StrategyB,
            StrategyKind::StrategyC => BatchState::StrategyC,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", content = "reason", rename_all = "snake_case")]
pub enum BatchDisposition {
    Committed,
    RolledBack(String),
    /// The run halted before this batch started.
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub record_type: String,
    pub state: BatchState,
    pub disposition: BatchDisposition,
    pub outcomes: Vec<RecordOutcome>,
}

impl BatchResult {
    pub fn committed(&self) -> bool {
        self.disposition == BatchDisposition::Committed
    }

    pub fn failures(&self) -> impl Iterator<Item = &RecordOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_failed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Partial,
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Aborted => "aborted",
        })
    }
}

/// Everything one restore did, in the order it did it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRun {
    pub run_id: Uuid,
    pub mode: RestoreMode,
    pub best_effort: bool,
    pub status: RunStatus,
    pub started_at: String,
    pub duration_ms: u64,
    pub destination: String,
    pub batches: Vec<BatchResult>,
    /// Records carried past their own batch and retried after the last.
    pub deferred: Option<BatchResult>,
    pub cache: CacheStats,
}

impl RestoreRun {
    pub fn is_dry_run(&self) -> bool {
        matches!(self.mode, RestoreMode::DryRun)
    }

    pub fn all_batches(&self) -> impl Iterator<Item = &BatchResult> {
        self.batches.iter().chain(self.deferred.iter())
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &RecordOutcome> {
        self.all_batches().flat_map(|b| b.outcomes.iter())
    }

    pub fn batch(&self, record_type: &str) -> Option<&BatchResult> {
        self.batches.iter().find(|b| b.record_type == record_type)
    }

    /// Final outcome for a record, looking at the deferred pass last.
    pub fn outcome_for(&self, record_type: &str, source_id: i64) -> Option<&RecordOutcome> {
        self.outcomes()
            .filter(|o| o.record_type == record_type && o.source_id == Some(source_id))
            .last()
    }

    /// 0 success, 2 partial or would-fail dry run, 3 aborted.
    pub fn exit_code(&self) -> i32 {
        if self.is_dry_run() {
            return if self.outcomes().any(|o| o.status.is_failed()) {
                crate::EXIT_PARTIAL
            } else {
                crate::EXIT_OK
            };
        }
        match self.status {
            RunStatus::Completed => crate::EXIT_OK,
            RunStatus::Partial => crate::EXIT_PARTIAL,
            RunStatus::Aborted => crate::EXIT_FATAL,
        }
    }
}
