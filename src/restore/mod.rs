//! Replays a package into a destination store, batch by batch, with a
//! per-record fallback through three strategies.

pub mod access;
pub mod lock;
pub mod order;
pub mod orchestrator;
pub mod outcome;
pub mod strategy;

pub use access::{default_rules, DataAccessLayer, DerivedField, FieldRule, RuleError, TypeRules, Violation};
pub use lock::RestoreLock;
pub use order::order_record_types;
pub use orchestrator::{
    ConflictPolicy, Destination, RestoreError, RestoreMode, RestoreOptions, Restorer, DEFERRED_BATCH,
};
pub use outcome::{
    Anomaly, BatchDisposition, BatchResult, BatchState, IllegalTransition, RecordOutcome, RecordStatus,
    RestoreRun, RunStatus, StrategyAttempt,
};
pub use strategy::{RestoreStrategy, StrategyError, StrategyKind};
