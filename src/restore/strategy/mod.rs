//! Restoration strategies. Every record goes through the same chain:
//! validated insert, then direct construction, then raw bulk statements,
//! each attempt inside its own savepoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use thiserror::Error;

use super::access::{DataAccessLayer, Violation};
use super::outcome::Anomaly;
use crate::db::{bind_value, decode_column, quote_ident};
use crate::keys::{NaturalKeyRegistry, PackageIndex, ResolutionCache, ResolveError, Resolver, SourceIdMap};
use crate::model::{FieldValue, NaturalKeyReference, Record, Reference, SqlValue};
use crate::schema::{SchemaCatalog, TableSchema};

mod direct;
mod raw;
mod validated;

pub use direct::DirectConstruct;
pub use raw::RawBulk;
pub use validated::ValidatedInsert;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StrategyKind {
    StrategyA,
    StrategyB,
    StrategyC,
}

impl StrategyKind {
    /// Fallback order.
    pub const CHAIN: [StrategyKind; 3] = [
        StrategyKind::StrategyA,
        StrategyKind::StrategyB,
        StrategyKind::StrategyC,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::StrategyA => "StrategyA",
            StrategyKind::StrategyB => "StrategyB",
            StrategyKind::StrategyC => "StrategyC",
        }
    }
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("rejected by {rule}: {reason}")]
    Rejected { rule: String, reason: String },
    #[error("column {column} expects {expected}, got {actual}")]
    TypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),
}

impl StrategyError {
    pub fn is_pending(&self) -> bool {
        matches!(self, StrategyError::Resolve(err) if err.is_pending())
    }

    pub fn anomaly(&self) -> Anomaly {
        match self {
            StrategyError::Resolve(ResolveError::Ambiguous { .. }) => Anomaly::Ambiguous,
            StrategyError::Resolve(ResolveError::Unresolved { .. } | ResolveError::UnknownType(_)) => {
                Anomaly::Unresolved
            }
            StrategyError::Resolve(ResolveError::Pending { .. }) => Anomaly::Deferred,
            StrategyError::Resolve(ResolveError::BareSurrogate { .. }) => Anomaly::BareSurrogate,
            StrategyError::Resolve(ResolveError::Store(_)) | StrategyError::Store(_) => Anomaly::Store,
            StrategyError::Rejected { .. } => Anomaly::Rejected,
            StrategyError::TypeMismatch { .. } => Anomaly::TypeMismatch,
            StrategyError::Timeout(_) => Anomaly::TimedOut,
        }
    }
}

impl From<Violation> for StrategyError {
    fn from(violation: Violation) -> Self {
        match violation {
            Violation::TypeMismatch {
                column,
                expected,
                actual,
            } => StrategyError::TypeMismatch {
                column,
                expected,
                actual,
            },
            Violation::Rule { rule, field, detail } => StrategyError::Rejected {
                rule: rule.to_string(),
                reason: format!("{field}: {detail}"),
            },
            other @ (Violation::UnknownColumn(_) | Violation::MissingColumn(_)) => {
                StrategyError::Rejected {
                    rule: "schema".into(),
                    reason: other.to_string(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Insert,
    /// Rewrite the existing destination row with this rowid.
    Update(i64),
}

/// A record on its way into the destination.
#[derive(Debug, Clone, Copy)]
pub struct PlannedRecord<'r> {
    pub record_type: &'r str,
    pub record: &'r Record,
    pub natural_key: Option<&'r NaturalKeyReference>,
    pub target: WriteTarget,
}

/// What a strategy may consult while it writes one record.
pub struct StrategyContext<'a> {
    pub registry: &'a NaturalKeyRegistry,
    pub catalog: &'a SchemaCatalog,
    pub index: &'a PackageIndex,
    pub access: &'a DataAccessLayer,
    pub cache: &'a mut ResolutionCache,
    pub source_ids: &'a SourceIdMap,
}

impl<'a> StrategyContext<'a> {
    pub fn resolver(&mut self) -> Resolver<'_> {
        Resolver::new(self.registry, self.catalog, self.index, &mut *self.cache)
    }

    pub fn table(&self, record_type: &str) -> Result<&'a TableSchema, StrategyError> {
        self.catalog
            .table(record_type)
            .ok_or_else(|| ResolveError::UnknownType(record_type.to_string()).into())
    }
}

#[allow(async_fn_in_trait)]
pub trait RestoreStrategy {
    fn kind(&self) -> StrategyKind;

    /// Called once before the first record of each batch.
    fn prepare_batch(&mut self, _record_type: &str) {}

    /// Writes `planned` and returns its destination rowid.
    async fn apply(
        &mut self,
        conn: &mut SqliteConnection,
        cx: &mut StrategyContext<'_>,
        planned: &PlannedRecord<'_>,
    ) -> Result<i64, StrategyError>;
}

/// The three strategies of one run, tried in `StrategyKind::CHAIN` order.
#[derive(Debug, Default)]
pub struct StrategyChain {
    validated: ValidatedInsert,
    direct: DirectConstruct,
    raw: RawBulk,
}

impl StrategyChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepare_batch(&mut self, record_type: &str) {
        self.validated.prepare_batch(record_type);
        self.direct.prepare_batch(record_type);
        self.raw.prepare_batch(record_type);
    }

    pub async fn apply(
        &mut self,
        kind: StrategyKind,
        conn: &mut SqliteConnection,
        cx: &mut StrategyContext<'_>,
        planned: &PlannedRecord<'_>,
    ) -> Result<i64, StrategyError> {
        match kind {
            StrategyKind::StrategyA => self.validated.apply(conn, cx, planned).await,
            StrategyKind::StrategyB => self.direct.apply(conn, cx, planned).await,
            StrategyKind::StrategyC => self.raw.apply(conn, cx, planned).await,
        }
    }
}

/// Every field of `record` as the destination would store it, with
/// references resolved through the run's resolver.
pub(crate) async fn resolve_fields(
    conn: &mut SqliteConnection,
    cx: &mut StrategyContext<'_>,
    record: &Record,
) -> Result<Vec<(String, SqlValue)>, StrategyError> {
    let mut resolver = cx.resolver();
    let mut row = Vec::with_capacity(record.fields.len());
    for (name, value) in &record.fields {
        let value = resolver.field_value(conn, value).await?;
        row.push((name.clone(), value));
    }
    Ok(row)
}

pub(crate) fn insert_sql(table: &str, columns: &[&str]) -> String {
    if columns.is_empty() {
        return format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table));
    }
    let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let params: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        names.join(", "),
        params.join(", ")
    )
}

/// Rowid is bound last.
pub(crate) fn update_sql(table: &str, columns: &[&str]) -> String {
    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(idx, c)| format!("{} = ?{}", quote_ident(c), idx + 1))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE rowid = ?{}",
        quote_ident(table),
        assignments.join(", "),
        columns.len() + 1
    )
}

/// Runs a prepared insert or update and returns the row's rowid.
pub(crate) async fn execute_write(
    conn: &mut SqliteConnection,
    sql: &str,
    row: &[(String, SqlValue)],
    target: WriteTarget,
) -> Result<i64, sqlx::Error> {
    let mut query = sqlx::query(sql);
    for (_, value) in row {
        query = bind_value(query, value);
    }
    match target {
        WriteTarget::Insert => Ok(query.execute(&mut *conn).await?.last_insert_rowid()),
        WriteTarget::Update(id) => {
            let done = query.bind(id).execute(&mut *conn).await?;
            if done.rows_affected() == 0 {
                return Err(sqlx::Error::RowNotFound);
            }
            Ok(id)
        }
    }
}

pub(crate) async fn write_row(
    conn: &mut SqliteConnection,
    table: &TableSchema,
    row: &[(String, SqlValue)],
    target: WriteTarget,
) -> Result<i64, sqlx::Error> {
    let columns: Vec<&str> = row.iter().map(|(name, _)| name.as_str()).collect();
    let sql = match target {
        WriteTarget::Update(id) if columns.is_empty() => return Ok(id),
        WriteTarget::Update(_) => update_sql(&table.name, &columns),
        WriteTarget::Insert => insert_sql(&table.name, &columns),
    };
    execute_write(conn, &sql, row, target).await
}

/// Whether the destination row `id` already holds every field of
/// `record`. Fields without a destination column are ignored; a bare
/// surrogate only matches when this run restored its target.
pub(crate) async fn matches_existing(
    conn: &mut SqliteConnection,
    cx: &mut StrategyContext<'_>,
    table: &TableSchema,
    id: i64,
    record: &Record,
) -> Result<bool, StrategyError> {
    let mut row = Vec::with_capacity(record.fields.len());
    {
        let source_ids = cx.source_ids;
        let mut resolver = cx.resolver();
        for (name, value) in &record.fields {
            if !table.has_column(name) {
                continue;
            }
            let value = match value {
                FieldValue::Ref(Reference::Surrogate(bare)) => match source_ids.get(bare) {
                    Some(mapped) => SqlValue::Integer(mapped),
                    None => return Ok(false),
                },
                other => resolver.field_value(conn, other).await?,
            };
            row.push((name.as_str(), value));
        }
    }
    if row.is_empty() {
        return Ok(true);
    }

    let columns: Vec<String> = row.iter().map(|(name, _)| quote_ident(name)).collect();
    let sql = format!(
        "SELECT {} FROM {} WHERE rowid = ?1",
        columns.join(", "),
        quote_ident(&table.name)
    );
    let Some(stored) = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await? else {
        return Ok(false);
    };
    for (idx, (_, value)) in row.iter().enumerate() {
        if !decode_column(&stored, idx)?.same_value(value) {
            return Ok(false);
        }
    }
    Ok(true)
}
