use std::collections::HashMap;

use sqlx::{Column, Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{info, warn};

use super::manifest::Manifest;
use super::{BackupPackage, IntegrityError};
use crate::db::{decode_column, quote_ident};
use crate::keys::{KeyOrigin, NaturalKeyRegistry};
use crate::model::{
    FieldValue, KeyComponent, NaturalKeyReference, Record, RecordBatch, Reference, SqlValue,
    SurrogateReference,
};
use crate::restore::order::order_record_types;
use crate::schema::SchemaCatalog;

/// Deepest chain of composite keys followed when naturalizing a
/// reference (membership -> account -> ...).
const MAX_KEY_DEPTH: usize = 4;

const ROWID_COLUMN: &str = "__dossier_rowid";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("record source failed while {operation}: {source}")]
    Source {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Package(#[from] IntegrityError),
}

/// Where an export pulls its records from. Implementations must serve
/// every batch from one consistent snapshot.
#[allow(async_fn_in_trait)]
pub trait RecordSource {
    async fn list_batches(&mut self) -> anyhow::Result<Vec<String>>;
    async fn read_batch(&mut self, record_type: &str) -> anyhow::Result<Vec<Record>>;
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub app_version: String,
    pub source_label: Option<String>,
    /// Record type ordering; empty keeps the built-in ranks.
    pub priority: Vec<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            source_label: None,
            priority: Vec::new(),
        }
    }
}

/// Reads a SQLite database inside one read transaction. Foreign-key
/// columns that point at a rowid come back as surrogate references.
pub struct SqliteSource {
    tx: Transaction<'static, Sqlite>,
    catalog: SchemaCatalog,
}

impl SqliteSource {
    pub async fn snapshot(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let catalog = SchemaCatalog::load(&mut *tx).await?;
        info!(target: "dossier", event = "export_snapshot_begin");
        Ok(Self { tx, catalog })
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Ends the read transaction. Nothing was written, so it rolls back.
    pub async fn finish(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await?;
        info!(target: "dossier", event = "export_snapshot_end");
        Ok(())
    }
}

impl RecordSource for SqliteSource {
    async fn list_batches(&mut self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .catalog
            .tables()
            .filter(|t| !t.name.starts_with('_') && super::manifest::is_valid_record_type(&t.name))
            .map(|t| t.name.clone())
            .collect())
    }

    async fn read_batch(&mut self, record_type: &str) -> anyhow::Result<Vec<Record>> {
        let table = self
            .catalog
            .table(record_type)
            .ok_or_else(|| anyhow::anyhow!("unknown table {record_type}"))?;
        let sql = format!(
            "SELECT rowid AS {}, * FROM {} ORDER BY rowid",
            quote_ident(ROWID_COLUMN),
            quote_ident(&table.name)
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = Record::new(None);
            for (idx, column) in row.columns().iter().enumerate() {
                let name = column.name();
                let value = decode_column(row, idx)?;
                if name == ROWID_COLUMN {
                    if let SqlValue::Integer(id) = value {
                        record.source_id = Some(id);
                    }
                    continue;
                }
                if table.rowid_alias.as_deref() == Some(name) {
                    continue;
                }
                let field = match (table.foreign_key(name), value) {
                    (Some(target), SqlValue::Integer(id)) => {
                        FieldValue::Ref(Reference::Surrogate(SurrogateReference {
                            record_type: target.to_string(),
                            id,
                        }))
                    }
                    (_, value) => value.into_field_value(),
                };
                record.fields.insert(name.to_string(), field);
            }
            records.push(record);
        }
        Ok(records)
    }
}

/// Rewrites surrogate references into natural-key references, memoizing
/// per (type, source id).
struct Naturalizer<'a> {
    registry: &'a NaturalKeyRegistry,
    by_id: HashMap<&'a str, HashMap<i64, &'a Record>>,
    memo: HashMap<(String, i64), Option<NaturalKeyReference>>,
}

impl<'a> Naturalizer<'a> {
    fn new(registry: &'a NaturalKeyRegistry, batches: &'a [RecordBatch]) -> Self {
        let mut by_id: HashMap<&'a str, HashMap<i64, &'a Record>> = HashMap::new();
        for batch in batches {
            let ids = by_id.entry(batch.record_type.as_str()).or_default();
            for record in &batch.records {
                if let Some(id) = record.source_id {
                    ids.insert(id, record);
                }
            }
        }
        Self {
            registry,
            by_id,
            memo: HashMap::new(),
        }
    }

    fn natural_ref(&mut self, record_type: &str, id: i64, depth: usize) -> Option<NaturalKeyReference> {
        let memo_key = (record_type.to_string(), id);
        if let Some(found) = self.memo.get(&memo_key) {
            return found.clone();
        }
        if depth > MAX_KEY_DEPTH {
            return None;
        }
        let resolved = self.build_ref(record_type, id, depth);
        self.memo.insert(memo_key, resolved.clone());
        resolved
    }

    fn build_ref(&mut self, record_type: &str, id: i64, depth: usize) -> Option<NaturalKeyReference> {
        let record: &'a Record = *self.by_id.get(record_type)?.get(&id)?;
        let plan = self.registry.key_plan(record_type, record)?;
        let mut key = Vec::with_capacity(plan.fields.len());
        for field in &plan.fields {
            let value = match record.field(field)? {
                FieldValue::Ref(Reference::Surrogate(nested)) => {
                    FieldValue::from(self.natural_ref(&nested.record_type, nested.id, depth + 1)?)
                }
                other => other.clone(),
            };
            key.push(KeyComponent {
                field: field.clone(),
                value,
            });
        }
        Some(NaturalKeyReference {
            record_type: record_type.to_string(),
            key,
            heuristic: plan.origin == KeyOrigin::Heuristic,
        })
    }

    fn convert(&mut self, record: &Record) -> (Record, usize, usize) {
        let mut converted = 0;
        let mut bare = 0;
        let mut out = Record::new(record.source_id);
        for (name, value) in &record.fields {
            let value = match value {
                FieldValue::Ref(Reference::Surrogate(s)) => {
                    match self.natural_ref(&s.record_type, s.id, 0) {
                        Some(natural) => {
                            converted += 1;
                            FieldValue::from(natural)
                        }
                        None => {
                            bare += 1;
                            value.clone()
                        }
                    }
                }
                other => other.clone(),
            };
            out.fields.insert(name.clone(), value);
        }
        (out, converted, bare)
    }
}

/// Pulls every batch from `source` and seals them into a package. FK
/// references become natural-key references wherever the target record
/// has a derivable key; the rest stay bare and are flagged on restore.
pub async fn export<S: RecordSource>(
    source: &mut S,
    registry: &NaturalKeyRegistry,
    options: &ExportOptions,
) -> Result<BackupPackage, ExportError> {
    let listed = source
        .list_batches()
        .await
        .map_err(|source| ExportError::Source {
            operation: "listing batches".into(),
            source,
        })?;
    let record_types = order_record_types(listed, &options.priority);

    let mut raw = Vec::with_capacity(record_types.len());
    for record_type in record_types {
        let records = source
            .read_batch(&record_type)
            .await
            .map_err(|source| ExportError::Source {
                operation: format!("reading batch {record_type}"),
                source,
            })?;
        raw.push(RecordBatch::new(record_type, records));
    }

    let mut naturalizer = Naturalizer::new(registry, &raw);
    let mut batches = Vec::with_capacity(raw.len());
    for batch in &raw {
        let mut converted_total = 0;
        let mut bare_total = 0;
        let mut records = Vec::with_capacity(batch.len());
        for record in &batch.records {
            let (record, converted, bare) = naturalizer.convert(record);
            converted_total += converted;
            bare_total += bare;
            records.push(record);
        }
        info!(
            target: "dossier",
            event = "export_batch",
            record_type = %batch.record_type,
            records = records.len(),
            natural_refs = converted_total,
            bare_refs = bare_total
        );
        if bare_total > 0 {
            warn!(
                target: "dossier",
                event = "export_bare_references",
                record_type = %batch.record_type,
                count = bare_total
            );
        }
        batches.push(RecordBatch::new(batch.record_type.clone(), records));
    }

    let manifest = Manifest::new(options.app_version.clone(), options.source_label.clone());
    Ok(BackupPackage::seal(manifest, batches)?)
}

/// Snapshot export of a whole SQLite database.
pub async fn export_database(
    pool: &SqlitePool,
    registry: &NaturalKeyRegistry,
    options: &ExportOptions,
) -> Result<BackupPackage, ExportError> {
    let mut source = SqliteSource::snapshot(pool)
        .await
        .map_err(|err| ExportError::Source {
            operation: "opening snapshot".into(),
            source: err.into(),
        })?;
    let package = export(&mut source, registry, options).await;
    source.finish().await.map_err(|err| ExportError::Source {
        operation: "closing snapshot".into(),
        source: err.into(),
    })?;
    package
}
