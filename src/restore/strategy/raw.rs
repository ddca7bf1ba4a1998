use std::collections::HashMap;

use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::{Row, SqliteConnection};

use super::{
    execute_write, insert_sql, update_sql, PlannedRecord, RestoreStrategy, StrategyContext, StrategyError,
    StrategyKind, WriteTarget,
};
use crate::db::{decode_column, quote_ident};
use crate::keys::{NaturalKeyRegistry, PackageIndex, ResolveError, SourceIdMap};
use crate::model::{FieldValue, NaturalKeyReference, Reference, SqlValue, SurrogateReference};
use crate::schema::{Affinity, SchemaCatalog, TableSchema};

/// Strategy C: raw statements with only the store's own constraints.
/// References resolve through an id map loaded in bulk per batch, and
/// bare surrogates through the run's source-id remap.
#[derive(Debug, Default)]
pub struct RawBulk {
    id_map: IdMap,
    statements: HashMap<StatementKey, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StatementKey {
    table: String,
    update: bool,
    columns: Vec<String>,
}

type Slot = (String, Vec<String>);

/// Destination rowids keyed by the canonical rendering of their key
/// values, one slot per (record type, key fields).
#[derive(Debug, Default)]
struct IdMap {
    slots: HashMap<Slot, HashMap<String, Vec<i64>>>,
}

impl IdMap {
    fn clear(&mut self) {
        self.slots.clear();
    }

    /// Rowids whose key fields render to `key`. A slot is loaded with one
    /// query on first use and reloaded once on a miss, so rows written
    /// earlier in the batch are seen.
    async fn ids(
        &mut self,
        conn: &mut SqliteConnection,
        table: &TableSchema,
        fields: &[String],
        key: &str,
    ) -> Result<Vec<i64>, sqlx::Error> {
        let slot = (table.name.clone(), fields.to_vec());
        let fresh = !self.slots.contains_key(&slot);
        if fresh {
            self.load(conn, table, &slot).await?;
        }
        let mut found = self.lookup(&slot, key);
        if found.is_empty() && !fresh {
            self.load(conn, table, &slot).await?;
            found = self.lookup(&slot, key);
        }
        Ok(found)
    }

    fn lookup(&self, slot: &Slot, key: &str) -> Vec<i64> {
        self.slots
            .get(slot)
            .and_then(|ids| ids.get(key))
            .cloned()
            .unwrap_or_default()
    }

    async fn load(&mut self, conn: &mut SqliteConnection, table: &TableSchema, slot: &Slot) -> Result<(), sqlx::Error> {
        let fields = &slot.1;
        let columns: Vec<String> = fields.iter().map(|f| quote_ident(f)).collect();
        let sql = format!(
            "SELECT rowid, {} FROM {} ORDER BY rowid",
            columns.join(", "),
            quote_ident(&table.name)
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        let mut ids: HashMap<String, Vec<i64>> = HashMap::new();
        for row in &rows {
            let id: i64 = row.try_get(0)?;
            let mut values = Vec::with_capacity(fields.len());
            for (idx, field) in fields.iter().enumerate() {
                let value = decode_column(row, idx + 1)?;
                values.push(match table.column(field) {
                    Some(column) => with_affinity(column.affinity, value),
                    None => value,
                });
            }
            ids.entry(canonical(&values)).or_default().push(id);
        }
        tracing::debug!(
            target: "dossier",
            event = "id_map_loaded",
            record_type = %table.name,
            rows = rows.len()
        );
        self.slots.insert(slot.clone(), ids);
        Ok(())
    }
}

/// The conversion SQLite applies to a value compared against a column of
/// this affinity, so map keys agree with `"col" IS ?` lookups.
fn with_affinity(affinity: Affinity, value: SqlValue) -> SqlValue {
    match (affinity, value) {
        (Affinity::Text, SqlValue::Integer(v)) => SqlValue::Text(v.to_string()),
        (Affinity::Text, SqlValue::Real(v)) => SqlValue::Text(format!("{v:?}")),
        (Affinity::Integer | Affinity::Real | Affinity::Numeric, SqlValue::Text(text)) => {
            numeric_text(&text).unwrap_or(SqlValue::Text(text))
        }
        (_, value) => value,
    }
}

fn numeric_text(text: &str) -> Option<SqlValue> {
    let trimmed = text.trim();
    if let Ok(int) = trimmed.parse::<i64>() {
        return Some(SqlValue::Integer(int));
    }
    match trimmed.parse::<f64>() {
        Ok(real) if real.is_finite() && !trimmed.is_empty() => Some(SqlValue::Real(real)),
        _ => None,
    }
}

fn canonical(values: &[SqlValue]) -> String {
    let parts: Vec<String> = values
        .iter()
        .map(|value| match value {
            SqlValue::Real(real) if real.fract() == 0.0 && real.abs() < 9.0e15 => {
                (*real as i64).to_string()
            }
            other => other.to_string(),
        })
        .collect();
    parts.join("\u{1f}")
}

/// What the raw strategy may consult: the catalog, the package and the
/// run's source-id remap. Never the live resolution cache.
#[derive(Clone, Copy)]
struct BulkLookup<'c> {
    registry: &'c NaturalKeyRegistry,
    catalog: &'c SchemaCatalog,
    index: &'c PackageIndex,
    source_ids: &'c SourceIdMap,
}

impl<'c> BulkLookup<'c> {
    fn of(cx: &StrategyContext<'c>) -> Self {
        Self {
            registry: cx.registry,
            catalog: cx.catalog,
            index: cx.index,
            source_ids: cx.source_ids,
        }
    }

    fn remapped(&self, bare: &SurrogateReference) -> Result<i64, ResolveError> {
        self.source_ids
            .get(bare)
            .ok_or_else(|| ResolveError::BareSurrogate {
                reference: bare.to_string(),
            })
    }
}

impl RawBulk {
    /// Resolves `reference` through the bulk id map; composite key
    /// components recurse the same way.
    fn resolve<'a, 'c: 'a>(
        &'a mut self,
        conn: &'a mut SqliteConnection,
        lookup: BulkLookup<'c>,
        reference: &'a NaturalKeyReference,
    ) -> BoxFuture<'a, Result<i64, StrategyError>> {
        async move {
            lookup
                .registry
                .check_reference(reference)
                .map_err(|reason| ResolveError::Unresolved {
                    reference: reference.to_string(),
                    reason,
                })?;
            let table = lookup
                .catalog
                .table(&reference.record_type)
                .ok_or_else(|| ResolveError::UnknownType(reference.record_type.clone()))?;

            let mut fields = Vec::with_capacity(reference.key.len());
            let mut values = Vec::with_capacity(reference.key.len());
            for component in &reference.key {
                let Some(column) = table.column(&component.field) else {
                    return Err(ResolveError::Unresolved {
                        reference: reference.to_string(),
                        reason: format!("destination table {} has no column {}", table.name, component.field),
                    }
                    .into());
                };
                let value = match &component.value {
                    FieldValue::Ref(Reference::Natural(nested)) => {
                        SqlValue::Integer(self.resolve(&mut *conn, lookup, nested).await?)
                    }
                    FieldValue::Ref(Reference::Surrogate(bare)) => SqlValue::Integer(lookup.remapped(bare)?),
                    scalar => SqlValue::from_scalar(scalar).unwrap_or(SqlValue::Null),
                };
                fields.push(component.field.clone());
                values.push(with_affinity(column.affinity, value));
            }

            let key = canonical(&values);
            let ids = self.id_map.ids(conn, table, &fields, &key).await?;
            match ids.as_slice() {
                [id] => Ok(*id),
                [] if lookup.index.contains(reference) => Err(ResolveError::Pending {
                    reference: reference.to_string(),
                }
                .into()),
                [] => Err(ResolveError::Unresolved {
                    reference: reference.to_string(),
                    reason: "no destination record matches".into(),
                }
                .into()),
                many if reference.heuristic => Err(ResolveError::Unresolved {
                    reference: reference.to_string(),
                    reason: format!("heuristic key matches {} destination records", many.len()),
                }
                .into()),
                many => Err(ResolveError::Ambiguous {
                    reference: reference.to_string(),
                    matches: many.len(),
                }
                .into()),
            }
        }
        .boxed()
    }

    fn statement(&mut self, table: &str, columns: &[&str], target: WriteTarget) -> &str {
        let update = matches!(target, WriteTarget::Update(_));
        let key = StatementKey {
            table: table.to_string(),
            update,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        };
        self.statements.entry(key).or_insert_with(|| {
            if update {
                update_sql(table, columns)
            } else {
                insert_sql(table, columns)
            }
        })
    }
}

impl RestoreStrategy for RawBulk {
    fn kind(&self) -> StrategyKind {
        StrategyKind::StrategyC
    }

    fn prepare_batch(&mut self, _record_type: &str) {
        self.id_map.clear();
    }

    async fn apply(
        &mut self,
        conn: &mut SqliteConnection,
        cx: &mut StrategyContext<'_>,
        planned: &PlannedRecord<'_>,
    ) -> Result<i64, StrategyError> {
        let table = cx.table(planned.record_type)?;
        let lookup = BulkLookup::of(cx);
        let mut row = Vec::with_capacity(planned.record.fields.len());
        for (name, value) in &planned.record.fields {
            let value = match value {
                FieldValue::Ref(Reference::Natural(reference)) => {
                    SqlValue::Integer(self.resolve(&mut *conn, lookup, reference).await?)
                }
                FieldValue::Ref(Reference::Surrogate(bare)) => SqlValue::Integer(lookup.remapped(bare)?),
                scalar => SqlValue::from_scalar(scalar).unwrap_or(SqlValue::Null),
            };
            row.push((name.clone(), value));
        }

        if let WriteTarget::Update(id) = planned.target {
            if row.is_empty() {
                return Ok(id);
            }
        }
        let columns: Vec<&str> = row.iter().map(|(name, _)| name.as_str()).collect();
        let sql = self.statement(&table.name, &columns, planned.target);
        Ok(execute_write(conn, sql, &row, planned.target).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{NaturalKeyRegistry, PackageIndex, ResolutionCache, SourceIdMap};
    use crate::model::{Record, SurrogateReference};
    use crate::restore::access::DataAccessLayer;
    use crate::schema::SchemaCatalog;
    use sqlx::Connection;

    #[test]
    fn canonical_keys_compare_integral_reals_as_integers() {
        assert_eq!(
            canonical(&[SqlValue::Real(3.0), SqlValue::Text("a".into())]),
            canonical(&[SqlValue::Integer(3), SqlValue::Text("a".into())])
        );
        assert_ne!(canonical(&[SqlValue::Null]), canonical(&[SqlValue::Text("NULL".into())]));
    }

    #[tokio::test]
    async fn writes_raw_values_and_maps_surrogates() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE accounts (id INTEGER PRIMARY KEY, username TEXT NOT NULL);
             CREATE TABLE documents (
                 id INTEGER PRIMARY KEY,
                 reference TEXT NOT NULL,
                 author_id INTEGER REFERENCES accounts(id),
                 reviewer_id INTEGER REFERENCES accounts(id),
                 page_count INTEGER
             );
             INSERT INTO accounts (id, username) VALUES (5, 'alice'), (6, 'bob');",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        let catalog = SchemaCatalog::load(&mut conn).await.unwrap();
        let registry = NaturalKeyRegistry::with_defaults();
        let index = PackageIndex::default();
        let access = DataAccessLayer::default();
        let mut cache = ResolutionCache::new();
        let mut source_ids = SourceIdMap::new();
        source_ids.record("accounts", 77, 6);
        let mut cx = StrategyContext {
            registry: &registry,
            catalog: &catalog,
            index: &index,
            access: &access,
            cache: &mut cache,
            source_ids: &source_ids,
        };

        let mut strategy = RawBulk::default();
        strategy.prepare_batch("documents");
        let record = Record::new(Some(1))
            .with_field("reference", FieldValue::text("D-9"))
            .with_field(
                "author_id",
                NaturalKeyReference::new("accounts")
                    .with("username", FieldValue::text("alice"))
                    .into(),
            )
            .with_field(
                "reviewer_id",
                FieldValue::Ref(Reference::Surrogate(SurrogateReference {
                    record_type: "accounts".into(),
                    id: 77,
                })),
            )
            .with_field("page_count", FieldValue::text("n/a"));
        let planned = PlannedRecord {
            record_type: "documents",
            record: &record,
            natural_key: None,
            target: WriteTarget::Insert,
        };
        let id = strategy.apply(&mut conn, &mut cx, &planned).await.unwrap();

        let row: (i64, i64, String) =
            sqlx::query_as("SELECT author_id, reviewer_id, page_count FROM documents WHERE id = ?1")
                .bind(id)
                .fetch_one(&mut conn)
                .await
                .unwrap();
        assert_eq!(row, (5, 6, "n/a".to_string()));
        assert_eq!(strategy.statements.len(), 1);

        let unmapped = Record::new(Some(2)).with_field(
            "author_id",
            FieldValue::Ref(Reference::Surrogate(SurrogateReference {
                record_type: "accounts".into(),
                id: 1,
            })),
        );
        let planned = PlannedRecord {
            record: &unmapped,
            ..planned
        };
        let err = strategy.apply(&mut conn, &mut cx, &planned).await.unwrap_err();
        assert!(matches!(err, StrategyError::Resolve(ResolveError::BareSurrogate { .. })));
    }

    async fn catalog_for(conn: &mut SqliteConnection, ddl: &str) -> SchemaCatalog {
        sqlx::query(ddl).execute(&mut *conn).await.unwrap();
        SchemaCatalog::load(conn).await.unwrap()
    }

    #[tokio::test]
    async fn resolves_through_the_bulk_map_not_the_live_cache() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let catalog = catalog_for(
            &mut conn,
            "CREATE TABLE accounts (id INTEGER PRIMARY KEY, username TEXT NOT NULL);
             CREATE TABLE documents (
                 id INTEGER PRIMARY KEY,
                 reference TEXT NOT NULL,
                 author_id INTEGER REFERENCES accounts(id)
             );
             INSERT INTO accounts (id, username) VALUES (5, 'alice'), (9, 'mallory');",
        )
        .await;
        let registry = NaturalKeyRegistry::with_defaults();
        let index = PackageIndex::default();
        let access = DataAccessLayer::default();
        let source_ids = SourceIdMap::new();
        let alice = NaturalKeyReference::new("accounts").with("username", FieldValue::text("alice"));
        let mut cache = ResolutionCache::new();
        cache.record(&alice, 9);
        let mut cx = StrategyContext {
            registry: &registry,
            catalog: &catalog,
            index: &index,
            access: &access,
            cache: &mut cache,
            source_ids: &source_ids,
        };

        let mut strategy = RawBulk::default();
        strategy.prepare_batch("documents");
        let record = Record::new(Some(1))
            .with_field("reference", FieldValue::text("D-1"))
            .with_field("author_id", alice.clone().into());
        let planned = PlannedRecord {
            record_type: "documents",
            record: &record,
            natural_key: None,
            target: WriteTarget::Insert,
        };
        let id = strategy.apply(&mut conn, &mut cx, &planned).await.unwrap();

        let author: i64 = sqlx::query_scalar("SELECT author_id FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(author, 5);
        assert_eq!(cache.get(&alice), Some(9));
    }

    #[tokio::test]
    async fn key_values_match_with_column_affinity() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let catalog = catalog_for(
            &mut conn,
            "CREATE TABLE document_types (id INTEGER PRIMARY KEY, code TEXT NOT NULL);
             CREATE TABLE workflow_states (id INTEGER PRIMARY KEY, code INTEGER NOT NULL);
             INSERT INTO document_types (id, code) VALUES (3, '7');
             INSERT INTO workflow_states (id, code) VALUES (4, 12);",
        )
        .await;
        let registry = NaturalKeyRegistry::with_defaults();
        let index = PackageIndex::default();
        let access = DataAccessLayer::default();
        let source_ids = SourceIdMap::new();
        let mut cache = ResolutionCache::new();
        let cx = StrategyContext {
            registry: &registry,
            catalog: &catalog,
            index: &index,
            access: &access,
            cache: &mut cache,
            source_ids: &source_ids,
        };
        let lookup = BulkLookup::of(&cx);
        let mut strategy = RawBulk::default();
        strategy.prepare_batch("documents");

        let numeric_code = NaturalKeyReference::new("document_types").with("code", FieldValue::Integer(7));
        assert_eq!(strategy.resolve(&mut conn, lookup, &numeric_code).await.unwrap(), 3);
        let text_code = NaturalKeyReference::new("workflow_states").with("code", FieldValue::text("12"));
        assert_eq!(strategy.resolve(&mut conn, lookup, &text_code).await.unwrap(), 4);

        // Rows written after the slot was loaded are found on reload.
        sqlx::query("INSERT INTO document_types (id, code) VALUES (8, 'memo')")
            .execute(&mut conn)
            .await
            .unwrap();
        let memo = NaturalKeyReference::new("document_types").with("code", FieldValue::text("memo"));
        assert_eq!(strategy.resolve(&mut conn, lookup, &memo).await.unwrap(), 8);
    }
}
