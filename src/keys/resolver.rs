use std::collections::{BTreeSet, HashSet};

use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::SqliteConnection;
use thiserror::Error;

use super::cache::{CacheKey, ResolutionCache};
use super::registry::NaturalKeyRegistry;
use crate::db::quote_ident;
use crate::model::{FieldValue, NaturalKeyReference, RecordBatch, Reference, SqlValue};
use crate::schema::SchemaCatalog;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unresolved reference {reference}: {reason}")]
    Unresolved { reference: String, reason: String },
    #[error("ambiguous reference {reference}: {matches} destination records match")]
    Ambiguous { reference: String, matches: usize },
    #[error("reference {reference} targets a record of this package that is not restored yet")]
    Pending { reference: String },
    #[error("record type {0} has no destination table")]
    UnknownType(String),
    #[error("bare surrogate reference {reference} cannot be resolved by natural key")]
    BareSurrogate { reference: String },
    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),
}

impl ResolveError {
    pub fn is_pending(&self) -> bool {
        matches!(self, ResolveError::Pending { .. })
    }
}

/// Natural keys carried by a package, used to tell a forward reference
/// from one that has to pre-exist at the destination.
#[derive(Debug, Default)]
pub struct PackageIndex {
    keys: HashSet<CacheKey>,
}

impl PackageIndex {
    pub fn build(batches: &[RecordBatch], registry: &NaturalKeyRegistry) -> Self {
        let mut index = Self::default();
        for batch in batches {
            for record in &batch.records {
                if let Some(key) = registry.natural_key(&batch.record_type, record) {
                    index.keys.insert(CacheKey::of(&key));
                }
            }
        }
        index
    }

    /// Restricts the index to `types`, as a partial restore only creates
    /// records of those types.
    pub fn retain_types(&mut self, types: &BTreeSet<String>) {
        self.keys.retain(|key| types.contains(&key.record_type));
    }

    pub fn contains(&self, reference: &NaturalKeyReference) -> bool {
        self.keys.contains(&CacheKey::of(reference))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Resolves natural-key references against the destination, going
/// through the run's cache first.
pub struct Resolver<'a> {
    registry: &'a NaturalKeyRegistry,
    catalog: &'a SchemaCatalog,
    index: &'a PackageIndex,
    cache: &'a mut ResolutionCache,
}

impl<'a> Resolver<'a> {
    pub fn new(
        registry: &'a NaturalKeyRegistry,
        catalog: &'a SchemaCatalog,
        index: &'a PackageIndex,
        cache: &'a mut ResolutionCache,
    ) -> Self {
        Self {
            registry,
            catalog,
            index,
            cache,
        }
    }

    /// Destination id for `reference`. Zero matches is `Pending` when the
    /// package carries the key and `Unresolved` otherwise.
    pub fn resolve<'s>(
        &'s mut self,
        conn: &'s mut SqliteConnection,
        reference: &'s NaturalKeyReference,
    ) -> BoxFuture<'s, Result<i64, ResolveError>> {
        async move {
            match self.lookup(conn, reference).await? {
                Some(id) => Ok(id),
                None if self.index.contains(reference) => Err(ResolveError::Pending {
                    reference: reference.to_string(),
                }),
                None => Err(ResolveError::Unresolved {
                    reference: reference.to_string(),
                    reason: "no destination record matches and the package does not carry it"
                        .into(),
                }),
            }
        }
        .boxed()
    }

    /// Like `resolve`, but zero matches is `Ok(None)`. Used to detect a
    /// record that already exists at the destination.
    pub async fn lookup(
        &mut self,
        conn: &mut SqliteConnection,
        reference: &NaturalKeyReference,
    ) -> Result<Option<i64>, ResolveError> {
        if let Some(id) = self.cache.get(reference) {
            return Ok(Some(id));
        }
        self.registry
            .check_reference(reference)
            .map_err(|reason| ResolveError::Unresolved {
                reference: reference.to_string(),
                reason,
            })?;

        let values = self.key_values(conn, reference).await?;
        let ids = self.find(conn, reference, &values).await?;
        match ids.as_slice() {
            [] => Ok(None),
            [id] => {
                let id = self.cache.record(reference, *id);
                tracing::debug!(
                    target: "dossier",
                    event = "reference_resolved",
                    reference = %reference,
                    id
                );
                Ok(Some(id))
            }
            many if reference.heuristic => Err(ResolveError::Unresolved {
                reference: reference.to_string(),
                reason: format!("heuristic key matches {} destination records", many.len()),
            }),
            many => Err(ResolveError::Ambiguous {
                reference: reference.to_string(),
                matches: many.len(),
            }),
        }
    }

    /// Key components as stored values; nested references become the id
    /// they resolve to.
    pub async fn key_values(
        &mut self,
        conn: &mut SqliteConnection,
        reference: &NaturalKeyReference,
    ) -> Result<Vec<(String, SqlValue)>, ResolveError> {
        let mut values = Vec::with_capacity(reference.key.len());
        for component in &reference.key {
            let value = self.field_value(conn, &component.value).await?;
            values.push((component.field.clone(), value));
        }
        Ok(values)
    }

    /// Converts one field value to what the destination stores.
    pub async fn field_value(
        &mut self,
        conn: &mut SqliteConnection,
        value: &FieldValue,
    ) -> Result<SqlValue, ResolveError> {
        match value {
            FieldValue::Ref(Reference::Natural(nested)) => {
                Ok(SqlValue::Integer(self.resolve(conn, nested).await?))
            }
            FieldValue::Ref(Reference::Surrogate(bare)) => Err(ResolveError::BareSurrogate {
                reference: bare.to_string(),
            }),
            scalar => Ok(SqlValue::from_scalar(scalar).unwrap_or(SqlValue::Null)),
        }
    }

    async fn find(
        &self,
        conn: &mut SqliteConnection,
        reference: &NaturalKeyReference,
        values: &[(String, SqlValue)],
    ) -> Result<Vec<i64>, ResolveError> {
        let table = self
            .catalog
            .table(&reference.record_type)
            .ok_or_else(|| ResolveError::UnknownType(reference.record_type.clone()))?;
        if values.is_empty() {
            return Err(ResolveError::Unresolved {
                reference: reference.to_string(),
                reason: "reference has no key components".into(),
            });
        }
        if let Some((missing, _)) = values.iter().find(|(field, _)| !table.has_column(field)) {
            return Err(ResolveError::Unresolved {
                reference: reference.to_string(),
                reason: format!("destination table {} has no column {missing}", table.name),
            });
        }

        let clauses: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(idx, (field, _))| format!("{} IS ?{}", quote_ident(field), idx + 1))
            .collect();
        let sql = format!(
            "SELECT rowid FROM {} WHERE {} ORDER BY rowid",
            quote_ident(&table.name),
            clauses.join(" AND ")
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for (_, value) in values {
            query = bind_scalar(query, value);
        }
        Ok(query.fetch_all(&mut *conn).await?)
    }
}

fn bind_scalar<'q>(
    query: sqlx::query::QueryScalar<'q, sqlx::Sqlite, i64, sqlx::sqlite::SqliteArguments<'q>>,
    value: &SqlValue,
) -> sqlx::query::QueryScalar<'q, sqlx::Sqlite, i64, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(Option::<i64>::None),
        SqlValue::Integer(v) => query.bind(*v),
        SqlValue::Real(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Blob(v) => query.bind(v.clone()),
    }
}
