use std::collections::BTreeMap;

use sqlx::{Row, SqliteConnection};

use crate::db::quote_ident;
use crate::model::SqlValue;

/// SQLite column affinity, derived from the declared type with the same
/// rules SQLite applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl Affinity {
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            Affinity::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Affinity::Text
        } else if upper.is_empty() || upper.contains("BLOB") {
            Affinity::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }

    /// Whether a value of this storage class is stored without conversion.
    pub fn accepts(self, value: &SqlValue) -> bool {
        match (self, value) {
            (_, SqlValue::Null) => true,
            (Affinity::Blob, _) => true,
            (Affinity::Integer, SqlValue::Integer(_)) => true,
            (Affinity::Real, SqlValue::Real(_) | SqlValue::Integer(_)) => true,
            (Affinity::Numeric, SqlValue::Real(_) | SqlValue::Integer(_)) => true,
            (Affinity::Text, SqlValue::Text(_)) => true,
            _ => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Affinity::Integer => "INTEGER",
            Affinity::Text => "TEXT",
            Affinity::Blob => "BLOB",
            Affinity::Real => "REAL",
            Affinity::Numeric => "NUMERIC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub affinity: Affinity,
    pub not_null: bool,
    pub has_default: bool,
    pub primary_key: bool,
}

impl ColumnInfo {
    /// Column a row must supply for an insert to succeed.
    pub fn is_required(&self) -> bool {
        self.not_null && !self.has_default && !self.primary_key
    }
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    /// Column -> referenced table, for foreign keys that point at the
    /// referenced table's rowid.
    pub foreign_keys: BTreeMap<String, String>,
    /// `INTEGER PRIMARY KEY` column aliasing the rowid, if any.
    pub rowid_alias: Option<String>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn foreign_key(&self, column: &str) -> Option<&str> {
        self.foreign_keys.get(column).map(String::as_str)
    }

    pub fn required_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| c.is_required())
    }
}

/// Snapshot of the tables of one database, read through PRAGMA
/// introspection.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaCatalog {
    pub async fn load(conn: &mut SqliteConnection) -> Result<Self, sqlx::Error> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut tables = BTreeMap::new();
        for name in names {
            let table = load_table(conn, &name).await?;
            tables.insert(name, table);
        }

        tracing::debug!(target: "dossier", event = "schema_loaded", tables = tables.len());
        Ok(Self { tables })
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }
}

async fn load_table(conn: &mut SqliteConnection, name: &str) -> Result<TableSchema, sqlx::Error> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(name)))
        .fetch_all(&mut *conn)
        .await?;

    let mut columns = Vec::with_capacity(rows.len());
    let mut pk_columns = Vec::new();
    for row in rows {
        let column_name: String = row.try_get("name")?;
        let declared_type: String = row.try_get::<Option<String>, _>("type")?.unwrap_or_default();
        let not_null: i64 = row.try_get("notnull")?;
        let default: Option<String> = row.try_get("dflt_value")?;
        let pk: i64 = row.try_get("pk")?;
        if pk > 0 {
            pk_columns.push((column_name.clone(), declared_type.clone()));
        }
        columns.push(ColumnInfo {
            affinity: Affinity::from_declared(&declared_type),
            name: column_name,
            declared_type,
            not_null: not_null != 0,
            has_default: default.is_some(),
            primary_key: pk > 0,
        });
    }

    let rowid_alias = match pk_columns.as_slice() {
        [(column, declared)] if declared.eq_ignore_ascii_case("INTEGER") => Some(column.clone()),
        _ => None,
    };
    // Composite primary keys are ordinary required columns.
    if rowid_alias.is_none() {
        for column in &mut columns {
            column.primary_key = false;
        }
    }

    let fk_rows = sqlx::query(&format!("PRAGMA foreign_key_list({})", quote_ident(name)))
        .fetch_all(&mut *conn)
        .await?;
    let mut multi_column = std::collections::BTreeSet::new();
    let mut candidates = Vec::new();
    for row in fk_rows {
        let id: i64 = row.try_get("id")?;
        let seq: i64 = row.try_get("seq")?;
        if seq > 0 {
            multi_column.insert(id);
            continue;
        }
        let target: String = row.try_get("table")?;
        let from: String = row.try_get("from")?;
        let to: Option<String> = row.try_get("to")?;
        candidates.push((id, from, target, to));
    }

    let mut foreign_keys = BTreeMap::new();
    for (id, from, target, to) in candidates {
        if multi_column.contains(&id) {
            continue;
        }
        let points_at_rowid = match to.as_deref() {
            None | Some("") | Some("rowid") => true,
            Some(column) => {
                let target_alias: Option<String> = if target == name {
                    rowid_alias.clone()
                } else {
                    target_rowid_alias(conn, &target).await?
                };
                target_alias.as_deref() == Some(column)
            }
        };
        if points_at_rowid {
            foreign_keys.insert(from, target);
        }
    }

    Ok(TableSchema {
        name: name.to_string(),
        columns,
        foreign_keys,
        rowid_alias,
    })
}

async fn target_rowid_alias(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Option<String>, sqlx::Error> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
        .fetch_all(&mut *conn)
        .await?;
    let mut pks = Vec::new();
    for row in rows {
        let pk: i64 = row.try_get("pk")?;
        if pk > 0 {
            let column: String = row.try_get("name")?;
            let declared: String = row.try_get::<Option<String>, _>("type")?.unwrap_or_default();
            pks.push((column, declared));
        }
    }
    Ok(match pks.as_slice() {
        [(column, declared)] if declared.eq_ignore_ascii_case("INTEGER") => Some(column.clone()),
        _ => None,
    })
}
