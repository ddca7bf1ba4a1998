use std::path::Path;

use anyhow::{Context, Result as AnyResult};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{ConnectOptions, Pool, Row, Sqlite, TypeInfo, ValueRef};

use crate::model::SqlValue;

/// Opens a destination or source database with the pragmas every run
/// relies on. A restore holds one connection for its whole duration.
pub async fn open_sqlite_pool(db_path: &Path, create: bool) -> AnyResult<Pool<Sqlite>> {
    if create {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    target: "dossier",
                    event = "db_dir_create_failed",
                    error = %e,
                    path = %parent.display()
                );
                e
            })?;
        }
    }
    tracing::info!(target: "dossier", event = "db_path", path = %db_path.display());

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .log_statements(log::LevelFilter::Off);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA wal_autocheckpoint = 1000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(options)
        .await
        .with_context(|| format!("open sqlite database at {}", db_path.display()))?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    use tracing::{info, warn};

    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "dossier",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        foreign_keys = %fks.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "dossier",
            event = "db_open_warning",
            msg = "journal_mode != WAL; export snapshots block writers"
        );
    }
}

pub fn quote_ident(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Decodes column `index` by its runtime storage class rather than the
/// declared type, so rows from tables with loose affinity survive intact.
pub fn decode_column(row: &SqliteRow, index: usize) -> Result<SqlValue, sqlx::Error> {
    let class = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(SqlValue::Null);
        }
        raw.type_info().name().to_ascii_uppercase()
    };
    let value = match class.as_str() {
        "INTEGER" | "BOOLEAN" => SqlValue::Integer(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" => SqlValue::Real(row.try_get_unchecked::<f64, _>(index)?),
        "BLOB" => SqlValue::Blob(row.try_get_unchecked::<Vec<u8>, _>(index)?),
        _ => SqlValue::Text(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}

pub fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(Option::<i64>::None),
        SqlValue::Integer(v) => query.bind(*v),
        SqlValue::Real(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Blob(v) => query.bind(v.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn decode_follows_storage_class() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query("CREATE TABLE loose (v INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        for value in [
            SqlValue::Integer(5),
            SqlValue::Text("n/a".into()),
            SqlValue::Real(1.5),
            SqlValue::Blob(vec![0, 1]),
            SqlValue::Null,
        ] {
            bind_value(sqlx::query("INSERT INTO loose (v) VALUES (?1)"), &value)
                .execute(&pool)
                .await
                .unwrap();
        }
        let rows = sqlx::query("SELECT v FROM loose ORDER BY rowid")
            .fetch_all(&pool)
            .await
            .unwrap();
        let decoded: Vec<SqlValue> = rows.iter().map(|r| decode_column(r, 0).unwrap()).collect();
        assert_eq!(
            decoded,
            vec![
                SqlValue::Integer(5),
                SqlValue::Text("n/a".into()),
                SqlValue::Real(1.5),
                SqlValue::Blob(vec![0, 1]),
                SqlValue::Null,
            ]
        );
    }
}
