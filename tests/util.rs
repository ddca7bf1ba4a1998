#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::path::Path;

use anyhow::Result;
use dossier_lib::db::open_sqlite_pool;
use dossier_lib::model::{FieldValue, NaturalKeyReference, Record, RecordBatch};
use dossier_lib::package::{BackupPackage, Manifest};
use sqlx::SqlitePool;

pub const SCHEMA: &str = "
CREATE TABLE accounts (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL,
    email TEXT
);
CREATE TABLE roles (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT
);
CREATE TABLE memberships (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    role_id INTEGER NOT NULL REFERENCES roles(id)
);
CREATE TABLE workflow_states (
    id INTEGER PRIMARY KEY,
    code TEXT NOT NULL,
    label TEXT
);
CREATE TABLE documents (
    id INTEGER PRIMARY KEY,
    reference TEXT NOT NULL,
    title TEXT,
    slug TEXT,
    author_id INTEGER REFERENCES accounts(id),
    state_id INTEGER REFERENCES workflow_states(id),
    page_count INTEGER,
    supersedes_id INTEGER REFERENCES documents(id)
);
CREATE TABLE audit_records (
    id INTEGER PRIMARY KEY,
    actor_id INTEGER REFERENCES accounts(id),
    action TEXT NOT NULL,
    occurred_at TEXT NOT NULL
);
";

/// A file-backed store with the fixture schema and no rows.
pub async fn create_store(path: &Path) -> Result<SqlitePool> {
    let pool = open_sqlite_pool(path, true).await?;
    sqlx::query(SCHEMA).execute(&pool).await?;
    Ok(pool)
}

/// Source rows whose ids collide with whatever a destination holds.
pub async fn seed_source(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "INSERT INTO accounts (id, username, email) VALUES
             (1, 'alice', 'alice@example.com'),
             (2, 'bob', NULL);
         INSERT INTO roles (id, name, description) VALUES
             (1, 'admin', 'Full access'),
             (2, 'editor', NULL);
         INSERT INTO memberships (account_id, role_id) VALUES (1, 1), (2, 2);
         INSERT INTO workflow_states (id, code, label) VALUES (1, 'draft', 'Draft'), (2, 'published', 'Published');
         INSERT INTO documents (reference, title, slug, author_id, state_id, page_count)
             VALUES ('D-1', 'Annual Report', 'annual-report', 1, 2, 12),
                    ('D-2', 'Style Guide', 'style-guide', 2, 1, NULL);
         INSERT INTO audit_records (actor_id, action, occurred_at)
             VALUES (1, 'publish', '2024-01-01T00:00:00Z');",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Unrelated rows that push every destination id away from the source's.
pub async fn seed_destination(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "INSERT INTO accounts (username) VALUES ('zed'), ('yan');
         INSERT INTO roles (name) VALUES ('guest');
         INSERT INTO workflow_states (code) VALUES ('archived');",
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

/// (username, role name) for every membership, sorted.
pub async fn membership_pairs(pool: &SqlitePool) -> Vec<(String, String)> {
    sqlx::query_as(
        "SELECT a.username, r.name FROM memberships m
         JOIN accounts a ON a.id = m.account_id
         JOIN roles r ON r.id = m.role_id
         ORDER BY a.username, r.name",
    )
    .fetch_all(pool)
    .await
    .unwrap()
}

pub fn account_ref(username: &str) -> NaturalKeyReference {
    NaturalKeyReference::new("accounts").with("username", FieldValue::text(username))
}

pub fn role_ref(name: &str) -> NaturalKeyReference {
    NaturalKeyReference::new("roles").with("name", FieldValue::text(name))
}

pub fn document_ref(reference: &str) -> NaturalKeyReference {
    NaturalKeyReference::new("documents").with("reference", FieldValue::text(reference))
}

pub fn account(id: i64, username: &str) -> Record {
    Record::new(Some(id)).with_field("username", FieldValue::text(username))
}

pub fn membership(id: i64, username: &str, role: &str) -> Record {
    Record::new(Some(id))
        .with_field("account_id", account_ref(username).into())
        .with_field("role_id", role_ref(role).into())
}

pub fn document(id: i64, reference: &str, title: &str) -> Record {
    Record::new(Some(id))
        .with_field("reference", FieldValue::text(reference))
        .with_field("title", FieldValue::text(title))
}

pub fn package(batches: Vec<RecordBatch>) -> BackupPackage {
    BackupPackage::seal(Manifest::new("0.1.0", Some("fixture".into())), batches).unwrap()
}
