use sqlx::SqliteConnection;

use super::{
    resolve_fields, write_row, PlannedRecord, RestoreStrategy, StrategyContext, StrategyError, StrategyKind,
};
use crate::restore::access::DataAccessLayer;

/// Strategy A: writes through the data-access layer. Rules run on the
/// incoming fields, hooks fill derived columns, and the finished row must
/// match the destination schema exactly.
#[derive(Debug, Default)]
pub struct ValidatedInsert;

impl RestoreStrategy for ValidatedInsert {
    fn kind(&self) -> StrategyKind {
        StrategyKind::StrategyA
    }

    async fn apply(
        &mut self,
        conn: &mut SqliteConnection,
        cx: &mut StrategyContext<'_>,
        planned: &PlannedRecord<'_>,
    ) -> Result<i64, StrategyError> {
        let table = cx.table(planned.record_type)?;
        let mut row = resolve_fields(conn, cx, planned.record).await?;
        cx.access.validate(planned.record_type, &row)?;
        cx.access.apply_hooks(planned.record_type, table, &mut row);
        DataAccessLayer::check_schema(table, &row)?;
        Ok(write_row(conn, table, &row, planned.target).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{NaturalKeyRegistry, PackageIndex, ResolutionCache, SourceIdMap};
    use crate::model::{FieldValue, Record};
    use crate::restore::strategy::WriteTarget;
    use crate::schema::SchemaCatalog;
    use sqlx::Connection;

    #[tokio::test]
    async fn derives_slug_and_rejects_rule_violations() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE documents (id INTEGER PRIMARY KEY, reference TEXT NOT NULL, title TEXT NOT NULL, slug TEXT);
             CREATE TABLE accounts (id INTEGER PRIMARY KEY, username TEXT NOT NULL);",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        let catalog = SchemaCatalog::load(&mut conn).await.unwrap();
        let registry = NaturalKeyRegistry::with_defaults();
        let index = PackageIndex::default();
        let access = DataAccessLayer::with_defaults().unwrap();
        let mut cache = ResolutionCache::new();
        let source_ids = SourceIdMap::new();
        let mut cx = StrategyContext {
            registry: &registry,
            catalog: &catalog,
            index: &index,
            access: &access,
            cache: &mut cache,
            source_ids: &source_ids,
        };

        let mut strategy = ValidatedInsert;
        assert_eq!(strategy.kind(), StrategyKind::StrategyA);

        let doc = Record::new(Some(1))
            .with_field("reference", FieldValue::text("D-1"))
            .with_field("title", FieldValue::text("Annual Report"));
        let planned = PlannedRecord {
            record_type: "documents",
            record: &doc,
            natural_key: None,
            target: WriteTarget::Insert,
        };
        let id = strategy.apply(&mut conn, &mut cx, &planned).await.unwrap();
        let slug: String = sqlx::query_scalar("SELECT slug FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(slug, "annual-report");

        let odd = Record::new(Some(2)).with_field("username", FieldValue::text("jane doe"));
        let planned = PlannedRecord {
            record_type: "accounts",
            record: &odd,
            natural_key: None,
            target: WriteTarget::Insert,
        };
        let err = strategy.apply(&mut conn, &mut cx, &planned).await.unwrap_err();
        assert!(matches!(err, StrategyError::Rejected { .. }));
    }
}
