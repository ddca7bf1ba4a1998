use sqlx::SqliteConnection;

use super::{
    resolve_fields, write_row, PlannedRecord, RestoreStrategy, StrategyContext, StrategyError, StrategyKind,
};
use crate::model::SqlValue;
use crate::schema::{Affinity, ColumnInfo};

/// Strategy B: assigns fields straight onto destination columns. Fields
/// with no column are dropped and lossless conversions are applied; no
/// rules or hooks run.
#[derive(Debug, Default)]
pub struct DirectConstruct;

impl RestoreStrategy for DirectConstruct {
    fn kind(&self) -> StrategyKind {
        StrategyKind::StrategyB
    }

    async fn apply(
        &mut self,
        conn: &mut SqliteConnection,
        cx: &mut StrategyContext<'_>,
        planned: &PlannedRecord<'_>,
    ) -> Result<i64, StrategyError> {
        let table = cx.table(planned.record_type)?;
        let resolved = resolve_fields(conn, cx, planned.record).await?;
        let mut row = Vec::with_capacity(resolved.len());
        for (name, value) in resolved {
            let Some(column) = table.column(&name) else {
                continue;
            };
            let value = coerce(column, value)?;
            row.push((name, value));
        }
        Ok(write_row(conn, table, &row, planned.target).await?)
    }
}

/// Converts `value` to the column's affinity when that loses nothing.
fn coerce(column: &ColumnInfo, value: SqlValue) -> Result<SqlValue, StrategyError> {
    if column.affinity.accepts(&value) {
        return Ok(value);
    }
    let converted = match (column.affinity, &value) {
        (Affinity::Integer, SqlValue::Text(text)) => parse_integer(text)
            .map(SqlValue::Integer)
            .or_else(|| parse_real(text).and_then(integral)),
        (Affinity::Integer, SqlValue::Real(real)) => integral(*real),
        (Affinity::Real | Affinity::Numeric, SqlValue::Text(text)) => match parse_integer(text) {
            Some(int) if column.affinity == Affinity::Real => Some(SqlValue::Real(int as f64)),
            Some(int) => Some(SqlValue::Integer(int)),
            None => parse_real(text).map(SqlValue::Real),
        },
        (Affinity::Text, SqlValue::Integer(int)) => Some(SqlValue::Text(int.to_string())),
        (Affinity::Text, SqlValue::Real(real)) => Some(SqlValue::Text(real.to_string())),
        _ => None,
    };
    converted.ok_or_else(|| StrategyError::TypeMismatch {
        column: column.name.clone(),
        expected: column.affinity.label().to_string(),
        actual: value.storage_class().to_string(),
    })
}

fn parse_integer(text: &str) -> Option<i64> {
    text.trim().parse().ok()
}

fn parse_real(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn integral(real: f64) -> Option<SqlValue> {
    if real.fract() == 0.0 && real >= i64::MIN as f64 && real < i64::MAX as f64 {
        Some(SqlValue::Integer(real as i64))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(declared: &str) -> ColumnInfo {
        ColumnInfo {
            name: "c".into(),
            declared_type: declared.into(),
            affinity: Affinity::from_declared(declared),
            not_null: false,
            has_default: false,
            primary_key: false,
        }
    }

    #[test]
    fn numeric_text_is_coerced_losslessly() {
        assert_eq!(
            coerce(&column("INTEGER"), SqlValue::Text(" 42 ".into())).unwrap(),
            SqlValue::Integer(42)
        );
        assert_eq!(
            coerce(&column("INTEGER"), SqlValue::Real(3.0)).unwrap(),
            SqlValue::Integer(3)
        );
        assert_eq!(
            coerce(&column("REAL"), SqlValue::Text("7".into())).unwrap(),
            SqlValue::Real(7.0)
        );
        assert_eq!(
            coerce(&column("TEXT"), SqlValue::Integer(5)).unwrap(),
            SqlValue::Text("5".into())
        );
    }

    #[test]
    fn lossy_conversions_are_type_mismatches() {
        assert!(matches!(
            coerce(&column("INTEGER"), SqlValue::Text("n/a".into())),
            Err(StrategyError::TypeMismatch { .. })
        ));
        assert!(matches!(
            coerce(&column("INTEGER"), SqlValue::Real(2.5)),
            Err(StrategyError::TypeMismatch { .. })
        ));
    }
}
