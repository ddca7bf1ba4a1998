//! The destination's data-access layer: per-type validation rules and
//! derived-field hooks that Strategy A writes through.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::SqlValue;
use crate::schema::TableSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FieldRule {
    Required { field: String },
    Pattern { field: String, pattern: String },
    MaxLength { field: String, max: usize },
    OneOf { field: String, values: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum DerivedField {
    /// Fills `into` with a slug of `from` when absent.
    Slug { from: String, into: String },
    /// Fills `into` with the current UTC time when absent.
    Timestamp { into: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRules {
    #[serde(default)]
    pub rules: Vec<FieldRule>,
    #[serde(default)]
    pub derived: Vec<DerivedField>,
}

#[derive(Debug, Error)]
#[error("invalid pattern for {record_type}.{field}: {source}")]
pub struct RuleError {
    pub record_type: String,
    pub field: String,
    #[source]
    pub source: regex::Error,
}

/// Why the data-access layer refused a row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("column {0} does not exist")]
    UnknownColumn(String),
    #[error("required column {0} is missing")]
    MissingColumn(String),
    #[error("column {column} expects {expected}, got {actual}")]
    TypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },
    #[error("rule {rule} failed for {field}: {detail}")]
    Rule {
        rule: &'static str,
        field: String,
        detail: String,
    },
}

#[derive(Debug, Clone)]
enum CompiledRule {
    Required(String),
    Pattern(String, Regex),
    MaxLength(String, usize),
    OneOf(String, Vec<String>),
}

#[derive(Debug, Clone, Default)]
struct CompiledRules {
    checks: Vec<CompiledRule>,
    derived: Vec<DerivedField>,
}

#[derive(Debug, Clone, Default)]
pub struct DataAccessLayer {
    types: BTreeMap<String, CompiledRules>,
}

pub fn default_rules() -> BTreeMap<String, TypeRules> {
    BTreeMap::from([
        (
            "accounts".to_string(),
            TypeRules {
                rules: vec![FieldRule::Pattern {
                    field: "username".into(),
                    pattern: r"^[A-Za-z0-9_.@+-]+$".into(),
                }],
                derived: vec![],
            },
        ),
        (
            "documents".to_string(),
            TypeRules {
                rules: vec![FieldRule::Required {
                    field: "title".into(),
                }],
                derived: vec![DerivedField::Slug {
                    from: "title".into(),
                    into: "slug".into(),
                }],
            },
        ),
    ])
}

impl DataAccessLayer {
    pub fn new(rules: &BTreeMap<String, TypeRules>) -> Result<Self, RuleError> {
        let mut types = BTreeMap::new();
        for (record_type, type_rules) in rules {
            let mut checks = Vec::with_capacity(type_rules.rules.len());
            for rule in &type_rules.rules {
                checks.push(match rule {
                    FieldRule::Required { field } => CompiledRule::Required(field.clone()),
                    FieldRule::Pattern { field, pattern } => {
                        let regex = Regex::new(pattern).map_err(|source| RuleError {
                            record_type: record_type.clone(),
                            field: field.clone(),
                            source,
                        })?;
                        CompiledRule::Pattern(field.clone(), regex)
                    }
                    FieldRule::MaxLength { field, max } => {
                        CompiledRule::MaxLength(field.clone(), *max)
                    }
                    FieldRule::OneOf { field, values } => {
                        CompiledRule::OneOf(field.clone(), values.clone())
                    }
                });
            }
            types.insert(
                record_type.clone(),
                CompiledRules {
                    checks,
                    derived: type_rules.derived.clone(),
                },
            );
        }
        Ok(Self { types })
    }

    pub fn with_defaults() -> Result<Self, RuleError> {
        Self::new(&default_rules())
    }

    /// Every field must be a column whose affinity stores the value as is,
    /// and every required column must be present.
    pub fn check_schema(table: &TableSchema, row: &[(String, SqlValue)]) -> Result<(), Violation> {
        for (name, value) in row {
            let column = table
                .column(name)
                .ok_or_else(|| Violation::UnknownColumn(name.clone()))?;
            if column.not_null && value.is_null() {
                return Err(Violation::MissingColumn(name.clone()));
            }
            if !column.affinity.accepts(value) {
                return Err(Violation::TypeMismatch {
                    column: name.clone(),
                    expected: column.affinity.label().to_string(),
                    actual: value.storage_class().to_string(),
                });
            }
        }
        if let Some(missing) = table
            .required_columns()
            .find(|c| !row.iter().any(|(name, _)| name == &c.name))
        {
            return Err(Violation::MissingColumn(missing.name.clone()));
        }
        Ok(())
    }

    pub fn validate(&self, record_type: &str, row: &[(String, SqlValue)]) -> Result<(), Violation> {
        let Some(compiled) = self.types.get(record_type) else {
            return Ok(());
        };
        let lookup = |field: &str| row.iter().find(|(name, _)| name == field).map(|(_, v)| v);
        for check in &compiled.checks {
            match check {
                CompiledRule::Required(field) => match lookup(field.as_str()) {
                    Some(SqlValue::Text(text)) if text.trim().is_empty() => {
                        return Err(Violation::Rule {
                            rule: "required",
                            field: field.clone(),
                            detail: "empty text".into(),
                        })
                    }
                    Some(value) if !value.is_null() => {}
                    _ => {
                        return Err(Violation::Rule {
                            rule: "required",
                            field: field.clone(),
                            detail: "missing".into(),
                        })
                    }
                },
                CompiledRule::Pattern(field, regex) => {
                    if let Some(SqlValue::Text(text)) = lookup(field.as_str()) {
                        if !regex.is_match(text) {
                            return Err(Violation::Rule {
                                rule: "pattern",
                                field: field.clone(),
                                detail: format!("{text:?} does not match {}", regex.as_str()),
                            });
                        }
                    }
                }
                CompiledRule::MaxLength(field, max) => {
                    if let Some(SqlValue::Text(text)) = lookup(field.as_str()) {
                        let len = text.chars().count();
                        if len > *max {
                            return Err(Violation::Rule {
                                rule: "max_length",
                                field: field.clone(),
                                detail: format!("{len} characters, limit {max}"),
                            });
                        }
                    }
                }
                CompiledRule::OneOf(field, allowed) => {
                    if let Some(SqlValue::Text(text)) = lookup(field.as_str()) {
                        if !allowed.iter().any(|a| a == text) {
                            return Err(Violation::Rule {
                                rule: "one_of",
                                field: field.clone(),
                                detail: format!("{text:?} not in {allowed:?}"),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs the derived-field hooks. Only fills columns the table has and
    /// the row leaves empty.
    pub fn apply_hooks(&self, record_type: &str, table: &TableSchema, row: &mut Vec<(String, SqlValue)>) {
        let Some(compiled) = self.types.get(record_type) else {
            return;
        };
        for hook in &compiled.derived {
            let (into, value) = match hook {
                DerivedField::Slug { from, into } => {
                    let source = row.iter().find_map(|(name, v)| match v {
                        SqlValue::Text(text) if name == from => Some(slugify(text)),
                        _ => None,
                    });
                    match source {
                        Some(slug) if !slug.is_empty() => (into, SqlValue::Text(slug)),
                        _ => continue,
                    }
                }
                DerivedField::Timestamp { into } => (
                    into,
                    SqlValue::Text(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
                ),
            };
            if !table.has_column(into) {
                continue;
            }
            match row.iter_mut().find(|(name, _)| name == into) {
                Some((_, existing)) if is_blank(existing) => *existing = value,
                Some(_) => {}
                None => row.push((into.clone(), value)),
            }
        }
    }
}

fn is_blank(value: &SqlValue) -> bool {
    match value {
        SqlValue::Null => true,
        SqlValue::Text(text) => text.trim().is_empty(),
        _ => false,
    }
}

pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut dash = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            slug.extend(ch.to_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Affinity, ColumnInfo};

    fn column(name: &str, declared: &str, not_null: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            declared_type: declared.into(),
            affinity: Affinity::from_declared(declared),
            not_null,
            has_default: false,
            primary_key: false,
        }
    }

    fn documents() -> TableSchema {
        TableSchema {
            name: "documents".into(),
            columns: vec![
                column("reference", "TEXT", true),
                column("title", "TEXT", true),
                column("slug", "TEXT", false),
                column("page_count", "INTEGER", false),
            ],
            foreign_keys: BTreeMap::new(),
            rowid_alias: None,
        }
    }

    fn row(values: &[(&str, SqlValue)]) -> Vec<(String, SqlValue)> {
        values.iter().map(|(n, v)| (n.to_string(), v.clone())).collect()
    }

    #[test]
    fn schema_checks_columns_types_and_required() {
        let table = documents();
        let good = row(&[
            ("reference", SqlValue::Text("D-1".into())),
            ("title", SqlValue::Text("Plan".into())),
        ]);
        assert!(DataAccessLayer::check_schema(&table, &good).is_ok());

        let mut unknown = good.clone();
        unknown.push(("colour".into(), SqlValue::Text("red".into())));
        assert_eq!(
            DataAccessLayer::check_schema(&table, &unknown),
            Err(Violation::UnknownColumn("colour".into()))
        );

        let mut wrong = good.clone();
        wrong.push(("page_count".into(), SqlValue::Text("n/a".into())));
        assert!(matches!(
            DataAccessLayer::check_schema(&table, &wrong),
            Err(Violation::TypeMismatch { .. })
        ));

        let missing = row(&[("reference", SqlValue::Text("D-1".into()))]);
        assert_eq!(
            DataAccessLayer::check_schema(&table, &missing),
            Err(Violation::MissingColumn("title".into()))
        );
    }

    #[test]
    fn default_rules_reject_odd_usernames() {
        let layer = DataAccessLayer::with_defaults().unwrap();
        let ok = row(&[("username", SqlValue::Text("jane.doe".into()))]);
        let bad = row(&[("username", SqlValue::Text("jane doe".into()))]);
        assert!(layer.validate("accounts", &ok).is_ok());
        assert!(matches!(
            layer.validate("accounts", &bad),
            Err(Violation::Rule { rule: "pattern", .. })
        ));
    }

    #[test]
    fn configured_rules_compile_and_apply() {
        let rules = BTreeMap::from([(
            "workflow_states".to_string(),
            TypeRules {
                rules: vec![
                    FieldRule::MaxLength {
                        field: "code".into(),
                        max: 4,
                    },
                    FieldRule::OneOf {
                        field: "kind".into(),
                        values: vec!["open".into(), "closed".into()],
                    },
                ],
                derived: vec![],
            },
        )]);
        let layer = DataAccessLayer::new(&rules).unwrap();
        let long = row(&[("code", SqlValue::Text("REVIEW".into()))]);
        assert!(layer.validate("workflow_states", &long).is_err());
        let odd = row(&[
            ("code", SqlValue::Text("OPEN".into())),
            ("kind", SqlValue::Text("limbo".into())),
        ]);
        assert!(layer.validate("workflow_states", &odd).is_err());

        let broken = BTreeMap::from([(
            "x".to_string(),
            TypeRules {
                rules: vec![FieldRule::Pattern {
                    field: "f".into(),
                    pattern: "(".into(),
                }],
                derived: vec![],
            },
        )]);
        assert!(DataAccessLayer::new(&broken).is_err());
    }

    #[test]
    fn slug_hook_fills_only_blank_columns() {
        let layer = DataAccessLayer::with_defaults().unwrap();
        let table = documents();
        let mut fresh = row(&[("title", SqlValue::Text("Quarterly Plan: 2024!".into()))]);
        layer.apply_hooks("documents", &table, &mut fresh);
        assert!(fresh.contains(&("slug".to_string(), SqlValue::Text("quarterly-plan-2024".into()))));

        let mut kept = row(&[
            ("title", SqlValue::Text("Other".into())),
            ("slug", SqlValue::Text("custom".into())),
        ]);
        layer.apply_hooks("documents", &table, &mut kept);
        assert!(kept.contains(&("slug".to_string(), SqlValue::Text("custom".into()))));
    }

    #[test]
    fn rules_deserialize_from_tagged_json() {
        let parsed: TypeRules = serde_json::from_str(
            r#"{"rules":[{"rule":"max_length","field":"code","max":8}],
                "derived":[{"hook":"timestamp","into":"created_at"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.rules.len(), 1);
        assert_eq!(
            parsed.derived,
            vec![DerivedField::Timestamp {
                into: "created_at".into()
            }]
        );
    }
}
