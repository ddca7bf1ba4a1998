use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{FieldValue, KeyComponent, NaturalKeyReference, Record};

/// Field names tried, in order, for types without a declared key.
pub const FALLBACK_PRIORITY: &[&str] = &["name", "code", "title", "identifier", "username"];

/// Ordered list of fields that together identify a record of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKeySpec {
    fields: Vec<String>,
}

impl NaturalKeySpec {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Declared,
    Heuristic,
}

/// The key fields chosen for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPlan {
    pub fields: Vec<String>,
    pub origin: KeyOrigin,
}

#[derive(Debug, Clone)]
pub struct NaturalKeyRegistry {
    specs: BTreeMap<String, NaturalKeySpec>,
    fallback: Vec<String>,
}

impl Default for NaturalKeyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl NaturalKeyRegistry {
    pub fn empty() -> Self {
        Self {
            specs: BTreeMap::new(),
            fallback: FALLBACK_PRIORITY.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry
            .declare("accounts", NaturalKeySpec::new(["username"]))
            .declare("roles", NaturalKeySpec::new(["name"]))
            .declare("permissions", NaturalKeySpec::new(["codename"]))
            .declare("memberships", NaturalKeySpec::new(["account_id", "role_id"]))
            .declare("role_permissions", NaturalKeySpec::new(["role_id", "permission_id"]))
            .declare("document_types", NaturalKeySpec::new(["code"]))
            .declare("workflow_states", NaturalKeySpec::new(["code"]))
            .declare("documents", NaturalKeySpec::new(["reference"]))
            .declare("document_versions", NaturalKeySpec::new(["document_id", "version"]))
            .declare(
                "audit_records",
                NaturalKeySpec::new(["actor_id", "action", "occurred_at"]),
            );
        registry
    }

    pub fn declare(&mut self, record_type: impl Into<String>, spec: NaturalKeySpec) -> &mut Self {
        self.specs.insert(record_type.into(), spec);
        self
    }

    pub fn spec(&self, record_type: &str) -> Option<&NaturalKeySpec> {
        self.specs.get(record_type)
    }

    /// Picks the key fields for `record`. Declared specs need every field
    /// present; the fallback takes the first non-null priority field, then
    /// the first field named `*_<priority>`.
    pub fn key_plan(&self, record_type: &str, record: &Record) -> Option<KeyPlan> {
        if let Some(spec) = self.specs.get(record_type) {
            if spec.fields.is_empty() || spec.fields.iter().any(|f| !record.fields.contains_key(f)) {
                return None;
            }
            return Some(KeyPlan {
                fields: spec.fields.clone(),
                origin: KeyOrigin::Declared,
            });
        }

        let present = |name: &str| record.field(name).map_or(false, |v| !v.is_null());
        for candidate in &self.fallback {
            if present(candidate.as_str()) {
                return Some(KeyPlan {
                    fields: vec![candidate.clone()],
                    origin: KeyOrigin::Heuristic,
                });
            }
            let suffix = format!("_{candidate}");
            if let Some(name) = record
                .fields
                .keys()
                .find(|name| name.ends_with(&suffix) && present(name.as_str()))
            {
                return Some(KeyPlan {
                    fields: vec![name.clone()],
                    origin: KeyOrigin::Heuristic,
                });
            }
        }
        None
    }

    /// Builds the record's own natural key from its field values, leaving
    /// reference components as they appear in the record.
    pub fn natural_key(&self, record_type: &str, record: &Record) -> Option<NaturalKeyReference> {
        let plan = self.key_plan(record_type, record)?;
        let key = plan
            .fields
            .iter()
            .map(|field| KeyComponent {
                field: field.clone(),
                value: record.field(field).cloned().unwrap_or(FieldValue::Null),
            })
            .collect();
        Some(NaturalKeyReference {
            record_type: record_type.to_string(),
            key,
            heuristic: plan.origin == KeyOrigin::Heuristic,
        })
    }

    /// Checks that a reference to a declared type names exactly the
    /// declared fields, in order.
    pub fn check_reference(&self, reference: &NaturalKeyReference) -> Result<(), String> {
        let Some(spec) = self.specs.get(&reference.record_type) else {
            return Ok(());
        };
        let fields: Vec<&str> = reference.fields().collect();
        if fields.iter().copied().eq(spec.fields.iter().map(String::as_str)) {
            Ok(())
        } else {
            Err(format!(
                "key fields {:?} do not match declared key {:?} for {}",
                fields, spec.fields, reference.record_type
            ))
        }
    }
}
