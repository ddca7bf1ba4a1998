use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use serde::Serialize;

use super::BackupPackage;
use crate::keys::{NaturalKeyRegistry, PackageIndex};
use crate::model::{FieldValue, Reference};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Source id with no natural key; cannot be re-linked safely.
    BareSurrogate,
    /// Target not in the package; must already exist at the destination.
    External,
    /// Key derived by the fallback rather than a declared spec.
    Heuristic,
    /// Record with no derivable key; every restore inserts it again.
    NoNaturalKey,
    /// Declared key field missing or null.
    IncompleteKey,
    /// Natural key repeated inside one batch; lookups will be ambiguous.
    DuplicateKey,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceIssue {
    pub record_type: String,
    pub source_id: Option<i64>,
    pub field: Option<String>,
    pub kind: IssueKind,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeSummary {
    pub records: u64,
    pub natural_refs: u64,
    pub bare_refs: u64,
    pub external_refs: u64,
    pub heuristic_refs: u64,
    pub keyless_records: u64,
    pub incomplete_keys: u64,
    pub duplicate_keys: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSummary {
    pub format_version: u32,
    pub app_version: String,
    pub created_at: String,
    pub total_records: u64,
    pub types: BTreeMap<String, TypeSummary>,
    pub issues: Vec<ReferenceIssue>,
}

impl PackageSummary {
    /// No reference would be refused for lacking a natural key.
    pub fn is_clean(&self) -> bool {
        self.types.values().all(|t| t.bare_refs == 0)
    }

    pub fn render_human(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Package format v{} from app {} created {}",
            self.format_version, self.app_version, self.created_at
        );
        let _ = writeln!(out, "{} records", self.total_records);
        let _ = writeln!(
            out,
            "{:<24} {:>8} {:>8} {:>6} {:>9} {:>10} {:>8} {:>11} {:>10}",
            "Type", "Records", "Natural", "Bare", "External", "Heuristic", "Keyless", "Incomplete",
            "Duplicate"
        );
        for (record_type, t) in &self.types {
            let _ = writeln!(
                out,
                "{:<24} {:>8} {:>8} {:>6} {:>9} {:>10} {:>8} {:>11} {:>10}",
                record_type,
                t.records,
                t.natural_refs,
                t.bare_refs,
                t.external_refs,
                t.heuristic_refs,
                t.keyless_records,
                t.incomplete_keys,
                t.duplicate_keys
            );
        }
        if !self.issues.is_empty() {
            let _ = writeln!(out, "\nIssues:");
            for issue in &self.issues {
                let id = issue
                    .source_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".into());
                let _ = writeln!(
                    out,
                    "  {:?} {}#{} {} -> {}",
                    issue.kind,
                    issue.record_type,
                    id,
                    issue.field.as_deref().unwrap_or("-"),
                    issue.target
                );
            }
        }
        out
    }
}

/// Offline pre-flight: what a restore of `package` would need from the
/// destination, without touching one.
pub fn dry_run_summarize(package: &BackupPackage, registry: &NaturalKeyRegistry) -> PackageSummary {
    let index = PackageIndex::build(package.batches(), registry);
    let mut types = BTreeMap::new();
    let mut issues = Vec::new();

    for batch in package.batches() {
        let mut summary = TypeSummary {
            records: batch.len() as u64,
            ..TypeSummary::default()
        };
        let mut seen_keys: HashMap<String, Option<i64>> = HashMap::new();
        for record in &batch.records {
            let record_issue = |kind, target| ReferenceIssue {
                record_type: batch.record_type.clone(),
                source_id: record.source_id,
                field: None,
                kind,
                target,
            };

            let gaps: Vec<&str> = registry
                .spec(&batch.record_type)
                .map(|spec| {
                    spec.fields()
                        .iter()
                        .filter(|f| record.field(f.as_str()).map_or(true, FieldValue::is_null))
                        .map(String::as_str)
                        .collect()
                })
                .unwrap_or_default();
            if !gaps.is_empty() {
                summary.incomplete_keys += 1;
                issues.push(record_issue(
                    IssueKind::IncompleteKey,
                    format!("{} lacks {}", record.label(&batch.record_type), gaps.join(", ")),
                ));
            }

            match registry.natural_key(&batch.record_type, record) {
                Some(key) => {
                    if key.heuristic {
                        issues.push(record_issue(IssueKind::Heuristic, key.to_string()));
                    }
                    let rendered = key.to_string();
                    if let Some(first) = seen_keys.get(&rendered) {
                        summary.duplicate_keys += 1;
                        let first = first.map(|id| format!(" (first at #{id})")).unwrap_or_default();
                        issues.push(record_issue(IssueKind::DuplicateKey, format!("{rendered}{first}")));
                    } else {
                        seen_keys.insert(rendered, record.source_id);
                    }
                }
                None => {
                    summary.keyless_records += 1;
                    issues.push(record_issue(
                        IssueKind::NoNaturalKey,
                        record.label(&batch.record_type),
                    ));
                }
            }

            for (field, reference) in record.references() {
                let issue = |kind| ReferenceIssue {
                    record_type: batch.record_type.clone(),
                    source_id: record.source_id,
                    field: Some(field.to_string()),
                    kind,
                    target: reference.to_string(),
                };
                match reference {
                    Reference::Surrogate(_) => {
                        summary.bare_refs += 1;
                        issues.push(issue(IssueKind::BareSurrogate));
                    }
                    Reference::Natural(natural) => {
                        summary.natural_refs += 1;
                        if natural.heuristic {
                            summary.heuristic_refs += 1;
                            issues.push(issue(IssueKind::Heuristic));
                        }
                        if !index.contains(natural) {
                            summary.external_refs += 1;
                            issues.push(issue(IssueKind::External));
                        }
                        if natural.key.iter().any(|c| {
                            matches!(c.value, FieldValue::Ref(Reference::Surrogate(_)))
                        }) {
                            summary.bare_refs += 1;
                            issues.push(issue(IssueKind::BareSurrogate));
                        }
                    }
                }
            }
        }
        types.insert(batch.record_type.clone(), summary);
    }

    PackageSummary {
        format_version: package.manifest().format_version,
        app_version: package.manifest().app_version.clone(),
        created_at: package.manifest().created_at.clone(),
        total_records: package.total_records() as u64,
        types,
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NaturalKeyReference, Record, RecordBatch, SurrogateReference};
    use crate::package::Manifest;

    #[test]
    fn summary_flags_bare_external_and_heuristic_references() {
        let alice = NaturalKeyReference::new("accounts").with("username", FieldValue::text("alice"));
        let ghost = NaturalKeyReference::new("accounts").with("username", FieldValue::text("ghost"));
        let mut tag = NaturalKeyReference::new("tags").with("name", FieldValue::text("urgent"));
        tag.heuristic = true;

        let package = BackupPackage::seal(
            Manifest::new("0.3.0", None),
            vec![
                RecordBatch::new(
                    "accounts",
                    vec![Record::new(Some(1)).with_field("username", FieldValue::text("alice"))],
                ),
                RecordBatch::new(
                    "documents",
                    vec![
                        Record::new(Some(1))
                            .with_field("reference", FieldValue::text("D-1"))
                            .with_field("author_id", alice.into())
                            .with_field("reviewer_id", ghost.into())
                            .with_field("tag_id", tag.into()),
                        Record::new(Some(2))
                            .with_field("reference", FieldValue::text("D-2"))
                            .with_field(
                                "author_id",
                                FieldValue::Ref(Reference::Surrogate(SurrogateReference {
                                    record_type: "accounts".into(),
                                    id: 9,
                                })),
                            ),
                    ],
                ),
            ],
        )
        .unwrap();

        let summary = dry_run_summarize(&package, &NaturalKeyRegistry::with_defaults());
        assert_eq!(summary.total_records, 3);
        assert!(!summary.is_clean());
        let docs = &summary.types["documents"];
        assert_eq!(docs.records, 2);
        assert_eq!(docs.natural_refs, 3);
        assert_eq!(docs.bare_refs, 1);
        // ghost and the heuristic tag are both outside the package
        assert_eq!(docs.external_refs, 2);
        assert_eq!(docs.heuristic_refs, 1);
        assert!(summary
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::BareSurrogate && i.field.as_deref() == Some("author_id")));
        assert!(summary.render_human().contains("documents"));
    }
}
