use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single value carried by a record field.
///
/// Scalars map onto SQLite storage classes; `Ref` carries a foreign-key
/// pointer whose destination id is only known after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(#[serde(with = "blob_base64")] Vec<u8>),
    Ref(Reference),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            FieldValue::Ref(reference) => Some(reference),
            _ => None,
        }
    }
}

impl From<NaturalKeyReference> for FieldValue {
    fn from(reference: NaturalKeyReference) -> Self {
        FieldValue::Ref(Reference::Natural(reference))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Real(v) => write!(f, "{v:?}"),
            FieldValue::Text(v) => write!(f, "{v:?}"),
            FieldValue::Blob(bytes) => {
                f.write_str("x'")?;
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                f.write_str("'")
            }
            FieldValue::Ref(reference) => write!(f, "{reference}"),
        }
    }
}

/// Tagged pointer to another record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reference {
    Natural(NaturalKeyReference),
    /// Source-environment id; meaningless at the destination.
    Surrogate(SurrogateReference),
}

impl Reference {
    pub fn record_type(&self) -> &str {
        match self {
            Reference::Natural(reference) => &reference.record_type,
            Reference::Surrogate(reference) => &reference.record_type,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Natural(reference) => write!(f, "{reference}"),
            Reference::Surrogate(reference) => write!(f, "{reference}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurrogateReference {
    #[serde(rename = "type")]
    pub record_type: String,
    pub id: i64,
}

impl fmt::Display for SurrogateReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.record_type, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyComponent {
    pub field: String,
    pub value: FieldValue,
}

/// Portable identity of a record: its type plus the ordered values of the
/// fields that make it unique at any destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NaturalKeyReference {
    #[serde(rename = "type")]
    pub record_type: String,
    pub key: Vec<KeyComponent>,
    /// Set when the key came from the generic fallback instead of a
    /// declared spec.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub heuristic: bool,
}

impl NaturalKeyReference {
    pub fn new(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            key: Vec::new(),
            heuristic: false,
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.key.push(KeyComponent {
            field: field.into(),
            value,
        });
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.key.iter().map(|component| component.field.as_str())
    }
}

impl fmt::Display for NaturalKeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.record_type)?;
        for (idx, component) in self.key.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", component.field, component.value)?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<i64>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(source_id: Option<i64>) -> Self {
        Self {
            source_id,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn references(&self) -> impl Iterator<Item = (&str, &Reference)> {
        self.fields
            .iter()
            .filter_map(|(name, value)| value.as_reference().map(|r| (name.as_str(), r)))
    }

    /// Label used in logs and reports when no natural key is available.
    pub fn label(&self, record_type: &str) -> String {
        match self.source_id {
            Some(id) => format!("{record_type}#{id}"),
            None => format!("{record_type}#?"),
        }
    }
}

/// Every record of one type inside a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordBatch {
    pub record_type: String,
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(record_type: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            record_type: record_type.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A value as SQLite stores it. Booleans become integers and references
/// become the resolved destination id before a row reaches the store.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Converts a scalar field; `None` for references.
    pub fn from_scalar(value: &FieldValue) -> Option<SqlValue> {
        Some(match value {
            FieldValue::Null => SqlValue::Null,
            FieldValue::Bool(v) => SqlValue::Integer(i64::from(*v)),
            FieldValue::Integer(v) => SqlValue::Integer(*v),
            FieldValue::Real(v) => SqlValue::Real(*v),
            FieldValue::Text(v) => SqlValue::Text(v.clone()),
            FieldValue::Blob(v) => SqlValue::Blob(v.clone()),
            FieldValue::Ref(_) => return None,
        })
    }

    pub fn into_field_value(self) -> FieldValue {
        match self {
            SqlValue::Null => FieldValue::Null,
            SqlValue::Integer(v) => FieldValue::Integer(v),
            SqlValue::Real(v) => FieldValue::Real(v),
            SqlValue::Text(v) => FieldValue::Text(v),
            SqlValue::Blob(v) => FieldValue::Blob(v),
        }
    }

    pub fn storage_class(&self) -> &'static str {
        match self {
            SqlValue::Null => "NULL",
            SqlValue::Integer(_) => "INTEGER",
            SqlValue::Real(_) => "REAL",
            SqlValue::Text(_) => "TEXT",
            SqlValue::Blob(_) => "BLOB",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Equality as SQLite compares stored values: integers and reals are
    /// compared numerically.
    pub fn same_value(&self, other: &SqlValue) -> bool {
        match (self, other) {
            (SqlValue::Integer(a), SqlValue::Real(b)) | (SqlValue::Real(b), SqlValue::Integer(a)) => {
                (*a as f64) == *b
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Integer(v) => write!(f, "{v}"),
            SqlValue::Real(v) => write!(f, "{v:?}"),
            SqlValue::Text(v) => write!(f, "{v:?}"),
            SqlValue::Blob(bytes) => {
                f.write_str("x'")?;
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                f.write_str("'")
            }
        }
    }
}

mod blob_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_reference_display_is_stable() {
        let account = NaturalKeyReference::new("accounts").with("username", FieldValue::text("alice"));
        let membership = NaturalKeyReference::new("memberships")
            .with("account_id", account.clone().into())
            .with("role_id", FieldValue::Integer(3));
        assert_eq!(account.to_string(), "accounts(username=\"alice\")");
        assert_eq!(
            membership.to_string(),
            "memberships(account_id=accounts(username=\"alice\"), role_id=3)"
        );
    }

    #[test]
    fn record_json_shape() {
        let record = Record::new(Some(7))
            .with_field("username", FieldValue::text("alice"))
            .with_field("avatar", FieldValue::Blob(vec![1, 2, 3]))
            .with_field("active", FieldValue::Null)
            .with_field(
                "role_id",
                FieldValue::Ref(Reference::Surrogate(SurrogateReference {
                    record_type: "roles".into(),
                    id: 4,
                })),
            );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["sourceId"], 7);
        assert_eq!(json["fields"]["username"]["text"], "alice");
        assert_eq!(json["fields"]["avatar"]["blob"], "AQID");
        assert_eq!(json["fields"]["active"], "null");
        assert_eq!(json["fields"]["role_id"]["ref"]["surrogate"]["type"], "roles");

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn heuristic_flag_only_serialized_when_set() {
        let mut reference = NaturalKeyReference::new("tags").with("name", FieldValue::text("x"));
        let plain = serde_json::to_string(&reference).unwrap();
        assert!(!plain.contains("heuristic"));
        reference.heuristic = true;
        let flagged = serde_json::to_string(&reference).unwrap();
        assert!(flagged.contains("\"heuristic\":true"));
    }

    #[test]
    fn sql_values_compare_numerically() {
        assert!(SqlValue::Integer(2).same_value(&SqlValue::Real(2.0)));
        assert!(!SqlValue::Integer(2).same_value(&SqlValue::Text("2".into())));
        assert_eq!(SqlValue::from_scalar(&FieldValue::Bool(true)), Some(SqlValue::Integer(1)));
        let reference = FieldValue::from(NaturalKeyReference::new("roles"));
        assert_eq!(SqlValue::from_scalar(&reference), None);
    }
}
