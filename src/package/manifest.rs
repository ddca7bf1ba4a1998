use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::archive::IntegrityError;

pub const FORMAT_VERSION: u32 = 1;
pub const SUPPORTED_FORMAT_VERSIONS: &[u32] = &[FORMAT_VERSION];

/// Oldest producer whose packages this build still restores.
pub fn min_supported_app_version() -> Version {
    Version::new(0, 1, 0)
}

pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const CHECKSUMS_ENTRY: &str = "checksums.txt";
pub const DATA_DIR: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub format_version: u32,
    pub app_version: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Record types in the order the producer wrote them.
    pub record_types: Vec<String>,
    pub counts: BTreeMap<String, u64>,
}

impl Manifest {
    pub fn new(app_version: impl Into<String>, source: Option<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            app_version: app_version.into(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            source,
            record_types: Vec::new(),
            counts: BTreeMap::new(),
        }
    }

    pub fn count(&self, record_type: &str) -> u64 {
        self.counts.get(record_type).copied().unwrap_or(0)
    }

    pub fn total_records(&self) -> u64 {
        self.counts.values().sum()
    }
}

/// One sha256 over the manifest bytes and one per batch entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumSet {
    pub manifest: String,
    /// Record type -> sha256 of `data/<type>.jsonl`.
    pub batches: BTreeMap<String, String>,
}

impl ChecksumSet {
    /// `<entry>\t<sha256>` per line, manifest first.
    pub fn render(&self) -> String {
        let mut out = format!("{MANIFEST_ENTRY}\t{}\n", self.manifest);
        for (record_type, sha) in &self.batches {
            out.push_str(&format!("{}\t{sha}\n", batch_entry_name(record_type)));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, IntegrityError> {
        let mut manifest = None;
        let mut batches = BTreeMap::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, '\t');
            let entry = parts.next().unwrap_or_default();
            let sha = parts.next().ok_or_else(|| {
                IntegrityError::ChecksumFile(format!("line {} has no checksum", idx + 1))
            })?;
            if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(IntegrityError::ChecksumFile(format!(
                    "line {} has a malformed sha256",
                    idx + 1
                )));
            }
            let sha = sha.to_ascii_lowercase();
            if entry == MANIFEST_ENTRY {
                if manifest.replace(sha).is_some() {
                    return Err(IntegrityError::ChecksumFile("manifest listed twice".into()));
                }
            } else if let Some(record_type) = record_type_of_entry(entry) {
                if batches.insert(record_type.to_string(), sha).is_some() {
                    return Err(IntegrityError::ChecksumFile(format!("{entry} listed twice")));
                }
            } else {
                return Err(IntegrityError::UnexpectedEntry(entry.to_string()));
            }
        }
        let manifest = manifest
            .ok_or_else(|| IntegrityError::ChecksumFile("no manifest checksum".into()))?;
        Ok(Self { manifest, batches })
    }
}

pub fn batch_entry_name(record_type: &str) -> String {
    format!("{DATA_DIR}/{record_type}.jsonl")
}

pub fn record_type_of_entry(entry: &str) -> Option<&str> {
    entry
        .strip_prefix(DATA_DIR)
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(|rest| rest.strip_suffix(".jsonl"))
        .filter(|name| is_valid_record_type(name))
}

/// Record type names double as archive entry names and table names.
pub fn is_valid_record_type(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_defaults() {
        let m = Manifest::new("1.0.0", Some("staging".into()));
        assert_eq!(m.format_version, FORMAT_VERSION);
        assert_eq!(m.app_version, "1.0.0");
        assert!(m.created_at.contains('T'));
        assert!(m.record_types.is_empty());
        assert_eq!(m.total_records(), 0);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["formatVersion"], 1);
        assert_eq!(json["source"], "staging");
    }

    #[test]
    fn checksum_file_parses_what_it_renders() {
        let set = ChecksumSet {
            manifest: sha256_hex(b"m"),
            batches: BTreeMap::from([
                ("accounts".to_string(), sha256_hex(b"a")),
                ("roles".to_string(), sha256_hex(b"r")),
            ]),
        };
        let text = set.render();
        assert!(text.starts_with("manifest.json\t"));
        assert!(text.contains("data/accounts.jsonl\t"));
        assert_eq!(ChecksumSet::parse(&text).unwrap(), set);
    }

    #[test]
    fn checksum_file_rejects_junk() {
        let sha = sha256_hex(b"m");
        assert!(matches!(
            ChecksumSet::parse(&format!("manifest.json\t{sha}\nnotes.txt\t{sha}\n")),
            Err(IntegrityError::UnexpectedEntry(_))
        ));
        assert!(matches!(
            ChecksumSet::parse("manifest.json\tabc\n"),
            Err(IntegrityError::ChecksumFile(_))
        ));
        assert!(matches!(
            ChecksumSet::parse(&format!("data/a.jsonl\t{sha}\n")),
            Err(IntegrityError::ChecksumFile(_))
        ));
    }

    #[test]
    fn record_type_names_are_restricted() {
        assert!(is_valid_record_type("audit_records"));
        assert!(!is_valid_record_type("../etc"));
        assert!(!is_valid_record_type(""));
        assert_eq!(record_type_of_entry("data/roles.jsonl"), Some("roles"));
        assert_eq!(record_type_of_entry("data/../x.jsonl"), None);
    }
}
