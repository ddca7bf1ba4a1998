//! Engine configuration: an optional JSON file plus environment overrides.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::{NaturalKeyRegistry, NaturalKeySpec};
use crate::package::manifest::min_supported_app_version;
use crate::package::LoadOptions;
use crate::restore::{ConflictPolicy, DataAccessLayer, RestoreMode, RestoreOptions, RuleError, TypeRules};

pub const CONFIG_ENV: &str = "DOSSIER_CONFIG";
pub const BATCH_TIMEOUT_ENV: &str = "DOSSIER_BATCH_TIMEOUT_MS";

const MIN_BATCH_TIMEOUT_MS: u64 = 100;
const MAX_BATCH_TIMEOUT_MS: u64 = 3_600_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Rules(#[from] RuleError),
    #[error("invalid minAppVersion {value:?}: {source}")]
    InvalidVersion {
        value: String,
        #[source]
        source: semver::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    /// Declared keys, layered over the built-in ones.
    pub natural_keys: BTreeMap<String, NaturalKeySpec>,
    /// Batch order override for restores and exports.
    pub priority: Vec<String>,
    /// Per-type rules, replacing the built-in rules of the same type.
    pub rules: BTreeMap<String, TypeRules>,
    pub skippable_types: BTreeSet<String>,
    pub batch_timeout_ms: Option<u64>,
    pub min_app_version: Option<String>,
    pub on_conflict: ConflictPolicy,
}

impl EngineConfig {
    /// Reads `path`, else the file named by `DOSSIER_CONFIG`, else the
    /// defaults; environment overrides apply last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| env::var(name).ok());
        config.min_app_version()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(target: "dossier", event = "config_loaded", path = %path.display());
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let Some(raw) = lookup(BATCH_TIMEOUT_ENV) else {
            return;
        };
        match raw.trim().parse::<u64>() {
            Ok(0) => {}
            Ok(ms) => self.batch_timeout_ms = Some(ms.clamp(MIN_BATCH_TIMEOUT_MS, MAX_BATCH_TIMEOUT_MS)),
            Err(err) => tracing::warn!(
                target: "dossier",
                event = "config_override_ignored",
                variable = BATCH_TIMEOUT_ENV,
                value = %raw,
                error = %err
            ),
        }
    }

    pub fn registry(&self) -> NaturalKeyRegistry {
        let mut registry = NaturalKeyRegistry::with_defaults();
        for (record_type, spec) in &self.natural_keys {
            registry.declare(record_type.clone(), spec.clone());
        }
        registry
    }

    pub fn data_access(&self) -> Result<DataAccessLayer, ConfigError> {
        let mut rules = crate::restore::default_rules();
        rules.extend(self.rules.clone());
        Ok(DataAccessLayer::new(&rules)?)
    }

    pub fn min_app_version(&self) -> Result<Version, ConfigError> {
        match &self.min_app_version {
            Some(value) => Version::parse(value).map_err(|source| ConfigError::InvalidVersion {
                value: value.clone(),
                source,
            }),
            None => Ok(min_supported_app_version()),
        }
    }

    pub fn load_options(&self) -> Result<LoadOptions, ConfigError> {
        Ok(LoadOptions {
            min_app_version: self.min_app_version()?,
        })
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub fn restore_options(&self, mode: RestoreMode, best_effort: bool) -> RestoreOptions {
        RestoreOptions {
            mode,
            best_effort,
            on_conflict: self.on_conflict,
            batch_timeout: self.batch_timeout(),
            skippable_types: self.skippable_types.clone(),
            priority: self.priority.clone(),
        }
    }
}
