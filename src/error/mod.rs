use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

use crate::config::ConfigError;
use crate::package::{ExportError, IntegrityError};
use crate::restore::RestoreError;

/// A structured error with a stable code, surfaced by the CLI and mapped
/// to its exit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";
    pub const INTEGRITY_CODE: &'static str = "PACKAGE/INTEGRITY";

    /// Construct a new application error with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    fn chain(&self) -> impl Iterator<Item = &AppError> {
        std::iter::successors(Some(self), |err| AppError::cause(err))
    }

    /// Package problems anywhere in the chain exit 1; everything else is
    /// fatal.
    pub fn exit_code(&self) -> i32 {
        if self.chain().any(|err| err.code.starts_with("PACKAGE/")) {
            crate::EXIT_INTEGRITY
        } else {
            crate::EXIT_FATAL
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            write!(f, "[{}] {} ({:?})", self.code, self.message, pairs)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn typed(err: &(dyn StdError + 'static)) -> Option<AppError> {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return Some(app.clone());
            }
            if let Some(integrity) = err.downcast_ref::<IntegrityError>() {
                return Some(integrity_error(integrity));
            }
            if let Some(restore) = err.downcast_ref::<RestoreError>() {
                return Some(restore_error(restore));
            }
            if let Some(export) = err.downcast_ref::<ExportError>() {
                return Some(export_error(export));
            }
            if let Some(config) = err.downcast_ref::<ConfigError>() {
                return Some(config_error(config));
            }
            None
        }

        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = typed(err) {
                return app;
            }
            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        let root: &(dyn StdError + 'static) = error.as_ref();
        convert(root)
    }
}

fn io_error(error: &IoError) -> AppError {
    let code = format!("IO/{:?}", error.kind());
    let mut app_error = AppError::new(code, error.to_string());
    if let Some(os_code) = error.raw_os_error() {
        app_error = app_error.with_context("os_code", os_code.to_string());
    }
    app_error
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        io_error(&error)
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

fn sqlx_error(error: &SqlxError) -> AppError {
    match error {
        SqlxError::RowNotFound => AppError::new("SQLX/ROW_NOT_FOUND", "Record not found"),
        SqlxError::ColumnNotFound(name) => {
            AppError::new("SQLX/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
        }
        SqlxError::PoolTimedOut => AppError::new(
            "SQLX/POOL_TIMEOUT",
            "Timed out acquiring a database connection",
        ),
        SqlxError::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "Database pool is closed"),
        SqlxError::Io(err) => io_error(err).with_context("source", "sqlx"),
        SqlxError::Database(db) => {
            let code = db
                .code()
                .map(|code| format!("Sqlite/{code}"))
                .unwrap_or_else(|| "SQLX/DATABASE".to_string());
            let mut app_error = AppError::new(code, db.message().to_string());
            if let Some(constraint) = db.constraint() {
                app_error = app_error.with_context("constraint", constraint.to_string());
            }
            app_error
        }
        SqlxError::ColumnDecode { index, source } => {
            AppError::new("SQLX/COLUMN_DECODE", source.to_string())
                .with_context("column_index", index.to_string())
        }
        SqlxError::Decode(decode_err) => AppError::new("SQLX/DECODE", decode_err.to_string()),
        other => AppError::new("SQLX/ERROR", other.to_string()),
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        sqlx_error(&error)
    }
}

fn integrity_error(error: &IntegrityError) -> AppError {
    let app_error =
        AppError::new(AppError::INTEGRITY_CODE, error.to_string()).with_context("kind", error.kind());
    match error {
        IntegrityError::Io { source, .. } => app_error.with_cause(io_error(source)),
        _ => app_error,
    }
}

impl From<IntegrityError> for AppError {
    fn from(error: IntegrityError) -> Self {
        integrity_error(&error)
    }
}

fn export_error(error: &ExportError) -> AppError {
    match error {
        ExportError::Package(inner) => integrity_error(inner),
        ExportError::Source { operation, source } => {
            let mut app_error = AppError::new("EXPORT/SOURCE", error.to_string())
                .with_context("operation", operation.clone());
            if let Some(sqlx) = source.downcast_ref::<SqlxError>() {
                app_error = app_error.with_cause(sqlx_error(sqlx));
            }
            app_error
        }
    }
}

impl From<ExportError> for AppError {
    fn from(error: ExportError) -> Self {
        export_error(&error)
    }
}

fn restore_error(error: &RestoreError) -> AppError {
    let message = error.to_string();
    match error {
        RestoreError::Locked { identity } => {
            AppError::new("RESTORE/LOCKED", message).with_context("destination", identity.clone())
        }
        RestoreError::LockIo { path, source } => AppError::new("RESTORE/LOCK_IO", message)
            .with_context("path", path.display().to_string())
            .with_cause(io_error(source)),
        RestoreError::Store(source) => {
            AppError::new("RESTORE/STORE", message).with_cause(sqlx_error(source))
        }
        RestoreError::TransactionAbort { record_type, .. } => {
            AppError::new("RESTORE/TRANSACTION_ABORT", message)
                .with_context("record_type", record_type.clone())
        }
        RestoreError::Schema(_) => AppError::new("RESTORE/SCHEMA", message),
        RestoreError::IllegalTransition(_) => AppError::new("RESTORE/STATE", message),
    }
}

impl From<RestoreError> for AppError {
    fn from(error: RestoreError) -> Self {
        restore_error(&error)
    }
}

fn config_error(error: &ConfigError) -> AppError {
    let message = error.to_string();
    match error {
        ConfigError::Io { path, source } => AppError::new("CONFIG/IO", message)
            .with_context("path", path.display().to_string())
            .with_cause(io_error(source)),
        ConfigError::Parse { path, .. } => {
            AppError::new("CONFIG/PARSE", message).with_context("path", path.display().to_string())
        }
        ConfigError::Rules(rule) => AppError::new("CONFIG/RULES", message)
            .with_context("record_type", rule.record_type.clone())
            .with_context("field", rule.field.clone()),
        ConfigError::InvalidVersion { value, .. } => {
            AppError::new("CONFIG/VERSION", message).with_context("value", value.clone())
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(error: ConfigError) -> Self {
        config_error(&error)
    }
}
