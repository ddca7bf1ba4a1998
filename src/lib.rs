//! Backup and restore of a relational store across environments whose
//! surrogate ids differ. Packages carry natural keys; restores re-link
//! every reference through them and fall back across three strategies.

pub mod config;
pub mod db;
pub mod error;
pub mod keys;
pub mod logging;
pub mod model;
pub mod package;
pub mod report;
pub mod restore;
pub mod schema;

pub use error::{AppError, AppResult};
pub use logging::init_logging;

pub const EXIT_OK: i32 = 0;
/// The package failed verification; nothing was written.
pub const EXIT_INTEGRITY: i32 = 1;
/// Some records failed but the committed batches stand.
pub const EXIT_PARTIAL: i32 = 2;
pub const EXIT_FATAL: i32 = 3;
