use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use once_cell::sync::Lazy;

use super::orchestrator::RestoreError;

static ACTIVE_RESTORES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Single-writer guard for one destination. Holds a slot in the
/// process-wide registry and, for file-backed destinations, an exclusive
/// lock on `<db>.restore.lock` so other processes are kept out as well.
#[derive(Debug)]
pub struct RestoreLock {
    identity: String,
    file: Option<File>,
}

impl RestoreLock {
    pub fn acquire(identity: &str, lock_path: Option<&Path>) -> Result<Self, RestoreError> {
        {
            let mut active = ACTIVE_RESTORES.lock().unwrap_or_else(|err| err.into_inner());
            if !active.insert(identity.to_string()) {
                return Err(RestoreError::Locked {
                    identity: identity.to_string(),
                });
            }
        }

        let file = match lock_path.map(|path| lock_file(identity, path)).transpose() {
            Ok(file) => file,
            Err(err) => {
                release_slot(identity);
                return Err(err);
            }
        };

        tracing::debug!(target: "dossier", event = "restore_lock_acquired", identity);
        Ok(Self {
            identity: identity.to_string(),
            file,
        })
    }
}

impl Drop for RestoreLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
        release_slot(&self.identity);
        tracing::debug!(target: "dossier", event = "restore_lock_released", identity = %self.identity);
    }
}

fn release_slot(identity: &str) {
    let mut active = ACTIVE_RESTORES.lock().unwrap_or_else(|err| err.into_inner());
    active.remove(identity);
}

fn lock_file(identity: &str, path: &Path) -> Result<File, RestoreError> {
    let io_err = |source| RestoreError::LockIo {
        path: path.to_path_buf(),
        source,
    };
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(io_err)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(err) if err.kind() == fs2::lock_contended_error().kind() => Err(RestoreError::Locked {
            identity: identity.to_string(),
        }),
        Err(err) => Err(io_err(err)),
    }
}

/// `<db>.restore.lock` next to the database file.
pub fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".restore.lock");
    db_path.with_file_name(name)
}
