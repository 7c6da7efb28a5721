use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::Target;
use crate::error::CoidbError;

pub const STATE_DIR: &str = ".coidb";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub targets: Vec<String>,
}

/// Exclusive claim on a work directory for the duration of one run.
/// The lock file is removed when the guard is released or dropped.
#[derive(Debug)]
pub struct WorkdirLock {
    path: Utf8PathBuf,
    released: bool,
}

impl WorkdirLock {
    pub fn lock_path(workdir: &Utf8Path) -> Utf8PathBuf {
        workdir.join(STATE_DIR).join("lock")
    }

    pub fn acquire(workdir: &Utf8Path, targets: &[Target]) -> Result<Self, CoidbError> {
        let path = Self::lock_path(workdir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| CoidbError::Filesystem(err.to_string()))?;
        }
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_std_path())
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(CoidbError::LockHeld { path });
            }
            Err(err) => return Err(CoidbError::Filesystem(err.to_string())),
        };

        let info = LockInfo {
            pid: std::process::id(),
            created_at: Utc::now(),
            targets: targets.iter().map(Target::to_string).collect(),
        };
        let lock = Self {
            path,
            released: false,
        };
        let content = serde_json::to_vec_pretty(&info)
            .map_err(|err| CoidbError::Filesystem(err.to_string()))?;
        file.write_all(&content)
            .map_err(|err| CoidbError::Filesystem(err.to_string()))?;
        debug!(path = %lock.path, "acquired work directory lock");
        Ok(lock)
    }

    pub fn is_held(workdir: &Utf8Path) -> bool {
        Self::lock_path(workdir).as_std_path().exists()
    }

    pub fn holder(workdir: &Utf8Path) -> Option<LockInfo> {
        let content = fs::read_to_string(Self::lock_path(workdir).as_std_path()).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Removes a lock left behind by another run. Returns whether one existed.
    pub fn clear(workdir: &Utf8Path) -> Result<bool, CoidbError> {
        let path = Self::lock_path(workdir);
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(CoidbError::Filesystem(err.to_string())),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn release(mut self) -> Result<(), CoidbError> {
        self.released = true;
        fs::remove_file(self.path.as_std_path())
            .map_err(|err| CoidbError::Filesystem(err.to_string()))
    }
}

impl Drop for WorkdirLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = fs::remove_file(self.path.as_std_path()) {
            warn!(path = %self.path, %err, "failed to remove work directory lock");
        }
    }
}
