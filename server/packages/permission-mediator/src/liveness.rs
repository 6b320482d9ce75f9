//! Heartbeat-based detection of a supervising UI.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const HEARTBEAT_FILE: &str = "heartbeat";

#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    heartbeat: PathBuf,
    staleness: Duration,
}

impl LivenessMonitor {
    pub fn new(ipc_dir: &Path, staleness: Duration) -> Self {
        Self {
            heartbeat: ipc_dir.join(HEARTBEAT_FILE),
            staleness,
        }
    }

    pub fn heartbeat_path(&self) -> &Path {
        &self.heartbeat
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive_at(SystemTime::now())
    }

    /// A missing heartbeat, or any error reading its mtime, counts as absent.
    /// An mtime ahead of `now` counts as fresh.
    pub fn is_alive_at(&self, now: SystemTime) -> bool {
        let modified = match fs::metadata(&self.heartbeat).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                tracing::debug!(path = %self.heartbeat.display(), error = %err, "no heartbeat");
                return false;
            }
        };
        match now.duration_since(modified) {
            Ok(age) => age < self.staleness,
            Err(_) => true,
        }
    }
}
