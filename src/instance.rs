use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::identity::NodeId;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("another instance for this node is already running (pid {pid})")]
    DuplicateInstance { pid: u32 },
    #[error("i/o error setting up instance directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Guarantees at most one process per [`NodeId`] on a host and hands out a
/// scratch directory scoped to this process's lifetime.
///
/// The directory lives under the system temp dir as
/// `midi-network-<nodeid>/`, with a `.lock` file holding the owning PID. A
/// stale lock (PID no longer running) is reclaimed rather than treated as a
/// conflict.
pub struct InstanceDirectory {
    dir: PathBuf,
    torn_down: bool,
}

impl InstanceDirectory {
    pub fn acquire(node_id: NodeId) -> Result<Self, InstanceError> {
        let dir = std::env::temp_dir().join(format!("midi-network-{node_id}"));
        let lock_path = dir.join(".lock");

        if let Some(existing_pid) = read_lock_pid(&lock_path) {
            if pid_is_running(existing_pid) {
                return Err(InstanceError::DuplicateInstance { pid: existing_pid });
            }
            warn!(pid = existing_pid, dir = %dir.display(), "reclaiming stale instance directory");
            fs::remove_dir_all(&dir).ok();
        }

        fs::create_dir_all(&dir)?;
        fs::write(&lock_path, std::process::id().to_string())?;
        info!(node_id = %node_id, dir = %dir.display(), "instance directory acquired");

        Ok(Self { dir, torn_down: false })
    }

    /// Path to a scratch file scoped to this instance; the core never
    /// creates the file itself, only hands out the path.
    pub fn state_file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Err(err) = fs::remove_file(self.dir.join(".lock")) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %err, "failed to remove instance lock file");
            }
        }
        if let Err(err) = fs::remove_dir_all(&self.dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %err, "failed to remove instance directory");
            }
        }
    }
}

impl Drop for InstanceDirectory {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn read_lock_pid(lock_path: &Path) -> Option<u32> {
    fs::read_to_string(lock_path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn pid_is_running(pid: u32) -> bool {
    // Signal 0 performs no action but still validates the PID exists and is
    // reachable, matching the use of kill(2) as a liveness probe.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_is_running(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn acquire_creates_directory_and_lock() {
        let node_id = Uuid::new_v4();
        let instance = InstanceDirectory::acquire(node_id).unwrap();
        assert!(instance.path().join(".lock").exists());
    }

    #[test]
    fn second_acquire_for_same_running_process_fails() {
        let node_id = Uuid::new_v4();
        let _first = InstanceDirectory::acquire(node_id).unwrap();
        let second = InstanceDirectory::acquire(node_id);
        assert!(matches!(second, Err(InstanceError::DuplicateInstance { .. })));
    }

    #[test]
    fn teardown_removes_directory_and_is_idempotent() {
        let node_id = Uuid::new_v4();
        let dir_path;
        {
            let instance = InstanceDirectory::acquire(node_id).unwrap();
            dir_path = instance.path().to_path_buf();
        }
        assert!(!dir_path.exists());

        // a fresh acquire for the same id must now succeed since the lock is gone
        let again = InstanceDirectory::acquire(node_id);
        assert!(again.is_ok());
    }

    #[test]
    fn stale_lock_with_dead_pid_is_reclaimed() {
        let node_id = Uuid::new_v4();
        let dir = std::env::temp_dir().join(format!("midi-network-{node_id}"));
        fs::create_dir_all(&dir).unwrap();
        // pid 1 is typically init and alive on unix test runners, so use an
        // implausibly large pid unlikely to be assigned.
        fs::write(dir.join(".lock"), "999999").unwrap();

        let instance = InstanceDirectory::acquire(node_id);
        assert!(instance.is_ok());
    }
}
