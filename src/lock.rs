use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;

/// Advisory filesystem lock gating one subsystem (upload, sync, hidden).
/// Whoever finds the lock held waits politely until it is released.
pub struct LockFile {
    name: &'static str,
    path: PathBuf,
}

/// Holding side of an acquired lock; releases on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

impl LockFile {
    fn new(locks_dir: &Path, name: &'static str) -> Self {
        Self { name, path: locks_dir.join(format!("{}.lock", name)) }
    }

    pub fn upload(locks_dir: &Path) -> Self {
        Self::new(locks_dir, "upload")
    }

    pub fn sync(locks_dir: &Path) -> Self {
        Self::new(locks_dir, "sync")
    }

    pub fn hidden(locks_dir: &Path) -> Self {
        Self::new(locks_dir, "hidden")
    }

    pub fn is_locked(&self) -> bool {
        self.path.exists()
    }

    /// Block until the lock is ours. Contention logs a single
    /// informational line, then polls once per second; a shutdown request
    /// while waiting aborts with `LockInterrupted`.
    pub fn acquire(&self, shutdown: &AtomicBool) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut waiting_logged = false;
        loop {
            match std::fs::OpenOptions::new().write(true).create_new(true).open(&self.path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(LockGuard { path: self.path.clone() });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !waiting_logged {
                        tracing::info!(
                            "waiting for the running {} task to finish before proceeding...",
                            self.name
                        );
                        waiting_logged = true;
                    }
                    if shutdown.load(Ordering::SeqCst) {
                        return Err(crate::UploadError::LockInterrupted(self.name.to_string()).into());
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_and_drop_releases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shutdown = AtomicBool::new(false);
        let lock = LockFile::upload(dir.path());
        assert!(!lock.is_locked());
        {
            let _guard = lock.acquire(&shutdown).expect("acquire");
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        // immediately acquirable again
        let _guard = lock.acquire(&shutdown).expect("re-acquire");
    }

    #[test]
    fn shutdown_interrupts_contended_acquire() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shutdown = AtomicBool::new(true);
        let lock = LockFile::sync(dir.path());
        let _guard = lock.acquire(&AtomicBool::new(false)).expect("first acquire");
        let err = lock.acquire(&shutdown).expect_err("interrupted");
        assert!(err.to_string().contains("sync"));
    }
}
