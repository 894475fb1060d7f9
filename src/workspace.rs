//! Scratch working directories and per-event log files.
//!
//! A working directory is keyed by `(repository, token)`: repeated
//! deployments of the same repository with the same credential reuse the
//! checkout, while a different credential never shares one. Executions that
//! share a directory are serialised through [`WorkspaceLocks`].

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;

use crate::error::Result;

const CHECKOUT_DIR: &str = "checkout";
const PARTIAL_CHECKOUT_DIR: &str = "checkout.partial";

/// Deterministic working directory for a repository and credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkingDirectory {
    root: PathBuf,
}

impl WorkingDirectory {
    pub fn derive(scratch_root: &Path, repo_full_name: &str, token: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(repo_full_name.as_bytes());
        // Separator keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update([0u8]);
        hasher.update(token.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self {
            root: scratch_root.join(digest),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn checkout_dir(&self) -> PathBuf {
        self.root.join(CHECKOUT_DIR)
    }

    /// Clone target; renamed to [`checkout_dir`](Self::checkout_dir) only
    /// once the clone has completed.
    pub fn partial_checkout_dir(&self) -> PathBuf {
        self.root.join(PARTIAL_CHECKOUT_DIR)
    }

    pub fn logs_for(&self, guid: &str) -> ExecutionLogs {
        ExecutionLogs {
            stdout: self.root.join(format!("stdout.{}.log", guid)),
            stderr: self.root.join(format!("stderr.{}.log", guid)),
        }
    }

    /// Idempotent create.
    pub async fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub async fn has_checkout(&self) -> bool {
        fs::try_exists(self.checkout_dir()).await.unwrap_or(false)
    }
}

/// The stdout/stderr capture files of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionLogs {
    stdout: PathBuf,
    stderr: PathBuf,
}

impl ExecutionLogs {
    pub fn stdout_path(&self) -> &Path {
        &self.stdout
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr
    }

    pub async fn append(&self, stdout: &[u8], stderr: &[u8]) -> Result<()> {
        append_to(&self.stdout, stdout).await?;
        append_to(&self.stderr, stderr).await?;
        Ok(())
    }

    /// Reads both captures back. Files that were never written read as empty.
    pub async fn read(&self) -> Result<(String, String)> {
        Ok((read_or_empty(&self.stdout).await?, read_or_empty(&self.stderr).await?))
    }
}

async fn append_to(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

async fn read_or_empty(path: &Path) -> Result<String> {
    match fs::read(path).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// In-process keyed mutex over working directories.
#[derive(Debug, Default)]
pub struct WorkspaceLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other execution holds `dir`.
    pub async fn acquire(&self, dir: &WorkingDirectory) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(dir.path().to_path_buf()).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn derivation_is_deterministic() {
        let root = Path::new("/tmp");
        let a = WorkingDirectory::derive(root, "org/app", "token-a");
        let b = WorkingDirectory::derive(root, "org/app", "token-a");
        assert_eq!(a, b);
        assert!(a.path().starts_with(root));
    }

    #[test]
    fn different_token_different_directory() {
        let root = Path::new("/tmp");
        let a = WorkingDirectory::derive(root, "org/app", "token-a");
        let b = WorkingDirectory::derive(root, "org/app", "token-b");
        assert_ne!(a, b);
    }

    #[test]
    fn concatenation_does_not_collide() {
        let root = Path::new("/tmp");
        let a = WorkingDirectory::derive(root, "org/ap", "ptoken");
        let b = WorkingDirectory::derive(root, "org/app", "token");
        assert_ne!(a, b);
    }

    #[test]
    fn layout_matches_guid() {
        let dir = WorkingDirectory::derive(Path::new("/scratch"), "org/app", "t");
        let logs = dir.logs_for("abc");
        assert_eq!(dir.checkout_dir(), dir.path().join("checkout"));
        assert_eq!(logs.stdout_path(), dir.path().join("stdout.abc.log"));
        assert_eq!(logs.stderr_path(), dir.path().join("stderr.abc.log"));
    }

    #[tokio::test]
    async fn logs_append_and_read_back() {
        let scratch = tempfile::tempdir().unwrap();
        let dir = WorkingDirectory::derive(scratch.path(), "org/app", "t");
        dir.ensure().await.unwrap();
        dir.ensure().await.unwrap();

        let logs = dir.logs_for("g1");
        assert_eq!(logs.read().await.unwrap(), (String::new(), String::new()));

        logs.append(b"one\n", b"").await.unwrap();
        logs.append(b"two\n", b"warn\n").await.unwrap();
        let (out, err) = logs.read().await.unwrap();
        assert_eq!(out, "one\ntwo\n");
        assert_eq!(err, "warn\n");
    }

    #[tokio::test]
    async fn same_directory_is_serialised() {
        let locks = Arc::new(WorkspaceLocks::new());
        let dir = WorkingDirectory::derive(Path::new("/tmp"), "org/app", "t");
        let other = WorkingDirectory::derive(Path::new("/tmp"), "org/other", "t");

        let held = locks.acquire(&dir).await;

        // A different directory is not blocked.
        let _other = tokio::time::timeout(Duration::from_millis(100), locks.acquire(&other))
            .await
            .expect("other directory should be free");

        let contender = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&dir)).await;
        assert!(contender.is_err());

        drop(held);
        tokio::time::timeout(Duration::from_millis(100), locks.acquire(&dir))
            .await
            .expect("lock released");
    }
}
