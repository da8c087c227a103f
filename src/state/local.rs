//! Local file-based state storage backend.
//!
//! State lives at `<base>/<project>/<environment>/state.json`, next to a
//! `state.lock` file while a run holds the lock. Writes go to a temporary
//! file first and are renamed into place.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StackError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, holder_or_generated};
use super::store::StateStore;
use super::types::DeploymentState;

/// Default state directory name.
pub const STATE_DIR: &str = ".stackwright";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Directory holding the state and lock files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a store for `project/environment` under `root`.
    #[must_use]
    pub fn for_project(root: impl AsRef<Path>, project: &str, environment: &str) -> Self {
        Self::with_base_dir(root.as_ref().join(project).join(environment))
    }

    /// Creates a store for `project/environment` under `.stackwright` in
    /// the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn in_current_dir(project: &str, environment: &str) -> Result<Self> {
        let root = std::env::current_dir()
            .map_err(|e| StackError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::for_project(root, project, environment))
    }

    /// Creates a store using `base_dir` directly.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StackError::State(StateError::storage(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a temporary file and a rename.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;
        let mut temp_path = path.as_os_str().to_owned();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StackError::State(StateError::storage(format!(
                "Failed to create {}: {e}",
                temp_path.display()
            )))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            StackError::State(StateError::storage(format!(
                "Failed to write {}: {e}",
                temp_path.display()
            )))
        })?;

        file.sync_all().await.map_err(|e| {
            StackError::State(StateError::storage(format!(
                "Failed to sync {}: {e}",
                temp_path.display()
            )))
        })?;

        fs::rename(&temp_path, path).await.map_err(|e| {
            StackError::State(StateError::storage(format!(
                "Failed to rename into {}: {e}",
                path.display()
            )))
        })?;

        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StackError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                StackError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<DeploymentState>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            StackError::State(StateError::storage(format!("Failed to read state file: {e}")))
        })?;

        DeploymentState::from_json(&content).map(Some)
    }

    async fn save(&self, state: &DeploymentState) -> Result<()> {
        debug!("Saving state to: {}", self.state_path.display());
        let content = state.to_json()?;
        self.write_atomic(&self.state_path, &content).await?;
        debug!("State saved (serial {})", state.serial);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path).await.map_err(|e| {
                StackError::State(StateError::storage(format!("Failed to delete state file: {e}")))
            })?;
        }

        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StackError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            warn!("Taking over expired lock held by {}", existing.holder);
        }

        let lock_info = LockInfo::new(&holder_or_generated(holder), operation);
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            StackError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;

        self.ensure_dir().await?;
        // create_new fails if another process wrote a lock in the meantime.
        let exclusive = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await;
        match exclusive {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Only an expired lock may be replaced.
                if let Some(existing) = self.read_lock_file().await?
                    && !existing.is_expired()
                {
                    return Err(StackError::State(StateError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }));
                }
            }
            Err(e) => {
                return Err(StackError::State(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }));
            }
        }
        self.write_atomic(&self.lock_path, &content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        let existing = self.read_lock_file().await?;
        self.delete_lock_file().await?;
        if let Some(lock) = &existing {
            warn!("Force-removed state lock {} held by {}", lock.lock_id, lock.holder);
        }
        Ok(existing)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn location(&self) -> String {
        self.state_path.display().to_string()
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::for_project(temp_dir.path(), "demo", "dev");
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, temp) = create_test_store();

        let mut state = DeploymentState::new("demo", "dev");
        state.touch();
        store.save(&state).await.expect("Failed to save state");

        assert!(temp.path().join("demo/dev/state.json").exists());
        assert!(!temp.path().join("demo/dev/state.json.tmp").exists());

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.qualified_name(), "demo/dev");
        assert_eq!(loaded.serial, 1);
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_corrupted_state() {
        let (store, _temp) = create_test_store();
        std::fs::create_dir_all(store.state_path().parent().expect("parent")).expect("mkdir");
        std::fs::write(store.state_path(), "{ truncated").expect("write");

        let err = store.load().await.expect_err("corrupted");
        assert!(matches!(err, StackError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("ci-runner", "apply")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));
        assert_eq!(
            store.get_lock_info().await.expect("info").map(|l| l.operation),
            Some(String::from("apply"))
        );

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire first lock");

        let err = store.acquire_lock("holder-2", "destroy").await.expect_err("locked");
        match err {
            StackError::State(StateError::LockedByOther { holder, .. }) => {
                assert_eq!(holder, "holder-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_lock_id_keeps_lock() {
        let (store, _temp) = create_test_store();
        let _lock = store.acquire_lock("a", "apply").await.expect("lock");

        store.release_lock("not-the-id").await.expect("release");
        assert!(store.is_locked().await.expect("is_locked"));

        let removed = store.force_unlock().await.expect("force");
        assert_eq!(removed.map(|l| l.holder), Some(String::from("a")));
        assert!(!store.is_locked().await.expect("is_locked"));
    }
}
