//! Local file-based state storage backend.
//!
//! State lives in `.nlq-deploy/state.json` next to the descriptor. Saves
//! write a temporary file and rename it over the previous state, so a crash
//! mid-write leaves the last complete record in place.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{DeployError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::{DeploymentState, decode_state, encode_state};

/// Default state directory name.
pub const STATE_DIR: &str = ".nlq-deploy";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    base_dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
}

fn write_failed(what: &str, e: &std::io::Error) -> DeployError {
    StateError::WriteFailed {
        message: format!("{what}: {e}"),
    }
    .into()
}

fn lock_failed(what: &str, e: &std::io::Error) -> DeployError {
    StateError::LockFailed {
        message: format!("{what}: {e}"),
    }
    .into()
}

impl LocalStateStore {
    /// Creates a store under `.nlq-deploy` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| DeployError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store rooted at `base_dir`.
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

    /// Creates a store from an explicit state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
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
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| write_failed("Failed to create state directory", &e))?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a sibling temp file and a rename.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| write_failed("Failed to create temp state file", &e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| write_failed("Failed to write state file", &e))?;
        file.sync_all()
            .await
            .map_err(|e| write_failed("Failed to sync state file", &e))?;
        drop(file);

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| write_failed("Failed to rename state file", &e))
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| StateError::Corrupted {
            message: format!("Failed to read lock file: {e}"),
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse lock file: {e}"),
        })?;

        Ok(Some(lock_info))
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path)
                .await
                .map_err(|e| lock_failed("Failed to delete lock file", &e))?;
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

        info!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| StateError::Corrupted {
            message: format!("Failed to read state file: {e}"),
        })?;

        decode_state(&content).map(Some)
    }

    async fn save(&self, state: &DeploymentState) -> Result<()> {
        info!("Saving state to: {}", self.state_path.display());
        let content = encode_state(state)?;
        self.write_atomic(&self.state_path, &content).await?;
        debug!(stacks = state.stacks.len(), "State saved");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path)
                .await
                .map_err(|e| write_failed("Failed to delete state file", &e))?;
        }
        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!(holder = %existing.holder, "Expired lock found, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id, operation);
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        self.ensure_dir().await?;
        if self.lock_path.exists() {
            // only reachable with an expired lock
            self.delete_lock_file().await?;
        }
        // Only one session can create the lock file.
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StateError::LockFailed {
                    message: "lock taken concurrently by another session".to_string(),
                }
                .into());
            }
            Err(e) => return Err(lock_failed("Failed to create lock file", &e)),
        };
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| lock_failed("Failed to write lock file", &e))?;
        file.sync_all()
            .await
            .map_err(|e| lock_failed("Failed to sync lock file", &e))?;

        info!(
            lock_id = %lock_info.lock_id,
            operation,
            "Acquired state lock (expires in {LOCK_EXPIRY_SECS}s)"
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

    async fn force_unlock(&self) -> Result<()> {
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResolvedProperties;
    use crate::state::{AppliedResource, StackState};
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let (store, _temp) = create_test_store();

        let mut state = DeploymentState::new("nlq-chat", "dev");
        let mut stack = StackState::default();
        stack.upsert(AppliedResource {
            logical_id: "UserPool".into(),
            kind: "cognito-user-pool".into(),
            properties: ResolvedProperties::from([("selfSignUp".to_string(), serde_json::json!(false))]),
            properties_hash: "abc".into(),
            outputs: ResolvedProperties::new(),
            removal_policy: crate::model::RemovalPolicy::Destroy,
            depends_on: Vec::new(),
            hook: None,
            is_hook: false,
            cleanup_succeeded: false,
            hook_pending: false,
            applied_at: chrono::Utc::now(),
        });
        stack.completed = true;
        state.set_stack("AuthStack", stack.clone());
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.project, "nlq-chat");
        assert_eq!(loaded.stack("AuthStack"), Some(&stack));
        assert!(!store.state_path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_state() {
        let (store, _temp) = create_test_store();

        let mut state = DeploymentState::new("nlq-chat", "dev");
        store.save(&state).await.unwrap();
        state.descriptor_hash = "second".into();
        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.descriptor_hash, "second");
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();
        assert!(store.load().await.expect("Load should not fail").is_none());
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.unwrap();
        fs::write(store.state_path(), "{ nope").await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, DeployError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder", "apply")
            .await
            .expect("Failed to acquire lock");
        assert!(store.is_locked().await.expect("is_locked failed"));

        store.release_lock("someone-else").await.unwrap();
        assert!(store.is_locked().await.unwrap());

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

        let err = store.acquire_lock("holder-2", "destroy").await.unwrap_err();
        assert!(matches!(err, DeployError::State(StateError::LockedByOther { .. })));

        store.force_unlock().await.unwrap();
        assert!(store.acquire_lock("holder-2", "destroy").await.is_ok());
    }
}
