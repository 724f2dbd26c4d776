//! Per-repository handle (ties C1-C5 together).
//!
//! One `Repository` is constructed per entry in `ServerConfig::repositories`
//! at startup and lives for the process's lifetime behind an `Arc`.

use std::path::{Path, PathBuf};

use crate::{
    auth::AuthStore,
    errors::SyncError,
    lock::{acquire_process_lock, ProcessLockGuard, UserLock},
    manifest::ManifestStore,
    object_store::ObjectStore,
    staging::Staging,
};

pub struct Repository {
    root: PathBuf,
    pub objects: ObjectStore,
    pub manifests: ManifestStore,
    pub staging: Staging,
    pub user_lock: UserLock,
    pub auth: AuthStore,
}

impl Repository {
    /// Open (creating subtrees as needed) the repository rooted at `path`.
    /// Constructing the `AuthStore` requires the async sea-orm connection,
    /// so this is async even though every other component here is
    /// synchronous I/O.
    pub async fn open(path: &Path) -> Result<Self, SyncError> {
        std::fs::create_dir_all(path)?;
        let objects = ObjectStore::open(path)?;
        let manifests = ManifestStore::open(path)?;
        let staging = Staging::open(path);
        let user_lock = UserLock::open(path);
        let auth = AuthStore::open(path).await?;

        Ok(Self {
            root: path.to_path_buf(),
            objects,
            manifests,
            staging,
            user_lock,
            auth,
        })
    }

    /// Acquire the process-level flock for the duration of a mutating request.
    pub fn lock(&self) -> Result<ProcessLockGuard, SyncError> {
        acquire_process_lock(&self.root)
    }
}
