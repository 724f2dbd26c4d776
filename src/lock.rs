//! Two-level lock manager (C4).
//!
//! The process lock is a per-repository advisory flock held for the
//! duration of one mutating request, acquired via `fd-lock`. The user lock
//! ties a whole commit (several requests) to one session without holding a
//! kernel lock across idle time, and is a plain JSON file updated by
//! temp-then-rename.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use fd_lock::RwLock as FdRwLock;
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;

/// RAII guard for the process-level lock. Released on drop.
///
/// `fd-lock`'s write guard borrows its `RwLock`, which makes holding it
/// across a function boundary self-referential. Rather than launder that
/// lifetime, the guard is acquired and immediately forgotten: on Unix an
/// flock is held by the open file description, not by the guard object, so
/// closing the file when `ProcessLockGuard` drops releases it just as well.
pub struct ProcessLockGuard {
    lock: Box<FdRwLock<File>>,
}

/// Acquire the per-repository process lock, failing fast (non-blocking) if
/// another request already holds it.
pub fn acquire_process_lock(repo_root: &Path) -> Result<ProcessLockGuard, SyncError> {
    let path = repo_root.join("lock_file");
    let file = OpenOptions::new().create(true).write(true).open(&path)?;
    let mut lock = Box::new(FdRwLock::new(file));

    let guard = lock.try_write().map_err(|_| {
        tracing::warn!(path = %path.display(), "process lock contended");
        SyncError::LockUnavailable
    })?;
    std::mem::forget(guard);

    tracing::debug!(path = %path.display(), "process lock acquired");
    Ok(ProcessLockGuard { lock })
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

const USER_LOCK_TTL_SECS: i64 = 30;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct UserLockRecord {
    session_token: String,
    expires: i64,
}

/// The `user_file`-backed session-scoped lock.
pub struct UserLock {
    path: PathBuf,
}

impl UserLock {
    pub fn open(repo_root: &Path) -> Self {
        Self {
            path: repo_root.join("user_file"),
        }
    }

    fn read(&self) -> Option<UserLockRecord> {
        let contents = fs::read_to_string(&self.path).ok()?;
        if contents.trim().is_empty() {
            return None;
        }
        // Fail-open on corruption: an unparseable record is treated as
        // absent, deliberately, to keep operational recovery simple.
        serde_json::from_str(&contents).ok()
    }

    fn write(&self, record: Option<&UserLockRecord>) -> Result<(), SyncError> {
        let tmp = self.path.with_extension("tmp");
        let body = match record {
            Some(r) => serde_json::to_vec(r)?,
            None => Vec::new(),
        };
        let mut f = File::create(&tmp)?;
        f.write_all(&body)?;
        f.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Whether `session_token` may (continue to) hold the lock: absent,
    /// corrupt, expired, or already held by this same token.
    pub fn can_acquire(&self, session_token: &str) -> bool {
        match self.read() {
            None => true,
            Some(record) => record.expires < now() || record.session_token == session_token,
        }
    }

    /// Acquire or refresh the lock for `session_token`, extending `expires`
    /// to `now + 30s`. Fails if another live session holds it.
    pub fn acquire(&self, session_token: &str) -> Result<(), SyncError> {
        if !self.can_acquire(session_token) {
            tracing::warn!(path = %self.path.display(), "user lock held by another live session");
            return Err(SyncError::LockUnavailable);
        }
        self.write(Some(&UserLockRecord {
            session_token: session_token.to_string(),
            expires: now() + USER_LOCK_TTL_SECS,
        }))
    }

    /// Clear the lock unconditionally. Called by `commit` and `rollback`.
    pub fn clear(&self) -> Result<(), SyncError> {
        self.write(None)
    }

    /// The token currently holding a non-expired lock, if any. Used by the
    /// auth store to exclude it from session garbage collection.
    pub fn current_holder(&self) -> Option<String> {
        let record = self.read()?;
        if record.expires < now() {
            None
        } else {
            Some(record.session_token)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn process_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let _first = acquire_process_lock(dir.path()).unwrap();
        assert!(matches!(
            acquire_process_lock(dir.path()),
            Err(SyncError::LockUnavailable)
        ));
    }

    #[test]
    fn process_lock_releases_on_drop() {
        let dir = tempdir().unwrap();
        {
            let _guard = acquire_process_lock(dir.path()).unwrap();
        }
        assert!(acquire_process_lock(dir.path()).is_ok());
    }

    #[test]
    fn fresh_user_lock_is_acquirable_by_anyone() {
        let dir = tempdir().unwrap();
        let lock = UserLock::open(dir.path());
        assert!(lock.can_acquire("session-a"));
    }

    #[test]
    fn held_user_lock_blocks_other_sessions() {
        let dir = tempdir().unwrap();
        let lock = UserLock::open(dir.path());
        lock.acquire("session-a").unwrap();
        assert!(!lock.can_acquire("session-b"));
        assert!(matches!(
            lock.acquire("session-b"),
            Err(SyncError::LockUnavailable)
        ));
    }

    #[test]
    fn same_session_can_refresh_its_own_lock() {
        let dir = tempdir().unwrap();
        let lock = UserLock::open(dir.path());
        lock.acquire("session-a").unwrap();
        assert!(lock.acquire("session-a").is_ok());
    }

    #[test]
    fn clear_releases_the_lock() {
        let dir = tempdir().unwrap();
        let lock = UserLock::open(dir.path());
        lock.acquire("session-a").unwrap();
        lock.clear().unwrap();
        assert!(lock.can_acquire("session-b"));
    }

    /// A corrupt lock file fails open (deliberate tradeoff).
    #[test]
    fn corrupt_lock_file_fails_open() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("user_file"), b"{not valid json").unwrap();
        let lock = UserLock::open(dir.path());
        assert!(lock.can_acquire("anyone"));
    }

    /// An expired lock is acquirable by a new session (scenario 6, 31s pause).
    #[test]
    fn expired_lock_is_acquirable() {
        let dir = tempdir().unwrap();
        let lock = UserLock::open(dir.path());
        lock.write(Some(&UserLockRecord {
            session_token: "session-a".to_string(),
            expires: now() - 1,
        }))
        .unwrap();
        assert!(lock.can_acquire("session-b"));
    }

    #[test]
    fn current_holder_reports_live_session_only() {
        let dir = tempdir().unwrap();
        let lock = UserLock::open(dir.path());
        assert_eq!(lock.current_holder(), None);
        lock.acquire("session-a").unwrap();
        assert_eq!(lock.current_holder(), Some("session-a".to_string()));
    }
}
