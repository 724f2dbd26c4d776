//! Staging area and single-writer commit state machine (C3).
//!
//! A repository has at most one in-flight commit at a time. Its state is
//! small enough to serialize as one JSON file under `<repo>/staging.json`,
//! so it survives across the separate HTTP requests that make up a commit —
//! the dispatcher itself is stateless between requests.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    errors::SyncError,
    manifest::{ManifestEntry, ManifestStore, ROOT},
    object_store::ObjectStore,
};

/// Reject any path carrying a `.` or `..` segment (I6, P6).
pub fn validate_path(path: &str) -> Result<(), SyncError> {
    if path
        .split('/')
        .any(|segment| segment == "." || segment == "..")
    {
        return Err(SyncError::PathTraversal);
    }
    Ok(())
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StagingState {
    active: bool,
    base_revision: String,
    puts: BTreeMap<String, ManifestEntry>,
    deletes: BTreeSet<String>,
}

/// Per-repository staging area, backed by a JSON file on disk.
pub struct Staging {
    path: PathBuf,
}

impl Staging {
    pub fn open(repo_root: &Path) -> Self {
        Self {
            path: repo_root.join("staging.json"),
        }
    }

    fn load(&self) -> Result<StagingState, SyncError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if !contents.trim().is_empty() => Ok(serde_json::from_str(&contents)?),
            _ => Ok(StagingState::default()),
        }
    }

    fn save(&self, state: &StagingState) -> Result<(), SyncError> {
        let tmp = self.path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&serde_json::to_vec(state)?)?;
        f.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// True iff a commit is currently in progress (`ACTIVE` state).
    pub fn have_active_commit(&self) -> Result<bool, SyncError> {
        Ok(self.load()?.active)
    }

    /// IDLE -> ACTIVE. Any stale staging state is discarded: the precondition
    /// that a prior staging area has already been rolled back is enforced by
    /// the dispatcher, not here, so a re-begin simply overwrites it.
    pub fn begin(&self, base_revision: &str) -> Result<(), SyncError> {
        self.save(&StagingState {
            active: true,
            base_revision: base_revision.to_string(),
            puts: BTreeMap::new(),
            deletes: BTreeSet::new(),
        })
    }

    /// Stream `source` into the object store and record the put, clearing
    /// any pending delete of the same path.
    pub fn put_from_reader(
        &self,
        objects: &ObjectStore,
        path: &str,
        source: impl std::io::Read,
    ) -> Result<(), SyncError> {
        validate_path(path)?;
        let hash = objects.put_from_reader(source)?;
        let size = fs::metadata(objects.path_of(&hash))?.len();

        let mut state = self.load()?;
        if !state.active {
            return Err(SyncError::NoActiveCommit);
        }
        state.deletes.remove(path);
        state.puts.insert(
            path.to_string(),
            ManifestEntry {
                path: path.to_string(),
                hash,
                size,
                mtime: 0,
            },
        );
        self.save(&state)
    }

    /// Record a pending delete, clearing any pending put of the same path.
    pub fn delete(&self, path: &str) -> Result<(), SyncError> {
        validate_path(path)?;
        let mut state = self.load()?;
        if !state.active {
            return Err(SyncError::NoActiveCommit);
        }
        state.puts.remove(path);
        state.deletes.insert(path.to_string());
        self.save(&state)
    }

    /// ACTIVE -> IDLE, discarding all pending puts/deletes. Objects already
    /// written to the store during the aborted commit are left in place.
    pub fn rollback(&self) -> Result<(), SyncError> {
        self.save(&StagingState::default())
    }

    /// ACTIVE -> IDLE. Applies puts/deletes to the base manifest and
    /// publishes a new revision. Fails with `NeedUpdate` if `base_revision`
    /// no longer matches head — the client must `begin_commit` again.
    pub fn commit(
        &self,
        manifests: &ManifestStore,
        author: &str,
        message: &str,
        timestamp: i64,
    ) -> Result<String, SyncError> {
        let state = self.load()?;
        if !state.active {
            return Err(SyncError::NoActiveCommit);
        }
        let head = manifests.get_head()?;
        if state.base_revision != head {
            tracing::warn!(base = %state.base_revision, %head, "commit attempted against stale revision");
            return Err(SyncError::NeedUpdate);
        }

        let base = if state.base_revision == ROOT {
            Vec::new()
        } else {
            manifests.get_manifest(&state.base_revision)?
        };

        let mut merged: BTreeMap<String, ManifestEntry> =
            base.into_iter().map(|e| (e.path.clone(), e)).collect();
        for path in &state.deletes {
            merged.remove(path);
        }
        for (path, entry) in &state.puts {
            merged.insert(path.clone(), entry.clone());
        }

        let new_id = manifests.publish(
            &state.base_revision,
            author,
            message,
            timestamp,
            merged.into_values().collect(),
        )?;

        self.rollback()?;
        Ok(new_id)
    }
}
