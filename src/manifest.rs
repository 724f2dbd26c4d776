//! Manifest store and commit chain (C2).
//!
//! A revision's manifest is a JSON array of `ManifestEntry`, sorted ascending
//! by `path`, stored alongside a small commit record. Head advancement is the
//! sole publication step: new files are written under temporary names,
//! fsynced, then the `head` pointer file is atomically renamed into place —
//! the same write-temp-then-rename discipline the teacher crate uses for
//! loose objects, applied here to the manifest/commit pair instead of a blob.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{errors::SyncError, hash::ContentHash};

pub const ROOT: &str = "root";

/// One file's entry within a revision's manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub hash: ContentHash,
    pub size: u64,
    pub mtime: i64,
}

/// Commit metadata for a single revision. The manifest itself is stored
/// separately (see `ManifestStore::get_manifest`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: String,
    pub parent: String,
    pub author: String,
    pub message: String,
    pub timestamp: i64,
}

/// The status of a single path between two manifests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    New,
    Changed,
    Deleted,
}

/// A single path's change between two manifests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    pub status: ChangeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_hash: Option<ContentHash>,
}

/// Per-revision manifests and the linear commit chain they form.
#[derive(Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    /// Open (creating if absent) the manifest store rooted at `repo_root/revisions`,
    /// with the head pointer at `repo_root/head`.
    pub fn open(repo_root: &Path) -> Result<Self, SyncError> {
        let store = Self {
            root: repo_root.to_path_buf(),
        };
        fs::create_dir_all(store.revisions_dir())?;
        Ok(store)
    }

    fn revisions_dir(&self) -> PathBuf {
        self.root.join("revisions")
    }

    fn head_path(&self) -> PathBuf {
        self.root.join("head")
    }

    fn manifest_path(&self, revision: &str) -> PathBuf {
        self.revisions_dir().join(format!("{revision}.manifest.json"))
    }

    fn record_path(&self, revision: &str) -> PathBuf {
        self.revisions_dir().join(format!("{revision}.commit.json"))
    }

    /// The current head revision id, or `"root"` if the repository has no commits.
    pub fn get_head(&self) -> Result<String, SyncError> {
        let path = self.head_path();
        if !path.exists() {
            return Ok(ROOT.to_string());
        }
        let contents = fs::read_to_string(path)?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            Ok(ROOT.to_string())
        } else {
            Ok(trimmed.to_string())
        }
    }

    /// The manifest for `revision`, sorted ascending by path. `"root"` has an
    /// empty manifest.
    pub fn get_manifest(&self, revision: &str) -> Result<Vec<ManifestEntry>, SyncError> {
        if revision == ROOT {
            return Ok(Vec::new());
        }
        let path = self.manifest_path(revision);
        let contents = fs::read_to_string(&path).map_err(|_| {
            tracing::warn!(revision, "manifest not found");
            SyncError::RevisionNotFound(revision.to_string())
        })?;
        let mut entries: Vec<ManifestEntry> = serde_json::from_str(&contents)?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Resolve a single path's entry against head.
    pub fn get_file_info_from_path(&self, path: &str) -> Result<Option<ManifestEntry>, SyncError> {
        let head = self.get_head()?;
        let manifest = self.get_manifest(&head)?;
        Ok(manifest.into_iter().find(|e| e.path == path))
    }

    /// A revision's commit record.
    pub fn get_commit_record(&self, revision: &str) -> Result<CommitRecord, SyncError> {
        let path = self.record_path(revision);
        let contents = fs::read_to_string(&path).map_err(|_| {
            tracing::warn!(revision, "commit record not found");
            SyncError::RevisionNotFound(revision.to_string())
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// The commit chain from head back to (but not including) `"root"`.
    pub fn get_commit_chain(&self) -> Result<Vec<CommitRecord>, SyncError> {
        let mut chain = Vec::new();
        let mut current = self.get_head()?;
        while current != ROOT {
            let record = self.get_commit_record(&current)?;
            current = record.parent.clone();
            chain.push(record);
        }
        Ok(chain)
    }

    /// All paths present in `revision`'s manifest.
    pub fn get_commit_files(&self, revision: &str) -> Result<Vec<String>, SyncError> {
        Ok(self
            .get_manifest(revision)?
            .into_iter()
            .map(|e| e.path)
            .collect())
    }

    /// Changes introduced by `revision` relative to its parent.
    pub fn get_commit_changes(&self, revision: &str) -> Result<Vec<Change>, SyncError> {
        if revision == ROOT {
            return Ok(Vec::new());
        }
        let record = self.get_commit_record(revision)?;
        self.get_changes_since(&record.parent, revision)
    }

    /// Changes from `from` to `to`, assuming `from` is an ancestor of `to`
    /// (or `"root"`). See `crate::change::diff_manifests` for the algorithm.
    pub fn get_changes_since(&self, from: &str, to: &str) -> Result<Vec<Change>, SyncError> {
        let a = self.get_manifest(from)?;
        let b = self.get_manifest(to)?;
        Ok(crate::change::diff_manifests(&a, &b))
    }

    /// Publish a new revision: write the manifest and commit record to
    /// temporary names, fsync, then atomically rename the head pointer.
    /// Returns the new revision's id.
    pub fn publish(
        &self,
        parent: &str,
        author: &str,
        message: &str,
        timestamp: i64,
        mut manifest: Vec<ManifestEntry>,
    ) -> Result<String, SyncError> {
        manifest.sort_by(|a, b| a.path.cmp(&b.path));

        let manifest_json = serde_json::to_vec(&manifest)?;
        let id = revision_id(parent, author, message, timestamp, &manifest_json);

        let record = CommitRecord {
            id: id.clone(),
            parent: parent.to_string(),
            author: author.to_string(),
            message: message.to_string(),
            timestamp,
        };
        let record_json = serde_json::to_vec_pretty(&record)?;

        let dir = self.revisions_dir();
        fs::create_dir_all(&dir)?;

        write_and_sync(&dir.join(format!("{id}.manifest.json.tmp")), &manifest_json)?;
        write_and_sync(&dir.join(format!("{id}.commit.json.tmp")), &record_json)?;
        fs::rename(
            dir.join(format!("{id}.manifest.json.tmp")),
            self.manifest_path(&id),
        )?;
        fs::rename(
            dir.join(format!("{id}.commit.json.tmp")),
            self.record_path(&id),
        )?;

        let head_tmp = self.root.join("head.tmp");
        write_and_sync(&head_tmp, id.as_bytes())?;
        fs::rename(&head_tmp, self.head_path())?;

        tracing::debug!(revision = %id, parent = %parent, "published new revision");
        Ok(id)
    }
}

fn write_and_sync(path: &Path, contents: &[u8]) -> Result<(), SyncError> {
    let mut f = fs::File::create(path)?;
    f.write_all(contents)?;
    f.sync_all()?;
    Ok(())
}

/// A revision id is the hex SHA-256 over the canonical serialization of its
/// commit metadata plus the serialized manifest, so two revisions can never
/// collide unless their content is truly identical down to the timestamp.
fn revision_id(parent: &str, author: &str, message: &str, timestamp: i64, manifest_json: &[u8]) -> String {
    let mut buf = Vec::new();
    buf.extend_from_slice(parent.as_bytes());
    buf.push(0);
    buf.extend_from_slice(author.as_bytes());
    buf.push(0);
    buf.extend_from_slice(message.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.push(0);
    buf.extend_from_slice(manifest_json);
    ContentHash::of(&buf).to_hex()
}
