//! Change engine (C6): diffs two manifests and merges client/server change
//! sets into a sorted action list plus a conflict list.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    errors::SyncError,
    manifest::{Change, ChangeStatus, ManifestEntry},
};

/// Diff two manifests, emitting ascending-by-path `new`/`changed`/`deleted`
/// records. When `from` is the empty manifest (`"root"`), every entry of `to`
/// is `new`. A path present in both with differing hashes is `changed` — the
/// corrected behavior from REDESIGN FLAGS; the source's change engine
/// emitted `new` for this case, which is not reproduced here.
pub fn diff_manifests(from: &[ManifestEntry], to: &[ManifestEntry]) -> Vec<Change> {
    let from_map: BTreeMap<&str, &ManifestEntry> =
        from.iter().map(|e| (e.path.as_str(), e)).collect();
    let to_map: BTreeMap<&str, &ManifestEntry> = to.iter().map(|e| (e.path.as_str(), e)).collect();

    let mut paths: Vec<&str> = from_map.keys().chain(to_map.keys()).copied().collect();
    paths.sort_unstable();
    paths.dedup();

    let mut changes = Vec::new();
    for path in paths {
        match (from_map.get(path), to_map.get(path)) {
            (None, Some(entry)) => changes.push(Change {
                path: path.to_string(),
                status: ChangeStatus::New,
                hash: Some(entry.hash),
                old_hash: None,
            }),
            (Some(entry), None) => changes.push(Change {
                path: path.to_string(),
                status: ChangeStatus::Deleted,
                hash: None,
                old_hash: Some(entry.hash),
            }),
            (Some(old), Some(new)) if old.hash != new.hash => changes.push(Change {
                path: path.to_string(),
                status: ChangeStatus::Changed,
                hash: Some(new.hash),
                old_hash: Some(old.hash),
            }),
            _ => {}
        }
    }
    changes
}

/// Which side of a conflict wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionSide {
    Client,
    Server,
}

/// A client-supplied `{path, resolution}` pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub path: String,
    pub resolution: ResolutionSide,
}

/// The merged, partitioned result of reconciling server and client changes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SortedChanges {
    /// Paths changed on both sides with no resolution supplied yet (both-delete excepted).
    pub conflict: Vec<Change>,
    /// Server-only changes the client should pull.
    pub pull: Vec<Change>,
    /// Client-only changes the client should push.
    pub push: Vec<Change>,
    /// Conflicts resolved by a supplied `ConflictResolution`, folded into `pull`/`push`.
    pub resolved: Vec<Change>,
}

/// Merge server and client change sets. `resolutions`, if present, removes
/// the losing side of each named conflict before merging; a resolution
/// naming a path that isn't actually conflicted, or an empty `path`, is
/// treated as malformed and rejected wholesale (`Please resolve conflicts`).
pub fn merge_changes(
    server_changes: Vec<Change>,
    client_changes: Vec<Change>,
    resolutions: &[ConflictResolution],
) -> Result<SortedChanges, SyncError> {
    let mut server_by_path: BTreeMap<String, Change> =
        server_changes.into_iter().map(|c| (c.path.clone(), c)).collect();
    let mut client_by_path: BTreeMap<String, Change> =
        client_changes.into_iter().map(|c| (c.path.clone(), c)).collect();

    let mut resolved = Vec::new();
    for res in resolutions {
        if res.path.is_empty() {
            tracing::warn!("conflict resolution with empty path");
            return Err(SyncError::ConflictResolutionRequired);
        }
        let on_server = server_by_path.contains_key(&res.path);
        let on_client = client_by_path.contains_key(&res.path);
        if !on_server || !on_client {
            tracing::warn!(path = %res.path, "conflict resolution names a non-conflicted path");
            return Err(SyncError::ConflictResolutionRequired);
        }
        match res.resolution {
            ResolutionSide::Client => {
                if let Some(c) = client_by_path.remove(&res.path) {
                    resolved.push(c);
                }
                server_by_path.remove(&res.path);
            }
            ResolutionSide::Server => {
                if let Some(c) = server_by_path.remove(&res.path) {
                    resolved.push(c);
                }
                client_by_path.remove(&res.path);
            }
        }
    }

    let mut conflict = Vec::new();
    let mut pull = Vec::new();
    let mut push = Vec::new();

    let mut all_paths: Vec<String> = server_by_path
        .keys()
        .chain(client_by_path.keys())
        .cloned()
        .collect();
    all_paths.sort();
    all_paths.dedup();

    for path in all_paths {
        match (server_by_path.remove(&path), client_by_path.remove(&path)) {
            (Some(s), Some(c)) => {
                if s.status == ChangeStatus::Deleted && c.status == ChangeStatus::Deleted {
                    // Both sides deleted it: silently dropped, no action.
                    continue;
                }
                conflict.push(s);
                let _ = c;
            }
            (Some(s), None) => pull.push(s),
            (None, Some(c)) => push.push(c),
            (None, None) => unreachable!("path came from one of the two maps"),
        }
    }

    conflict.sort_by(|a, b| a.path.cmp(&b.path));
    pull.sort_by(|a, b| a.path.cmp(&b.path));
    push.sort_by(|a, b| a.path.cmp(&b.path));
    resolved.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(SortedChanges {
        conflict,
        pull,
        push,
        resolved,
    })
}
