//! Wire-level request/response payloads for the C7 dispatcher.

use serde::{Deserialize, Serialize};

use crate::{
    change::{ConflictResolution, SortedChanges},
    manifest::{Change, CommitRecord},
};

#[derive(Serialize)]
pub struct AuthTokenResponse {
    pub auth_token: String,
}

#[derive(Serialize)]
pub struct SessionTokenResponse {
    pub session_token: String,
}

#[derive(Deserialize)]
pub struct FindChangedRequest {
    #[serde(default)]
    pub client_changes: Vec<Change>,
    #[serde(default)]
    pub conflict_resolutions: Vec<ConflictResolution>,
}

#[derive(Serialize)]
pub struct FindChangedResponse {
    pub head: String,
    pub sorted_changes: SortedChanges,
}

#[derive(Serialize)]
pub struct VersionsResponse {
    pub versions: Vec<CommitRecord>,
}

#[derive(Serialize)]
pub struct ChangesResponse {
    pub changes: Vec<Change>,
}

#[derive(Serialize)]
pub struct FilesResponse {
    pub files: Vec<String>,
}

#[derive(Deserialize)]
pub struct DeleteFilesRequest {
    pub files: Vec<String>,
}

#[derive(Serialize)]
pub struct CommitResponse {
    pub head: String,
}
