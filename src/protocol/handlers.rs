//! The eleven endpoint handlers. Each synchronous engine call (object
//! store, manifest store, staging, lock manager) runs inside
//! `tokio::task::spawn_blocking`; auth store calls are native sea-orm async
//! calls and run inline.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Json, State},
    http::HeaderMap,
    response::Response,
};
use chrono::Utc;

use crate::{auth, change, errors::SyncError};

use super::types::{
    AuthTokenResponse, ChangesResponse, CommitResponse, DeleteFilesRequest, FilesResponse,
    FindChangedRequest, FindChangedResponse, SessionTokenResponse, VersionsResponse,
};
use super::{
    get_repository, header_str, ok_empty, ok_json, record_repository, require_session, traced,
    ApiError, AppState,
};

/// Run a synchronous, possibly-blocking closure on the blocking pool.
async fn blocking<F, T>(f: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Internal(format!("blocking task panicked: {e}")))?
}

pub async fn begin_auth(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    traced("begin_auth", async move {
        let repo_name = header_str(&headers, "repository")?;
        record_repository(repo_name);
        let repo = get_repository(&state, repo_name)?;
        let ip = addr.ip().to_string();

        let auth_token = repo.auth.begin_auth(&ip).await?;
        Ok(ok_json(AuthTokenResponse { auth_token }))
    })
    .await
    .map_err(ApiError::from)
}

pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    traced("authenticate", async move {
        let repo_name = header_str(&headers, "repository")?;
        record_repository(repo_name);
        let repo = get_repository(&state, repo_name)?;
        let ip = addr.ip().to_string();

        if let Ok(raw_token) = header_str(&headers, "session_token") {
            let token = auth::canonicalize_token(raw_token)?;
            let session_token = repo.auth.authenticate_resume(&token, &ip).await?;
            return Ok(ok_json(SessionTokenResponse { session_token }));
        }

        let user = header_str(&headers, "user")?;
        let auth_token = header_str(&headers, "auth_token")?;
        let signature = header_str(&headers, "signature")?;

        if !state.config.user_can_use(user, repo_name) {
            return Err(SyncError::AuthenticationFailed);
        }
        let public_key = state
            .config
            .users
            .get(user)
            .ok_or(SyncError::AuthenticationFailed)?
            .public_key
            .clone();

        let session_token = repo
            .auth
            .authenticate_new(user, &public_key, auth_token, signature, &ip)
            .await?;
        Ok(ok_json(SessionTokenResponse { session_token }))
    })
    .await
    .map_err(ApiError::from)
}

pub async fn find_changed(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<FindChangedRequest>,
) -> Result<Response, ApiError> {
    traced("find_changed", async move {
        let repo_name = header_str(&headers, "repository")?;
        record_repository(repo_name);
        let repo = get_repository(&state, repo_name)?;
        let ip = addr.ip().to_string();
        let session_token = auth::canonicalize_token(header_str(&headers, "session_token")?)?;
        require_session(&state, repo, repo_name, &session_token, &ip).await?;

        let previous_revision = header_str(&headers, "previous_revision")?.to_string();
        let manifests = repo.manifests.clone();
        let (head, server_changes) = blocking(move || {
            let head = manifests.get_head()?;
            let changes = manifests.get_changes_since(&previous_revision, &head)?;
            Ok((head, changes))
        })
        .await?;

        let sorted_changes =
            change::merge_changes(server_changes, req.client_changes, &req.conflict_resolutions)?;
        Ok(ok_json(FindChangedResponse { head, sorted_changes }))
    })
    .await
    .map_err(ApiError::from)
}

pub async fn pull_file(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    traced("pull_file", async move {
        let repo_name = header_str(&headers, "repository")?;
        record_repository(repo_name);
        let repo = get_repository(&state, repo_name)?;
        let ip = addr.ip().to_string();
        let session_token = auth::canonicalize_token(header_str(&headers, "session_token")?)?;
        require_session(&state, repo, repo_name, &session_token, &ip).await?;

        let path = header_str(&headers, "path")?.to_string();
        let manifests = repo.manifests.clone();
        let objects = repo.objects.clone();
        let (file_info_json, bytes) = blocking(move || {
            let entry = manifests
                .get_file_info_from_path(&path)?
                .ok_or_else(|| SyncError::ObjectNotFound(path.clone()))?;
            let bytes = objects.read_to_vec(&entry.hash)?;
            let file_info_json = serde_json::to_string(&entry)?;
            Ok((file_info_json, bytes))
        })
        .await?;

        tracing::debug!("request succeeded");
        Ok(Response::builder()
            .header("status", "ok")
            .header("file_info_json", file_info_json)
            .body(Body::from(bytes))
            .expect("static response is well-formed"))
    })
    .await
    .map_err(ApiError::from)
}

pub async fn list_versions(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    traced("list_versions", async move {
        let repo_name = header_str(&headers, "repository")?;
        record_repository(repo_name);
        let repo = get_repository(&state, repo_name)?;
        let ip = addr.ip().to_string();
        let session_token = auth::canonicalize_token(header_str(&headers, "session_token")?)?;
        require_session(&state, repo, repo_name, &session_token, &ip).await?;

        let manifests = repo.manifests.clone();
        let versions = blocking(move || manifests.get_commit_chain()).await?;
        Ok(ok_json(VersionsResponse { versions }))
    })
    .await
    .map_err(ApiError::from)
}

pub async fn list_changes(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    traced("list_changes", async move {
        let repo_name = header_str(&headers, "repository")?;
        record_repository(repo_name);
        let repo = get_repository(&state, repo_name)?;
        let ip = addr.ip().to_string();
        let session_token = auth::canonicalize_token(header_str(&headers, "session_token")?)?;
        require_session(&state, repo, repo_name, &session_token, &ip).await?;

        let version_id = header_str(&headers, "version_id")?.to_string();
        let manifests = repo.manifests.clone();
        let changes = blocking(move || manifests.get_commit_changes(&version_id)).await?;
        Ok(ok_json(ChangesResponse { changes }))
    })
    .await
    .map_err(ApiError::from)
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    traced("list_files", async move {
        let repo_name = header_str(&headers, "repository")?;
        record_repository(repo_name);
        let repo = get_repository(&state, repo_name)?;
        let ip = addr.ip().to_string();
        let session_token = auth::canonicalize_token(header_str(&headers, "session_token")?)?;
        require_session(&state, repo, repo_name, &session_token, &ip).await?;

        let version_id = header_str(&headers, "version_id")?.to_string();
        let manifests = repo.manifests.clone();
        let files = blocking(move || manifests.get_commit_files(&version_id)).await?;
        Ok(ok_json(FilesResponse { files }))
    })
    .await
    .map_err(ApiError::from)
}

pub async fn begin_commit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    traced("begin_commit", async move {
        let repo_name = header_str(&headers, "repository")?.to_string();
        record_repository(&repo_name);
        let ip = addr.ip().to_string();
        let session_token = auth::canonicalize_token(header_str(&headers, "session_token")?)?;
        {
            let repo = get_repository(&state, &repo_name)?;
            require_session(&state, repo, &repo_name, &session_token, &ip).await?;
        }

        let previous_revision = header_str(&headers, "previous_revision")?.to_string();
        let state = state.clone();

        blocking(move || {
            let repo = state
                .repositories
                .get(&repo_name)
                .ok_or(SyncError::NoSuchRepository)?;
            let _process_lock = repo.lock()?;
            repo.user_lock.acquire(&session_token)?;

            let head = repo.manifests.get_head()?;
            if previous_revision != head {
                return Err(SyncError::NeedUpdate);
            }
            if repo.staging.have_active_commit()? {
                repo.staging.rollback()?;
            }
            repo.staging.begin(&head)
        })
        .await?;

        Ok(ok_empty())
    })
    .await
    .map_err(ApiError::from)
}

pub async fn push_file(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    traced("push_file", async move {
        let repo_name = header_str(&headers, "repository")?.to_string();
        record_repository(&repo_name);
        let ip = addr.ip().to_string();
        let session_token = auth::canonicalize_token(header_str(&headers, "session_token")?)?;
        {
            let repo = get_repository(&state, &repo_name)?;
            require_session(&state, repo, &repo_name, &session_token, &ip).await?;
        }

        let path = header_str(&headers, "path")?.to_string();
        let state = state.clone();

        blocking(move || {
            let repo = state
                .repositories
                .get(&repo_name)
                .ok_or(SyncError::NoSuchRepository)?;
            let _process_lock = repo.lock()?;
            repo.user_lock.acquire(&session_token)?;
            repo.staging
                .put_from_reader(&repo.objects, &path, std::io::Cursor::new(body.as_ref()))
        })
        .await?;

        Ok(ok_empty())
    })
    .await
    .map_err(ApiError::from)
}

pub async fn delete_files(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<DeleteFilesRequest>,
) -> Result<Response, ApiError> {
    traced("delete_files", async move {
        let repo_name = header_str(&headers, "repository")?.to_string();
        record_repository(&repo_name);
        let ip = addr.ip().to_string();
        let session_token = auth::canonicalize_token(header_str(&headers, "session_token")?)?;
        {
            let repo = get_repository(&state, &repo_name)?;
            require_session(&state, repo, &repo_name, &session_token, &ip).await?;
        }

        let state = state.clone();
        blocking(move || {
            let repo = state
                .repositories
                .get(&repo_name)
                .ok_or(SyncError::NoSuchRepository)?;
            let _process_lock = repo.lock()?;
            repo.user_lock.acquire(&session_token)?;
            for path in &req.files {
                if let Err(e) = repo.staging.delete(path) {
                    tracing::warn!(%path, error = %e, "batch delete failed partway");
                    return Err(SyncError::BatchFailure);
                }
            }
            Ok(())
        })
        .await?;

        Ok(ok_empty())
    })
    .await
    .map_err(ApiError::from)
}

pub async fn commit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    traced("commit", async move {
        let repo_name = header_str(&headers, "repository")?.to_string();
        record_repository(&repo_name);
        let ip = addr.ip().to_string();
        let session_token = auth::canonicalize_token(header_str(&headers, "session_token")?)?;
        let username = {
            let repo = get_repository(&state, &repo_name)?;
            require_session(&state, repo, &repo_name, &session_token, &ip).await?
        };

        let mode = header_str(&headers, "mode").unwrap_or("rollback").to_string();
        let commit_message = header_str(&headers, "commit_message").unwrap_or("").to_string();
        let timestamp = Utc::now().timestamp();
        let state = state.clone();

        let new_head = blocking(move || {
            let repo = state
                .repositories
                .get(&repo_name)
                .ok_or(SyncError::NoSuchRepository)?;
            let _process_lock = repo.lock()?;
            repo.user_lock.acquire(&session_token)?;

            let result = if mode == "commit" {
                Some(repo.staging.commit(&repo.manifests, &username, &commit_message, timestamp)?)
            } else {
                repo.staging.rollback()?;
                None
            };
            repo.user_lock.clear()?;
            Ok(result)
        })
        .await?;

        Ok(match new_head {
            Some(head) => ok_json(CommitResponse { head }),
            None => ok_empty(),
        })
    })
    .await
    .map_err(ApiError::from)
}
