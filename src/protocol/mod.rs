//! Request dispatcher (C7): maps the eleven named endpoints onto HTTP POST
//! routes, enforces auth/lock/commit-state preconditions in the order
//! SPEC_FULL.md §4.7 lists them, and maps `SyncError` to the wire-level
//! `{status, msg}` contract at this boundary only.

pub mod handlers;
pub mod types;

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Body,
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde::Serialize;
use tracing::Instrument;

use crate::{config::ServerConfig, errors::SyncError, repository::Repository};

pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub repositories: HashMap<String, Repository>,
}

impl AppState {
    /// Open every configured repository once, at startup.
    pub async fn build(config: ServerConfig) -> Result<Arc<Self>, SyncError> {
        let mut repositories = HashMap::new();
        for (name, repo_config) in &config.repositories {
            let repo = Repository::open(&repo_config.path).await?;
            repositories.insert(name.clone(), repo);
        }
        Ok(Arc::new(Self {
            config: Arc::new(config),
            repositories,
        }))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/begin_auth", post(handlers::begin_auth))
        .route("/authenticate", post(handlers::authenticate))
        .route("/find_changed", post(handlers::find_changed))
        .route("/pull_file", post(handlers::pull_file))
        .route("/list_versions", post(handlers::list_versions))
        .route("/list_changes", post(handlers::list_changes))
        .route("/list_files", post(handlers::list_files))
        .route("/begin_commit", post(handlers::begin_commit))
        .route("/push_file", post(handlers::push_file))
        .route("/delete_files", post(handlers::delete_files))
        .route("/commit", post(handlers::commit))
        .with_state(state)
}

/// Wrap a handler body in a span carrying the endpoint name; the repository
/// field is filled in once the handler resolves the `repository` header.
async fn traced<F, T>(endpoint: &'static str, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let span = tracing::info_span!("handler", endpoint, repository = tracing::field::Empty);
    fut.instrument(span).await
}

fn record_repository(name: &str) {
    tracing::Span::current().record("repository", tracing::field::display(name));
}

/// The only place a `SyncError` becomes the wire-level `{status, msg}` contract.
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        tracing::warn!(error = %err, msg = %err.wire_message(), "request failed");
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        Response::builder()
            .header("status", "fail")
            .header("msg", self.0.wire_message())
            .body(Body::empty())
            .expect("static response is well-formed")
    }
}

fn ok_json(value: impl Serialize) -> Response {
    let body = serde_json::to_vec(&value).expect("response payload always serializes");
    tracing::debug!("request succeeded");
    Response::builder()
        .header("status", "ok")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("static response is well-formed")
}

fn ok_empty() -> Response {
    tracing::debug!("request succeeded");
    Response::builder()
        .header("status", "ok")
        .body(Body::empty())
        .expect("static response is well-formed")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, SyncError> {
    headers
        .get(name)
        .ok_or_else(|| SyncError::Internal(format!("missing header {name}")))?
        .to_str()
        .map_err(|_| SyncError::Internal(format!("invalid header {name}")))
}

fn get_repository<'a>(state: &'a AppState, name: &str) -> Result<&'a Repository, SyncError> {
    state.repositories.get(name).ok_or(SyncError::NoSuchRepository)
}

/// Authorization check for every non-auth endpoint: validate the session
/// against IP and repository, excluding the current user-lock holder from
/// the session GC pass.
async fn require_session(
    state: &AppState,
    repo: &Repository,
    repo_name: &str,
    session_token: &str,
    ip: &str,
) -> Result<String, SyncError> {
    let exempt = repo.user_lock.current_holder();
    let username = repo
        .auth
        .authenticate_request(session_token, ip, exempt.as_deref())
        .await?;
    if !state.config.user_can_use(&username, repo_name) {
        return Err(SyncError::AuthenticationFailed);
    }
    Ok(username)
}
