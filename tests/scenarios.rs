//! End-to-end scenarios against a running `revsyncd` router, driven over
//! real HTTP against an ephemeral loopback port (mirrors how an actual
//! client talks to the server; no in-process request shortcuts).

use std::{collections::HashMap, net::SocketAddr};

use base64::Engine as _;
use ring::{
    rand::SystemRandom,
    signature::{Ed25519KeyPair, KeyPair},
};
use revsync::{
    config::{RepositoryConfig, ServerConfig, UserConfig},
    protocol,
};
use serde_json::{json, Value};
use tempfile::TempDir;

struct TestUser {
    name: String,
    keypair: Ed25519KeyPair,
    public_key_b64: String,
}

fn new_user(name: &str) -> TestUser {
    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
    let keypair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
    let public_key_b64 = base64::engine::general_purpose::STANDARD.encode(keypair.public_key().as_ref());
    TestUser {
        name: name.to_string(),
        keypair,
        public_key_b64,
    }
}

/// Boot a real server on an ephemeral port with one repository and the given users.
async fn spawn_server(repo_name: &str, users: &[&TestUser]) -> (String, TempDir) {
    let dir = TempDir::new().unwrap();
    let repo_path = dir.path().join("repo");

    let mut repositories = HashMap::new();
    repositories.insert(repo_name.to_string(), RepositoryConfig { path: repo_path });

    let mut user_configs = HashMap::new();
    for u in users {
        user_configs.insert(
            u.name.clone(),
            UserConfig {
                public_key: u.public_key_b64.clone(),
                uses_repositories: vec![repo_name.to_string()],
            },
        );
    }

    let config = ServerConfig {
        repositories,
        users: user_configs,
    };
    let state = protocol::AppState::build(config).await.unwrap();
    let app = protocol::router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await;
    });

    (format!("http://{addr}"), dir)
}

async fn login(client: &reqwest::Client, base: &str, repo: &str, user: &TestUser) -> String {
    let resp = client
        .post(format!("{base}/begin_auth"))
        .header("repository", repo)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let auth_token = body["auth_token"].as_str().unwrap().to_string();

    let signature = user.keypair.sign(auth_token.as_bytes());
    let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature.as_ref());

    let resp = client
        .post(format!("{base}/authenticate"))
        .header("repository", repo)
        .header("user", user.name.as_str())
        .header("auth_token", auth_token.as_str())
        .header("signature", signature_b64.as_str())
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    body["session_token"].as_str().unwrap().to_string()
}

async fn begin_commit(client: &reqwest::Client, base: &str, repo: &str, session: &str, previous: &str) {
    let resp = client
        .post(format!("{base}/begin_commit"))
        .header("repository", repo)
        .header("session_token", session)
        .header("previous_revision", previous)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers().get("status").unwrap(), "ok");
}

async fn push_file(client: &reqwest::Client, base: &str, repo: &str, session: &str, path: &str, content: &[u8]) {
    let resp = client
        .post(format!("{base}/push_file"))
        .header("repository", repo)
        .header("session_token", session)
        .header("path", path)
        .body(content.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers().get("status").unwrap(), "ok");
}

async fn commit(client: &reqwest::Client, base: &str, repo: &str, session: &str, message: &str) -> String {
    let resp = client
        .post(format!("{base}/commit"))
        .header("repository", repo)
        .header("session_token", session)
        .header("mode", "commit")
        .header("commit_message", message)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers().get("status").unwrap(), "ok");
    let body: Value = resp.json().await.unwrap();
    body["head"].as_str().unwrap().to_string()
}

async fn find_changed(
    client: &reqwest::Client,
    base: &str,
    repo: &str,
    session: &str,
    previous: &str,
    client_changes: Value,
    conflict_resolutions: Value,
) -> Value {
    let resp = client
        .post(format!("{base}/find_changed"))
        .header("repository", repo)
        .header("session_token", session)
        .header("previous_revision", previous)
        .json(&json!({
            "client_changes": client_changes,
            "conflict_resolutions": conflict_resolutions,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers().get("status").unwrap(), "ok");
    resp.json().await.unwrap()
}

/// Scenario 1: a fresh repository accepts an initial commit, and the
/// committed file round-trips through list_files/pull_file.
#[tokio::test]
async fn initial_commit_round_trips() {
    let alice = new_user("alice");
    let (base, _dir) = spawn_server("main", &[&alice]).await;
    let client = reqwest::Client::new();
    let session = login(&client, &base, "main", &alice).await;

    begin_commit(&client, &base, "main", &session, "root").await;
    push_file(&client, &base, "main", &session, "/a.txt", b"hello world").await;
    let head = commit(&client, &base, "main", &session, "initial commit").await;
    assert_ne!(head, "root");

    let resp = client
        .post(format!("{base}/list_files"))
        .header("repository", "main")
        .header("session_token", session.as_str())
        .header("version_id", head.as_str())
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let files: Vec<String> = serde_json::from_value(body["files"].clone()).unwrap();
    assert_eq!(files, vec!["/a.txt".to_string()]);

    let resp = client
        .post(format!("{base}/pull_file"))
        .header("repository", "main")
        .header("session_token", session.as_str())
        .header("path", "/a.txt")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers().get("status").unwrap(), "ok");
    let content = resp.bytes().await.unwrap();
    assert_eq!(&content[..], b"hello world");
}

/// Scenario 2: a second client, still at root, sees the first client's
/// commit as a server-side change to pull.
#[tokio::test]
async fn update_propagates_to_other_clients() {
    let alice = new_user("alice");
    let bob = new_user("bob");
    let (base, _dir) = spawn_server("main", &[&alice, &bob]).await;
    let client = reqwest::Client::new();

    let alice_session = login(&client, &base, "main", &alice).await;
    begin_commit(&client, &base, "main", &alice_session, "root").await;
    push_file(&client, &base, "main", &alice_session, "/a.txt", b"hello").await;
    commit(&client, &base, "main", &alice_session, "first").await;

    let bob_session = login(&client, &base, "main", &bob).await;
    let result = find_changed(&client, &base, "main", &bob_session, "root", json!([]), json!([])).await;
    let pull: Vec<Value> = serde_json::from_value(result["sorted_changes"]["pull"].clone()).unwrap();
    assert_eq!(pull.len(), 1);
    assert_eq!(pull[0]["path"], "/a.txt");
}

/// Scenario 3: a commit that adds, deletes, and modifies in one pass
/// reports the modified path as `changed`, never `new`.
#[tokio::test]
async fn add_delete_modify_reports_changed_not_new() {
    let alice = new_user("alice");
    let (base, _dir) = spawn_server("main", &[&alice]).await;
    let client = reqwest::Client::new();
    let session = login(&client, &base, "main", &alice).await;

    begin_commit(&client, &base, "main", &session, "root").await;
    push_file(&client, &base, "main", &session, "/keep.txt", b"unchanged").await;
    push_file(&client, &base, "main", &session, "/gone.txt", b"will be deleted").await;
    let rev1 = commit(&client, &base, "main", &session, "base").await;

    begin_commit(&client, &base, "main", &session, rev1.as_str()).await;
    push_file(&client, &base, "main", &session, "/keep.txt", b"modified content").await;
    push_file(&client, &base, "main", &session, "/new.txt", b"added").await;

    let resp = client
        .post(format!("{base}/delete_files"))
        .header("repository", "main")
        .header("session_token", session.as_str())
        .json(&json!({ "files": ["/gone.txt"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers().get("status").unwrap(), "ok");

    let rev2 = commit(&client, &base, "main", &session, "add/delete/modify").await;

    let resp = client
        .post(format!("{base}/list_changes"))
        .header("repository", "main")
        .header("session_token", session.as_str())
        .header("version_id", rev2.as_str())
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let changes: Vec<Value> = serde_json::from_value(body["changes"].clone()).unwrap();

    let keep = changes.iter().find(|c| c["path"] == "/keep.txt").unwrap();
    assert_eq!(keep["status"], "changed");
    let added = changes.iter().find(|c| c["path"] == "/new.txt").unwrap();
    assert_eq!(added["status"], "new");
    let deleted = changes.iter().find(|c| c["path"] == "/gone.txt").unwrap();
    assert_eq!(deleted["status"], "deleted");
}

/// Scenario 4: the same path changed on both server and client sides
/// surfaces as a conflict, not an automatic merge.
#[tokio::test]
async fn same_path_changed_both_sides_is_a_conflict() {
    let alice = new_user("alice");
    let (base, _dir) = spawn_server("main", &[&alice]).await;
    let client = reqwest::Client::new();
    let session = login(&client, &base, "main", &alice).await;

    begin_commit(&client, &base, "main", &session, "root").await;
    push_file(&client, &base, "main", &session, "/shared.txt", b"base").await;
    let rev1 = commit(&client, &base, "main", &session, "base").await;

    begin_commit(&client, &base, "main", &session, rev1.as_str()).await;
    push_file(&client, &base, "main", &session, "/shared.txt", b"server edit").await;
    commit(&client, &base, "main", &session, "server edit").await;

    let client_change = json!([{
        "path": "/shared.txt",
        "status": "changed",
        "hash": "0".repeat(64),
        "old_hash": "0".repeat(64),
    }]);
    let result = find_changed(&client, &base, "main", &session, rev1.as_str(), client_change, json!([])).await;
    let conflict: Vec<Value> = serde_json::from_value(result["sorted_changes"]["conflict"].clone()).unwrap();
    assert_eq!(conflict.len(), 1);
    assert_eq!(conflict[0]["path"], "/shared.txt");
}

/// Scenario 5: a supplied resolution removes the conflict and folds the
/// winning side into `resolved`.
#[tokio::test]
async fn conflict_resolution_picks_a_side() {
    let alice = new_user("alice");
    let (base, _dir) = spawn_server("main", &[&alice]).await;
    let client = reqwest::Client::new();
    let session = login(&client, &base, "main", &alice).await;

    begin_commit(&client, &base, "main", &session, "root").await;
    push_file(&client, &base, "main", &session, "/shared.txt", b"base").await;
    let rev1 = commit(&client, &base, "main", &session, "base").await;

    begin_commit(&client, &base, "main", &session, rev1.as_str()).await;
    push_file(&client, &base, "main", &session, "/shared.txt", b"server edit").await;
    commit(&client, &base, "main", &session, "server edit").await;

    let client_change = json!([{
        "path": "/shared.txt",
        "status": "changed",
        "hash": "1".repeat(64),
        "old_hash": "0".repeat(64),
    }]);
    let resolutions = json!([{ "path": "/shared.txt", "resolution": "server" }]);
    let result = find_changed(&client, &base, "main", &session, rev1.as_str(), client_change, resolutions).await;

    let conflict: Vec<Value> = serde_json::from_value(result["sorted_changes"]["conflict"].clone()).unwrap();
    assert!(conflict.is_empty());
    let resolved: Vec<Value> = serde_json::from_value(result["sorted_changes"]["resolved"].clone()).unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0]["path"], "/shared.txt");
}

/// Scenario 6: a user lock left dangling past its 30s TTL (client vanished
/// mid-commit) is acquirable by a different session afterward.
#[tokio::test]
async fn dangling_user_lock_expires_after_ttl() {
    let alice = new_user("alice");
    let bob = new_user("bob");
    let (base, _dir) = spawn_server("main", &[&alice, &bob]).await;
    let client = reqwest::Client::new();

    let alice_session = login(&client, &base, "main", &alice).await;
    begin_commit(&client, &base, "main", &alice_session, "root").await;

    let bob_session = login(&client, &base, "main", &bob).await;
    let resp = client
        .post(format!("{base}/begin_commit"))
        .header("repository", "main")
        .header("session_token", bob_session.as_str())
        .header("previous_revision", "root")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers().get("status").unwrap(), "fail");

    tokio::time::sleep(std::time::Duration::from_secs(31)).await;

    let resp = client
        .post(format!("{base}/begin_commit"))
        .header("repository", "main")
        .header("session_token", bob_session.as_str())
        .header("previous_revision", "root")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers().get("status").unwrap(), "ok");
}
