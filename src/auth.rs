//! Auth and session store (C5).
//!
//! Short-lived signed challenges and longer-lived per-IP session tokens,
//! held in a per-repository SQLite database opened through `sea-orm`. Ed25519
//! verification and randomness go through `ring`, the way the teacher crate
//! already leans on it for its own hashing/signing needs.

use ring::{
    rand::{SecureRandom, SystemRandom},
    signature::{UnparsedPublicKey, ED25519},
};
use sea_orm::{ActiveValue::Set, *};

use crate::errors::SyncError;

const CHALLENGE_TTL_SECS: i64 = 30;
const SESSION_TTL_SECS: i64 = 2 * 60 * 60;
const TOKEN_BYTES: usize = 35;

mod token {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "tokens")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub token: String,
        pub expires: i64,
        pub ip: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

mod session_token {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "session_tokens")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub token: String,
        pub expires: i64,
        pub ip: String,
        pub username: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

fn now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

fn random_token() -> Result<String, SyncError> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; TOKEN_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| SyncError::Internal("CSPRNG failure".to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

use base64::Engine as _;

/// Normalize a wire-supplied token to its canonical base64 form: decode then
/// re-encode, so that comparison happens on the underlying bytes rather than
/// on the exact re-encoding the client happened to send.
pub fn canonicalize_token(raw: &str) -> Result<String, SyncError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|_| SyncError::AuthenticationFailed)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Per-repository auth database. Schema is created idempotently at open time.
pub struct AuthStore {
    db: DatabaseConnection,
}

impl AuthStore {
    pub async fn open(repo_root: &std::path::Path) -> Result<Self, SyncError> {
        let db_path = repo_root.join("auth.sqlite");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let db = Database::connect(&url).await?;

        let backend = db.get_database_backend();
        let schema = Schema::new(backend);
        db.execute(backend.build(schema.create_table_from_entity(token::Entity).if_not_exists()))
            .await?;
        db.execute(
            backend.build(schema.create_table_from_entity(session_token::Entity).if_not_exists()),
        )
        .await?;

        Ok(Self { db })
    }

    /// `begin_auth`: mint a challenge, valid for 30s.
    pub async fn begin_auth(&self, ip: &str) -> Result<String, SyncError> {
        let auth_token = random_token()?;
        token::ActiveModel {
            token: Set(auth_token.clone()),
            expires: Set(now() + CHALLENGE_TTL_SECS),
            ip: Set(ip.to_string()),
        }
        .insert(&self.db)
        .await?;
        Ok(auth_token)
    }

    /// `authenticate`, resume mode: an existing `session_token` is presented.
    /// GC's expired sessions, then accepts iff `(token, ip)` still exists.
    pub async fn authenticate_resume(
        &self,
        session_token: &str,
        ip: &str,
    ) -> Result<String, SyncError> {
        session_token::Entity::delete_many()
            .filter(session_token::Column::Expires.lt(now()))
            .exec(&self.db)
            .await?;

        let row = session_token::Entity::find()
            .filter(session_token::Column::Token.eq(session_token))
            .filter(session_token::Column::Ip.eq(ip))
            .one(&self.db)
            .await?;

        match row {
            Some(_) => Ok(session_token.to_string()),
            None => {
                tracing::warn!(%ip, "session resume failed");
                Err(SyncError::AuthenticationFailed)
            }
        }
    }

    /// `authenticate`, new-session mode: verify the Ed25519 signature of
    /// `auth_token` under `public_key_b64`, consume the challenge, and mint
    /// a session token bound to `user`/`ip`.
    pub async fn authenticate_new(
        &self,
        user: &str,
        public_key_b64: &str,
        auth_token: &str,
        signature_b64: &str,
        ip: &str,
    ) -> Result<String, SyncError> {
        let challenge = token::Entity::find()
            .filter(token::Column::Token.eq(auth_token))
            .filter(token::Column::Ip.eq(ip))
            .one(&self.db)
            .await?;
        let challenge = match challenge {
            Some(row) if row.expires >= now() => row,
            _ => {
                tracing::warn!(%user, %ip, "no valid challenge for authentication attempt");
                return Err(SyncError::AuthenticationFailed);
            }
        };

        let public_key = base64::engine::general_purpose::STANDARD
            .decode(public_key_b64)
            .map_err(|_| SyncError::AuthenticationFailed)?;
        let signature = base64::engine::general_purpose::STANDARD
            .decode(signature_b64)
            .map_err(|_| SyncError::AuthenticationFailed)?;

        let verifier = UnparsedPublicKey::new(&ED25519, &public_key);
        if verifier.verify(auth_token.as_bytes(), &signature).is_err() {
            tracing::warn!(%user, %ip, "signature verification failed");
            return Err(SyncError::AuthenticationFailed);
        }

        token::Entity::delete_by_id(challenge.token)
            .exec(&self.db)
            .await?;

        let session = random_token()?;
        session_token::ActiveModel {
            token: Set(session.clone()),
            expires: Set(now() + SESSION_TTL_SECS),
            ip: Set(ip.to_string()),
            username: Set(user.to_string()),
        }
        .insert(&self.db)
        .await?;

        Ok(session)
    }

    /// Authorization check for every subsequent request: GC expired
    /// sessions (excluding `exempt_from_gc`, the token currently holding the
    /// repository's user lock, which may be mid-upload past its expiry),
    /// then look up `(token, ip)` and refresh its expiry. Returns the
    /// authenticated username.
    pub async fn authenticate_request(
        &self,
        session_token: &str,
        ip: &str,
        exempt_from_gc: Option<&str>,
    ) -> Result<String, SyncError> {
        let mut gc = session_token::Entity::delete_many().filter(session_token::Column::Expires.lt(now()));
        if let Some(exempt) = exempt_from_gc {
            gc = gc.filter(session_token::Column::Token.ne(exempt));
        }
        gc.exec(&self.db).await?;

        let row = session_token::Entity::find()
            .filter(session_token::Column::Token.eq(session_token))
            .filter(session_token::Column::Ip.eq(ip))
            .one(&self.db)
            .await?;

        let row = match row {
            Some(row) => row,
            None => {
                tracing::warn!(%ip, "no session found for token/ip pair");
                return Err(SyncError::AuthenticationFailed);
            }
        };

        let mut active: session_token::ActiveModel = row.clone().into();
        active.expires = Set(now() + SESSION_TTL_SECS);
        active.update(&self.db).await?;

        Ok(row.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::signature::{Ed25519KeyPair, KeyPair};
    use tempfile::tempdir;

    #[tokio::test]
    async fn begin_auth_then_resume_round_trips() {
        let dir = tempdir().unwrap();
        let store = AuthStore::open(dir.path()).await.unwrap();

        let challenge = store.begin_auth("1.2.3.4").await.unwrap();
        assert!(!challenge.is_empty());
    }

    #[tokio::test]
    async fn resume_fails_for_unknown_token() {
        let dir = tempdir().unwrap();
        let store = AuthStore::open(dir.path()).await.unwrap();
        let result = store.authenticate_resume("nonexistent", "1.2.3.4").await;
        assert!(matches!(result, Err(SyncError::AuthenticationFailed)));
    }

    /// A valid Ed25519 signature over a live challenge mints a session; the
    /// challenge is single-use.
    #[tokio::test]
    async fn new_session_with_valid_signature_succeeds() {
        let dir = tempdir().unwrap();
        let store = AuthStore::open(dir.path()).await.unwrap();

        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let keypair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let public_key_b64 =
            base64::engine::general_purpose::STANDARD.encode(keypair.public_key().as_ref());

        let auth_token = store.begin_auth("1.2.3.4").await.unwrap();
        let signature = keypair.sign(auth_token.as_bytes());
        let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature.as_ref());

        let session = store
            .authenticate_new("alice", &public_key_b64, &auth_token, &signature_b64, "1.2.3.4")
            .await
            .unwrap();
        assert!(!session.is_empty());

        // The challenge is consumed: replaying it fails.
        let replay = store
            .authenticate_new("alice", &public_key_b64, &auth_token, &signature_b64, "1.2.3.4")
            .await;
        assert!(matches!(replay, Err(SyncError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn new_session_with_bad_signature_fails() {
        let dir = tempdir().unwrap();
        let store = AuthStore::open(dir.path()).await.unwrap();

        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let keypair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let public_key_b64 =
            base64::engine::general_purpose::STANDARD.encode(keypair.public_key().as_ref());

        let auth_token = store.begin_auth("1.2.3.4").await.unwrap();
        let bogus_signature_b64 = base64::engine::general_purpose::STANDARD.encode([0u8; 64]);

        let result = store
            .authenticate_new(
                "alice",
                &public_key_b64,
                &auth_token,
                &bogus_signature_b64,
                "1.2.3.4",
            )
            .await;
        assert!(matches!(result, Err(SyncError::AuthenticationFailed)));
    }

    /// A session token is refused from an IP other than the one that minted it (P8).
    #[tokio::test]
    async fn session_token_bound_to_minting_ip() {
        let dir = tempdir().unwrap();
        let store = AuthStore::open(dir.path()).await.unwrap();

        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let keypair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let public_key_b64 =
            base64::engine::general_purpose::STANDARD.encode(keypair.public_key().as_ref());

        let auth_token = store.begin_auth("1.2.3.4").await.unwrap();
        let signature = keypair.sign(auth_token.as_bytes());
        let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature.as_ref());
        let session = store
            .authenticate_new("alice", &public_key_b64, &auth_token, &signature_b64, "1.2.3.4")
            .await
            .unwrap();

        let result = store.authenticate_request(&session, "9.9.9.9", None).await;
        assert!(matches!(result, Err(SyncError::AuthenticationFailed)));
        assert!(store
            .authenticate_request(&session, "1.2.3.4", None)
            .await
            .is_ok());
    }

    /// authenticate_request excludes the user-lock holder from GC.
    #[tokio::test]
    async fn authenticate_request_exempts_lock_holder_from_gc() {
        let dir = tempdir().unwrap();
        let store = AuthStore::open(dir.path()).await.unwrap();

        session_token::ActiveModel {
            token: Set("expired-but-locking".to_string()),
            expires: Set(now() - 100),
            ip: Set("1.2.3.4".to_string()),
            username: Set("alice".to_string()),
        }
        .insert(&store.db)
        .await
        .unwrap();

        // GC would normally remove this row, but it's exempt.
        let _ = store
            .authenticate_request("expired-but-locking", "1.2.3.4", Some("expired-but-locking"))
            .await;

        let still_present = session_token::Entity::find()
            .filter(session_token::Column::Token.eq("expired-but-locking"))
            .one(&store.db)
            .await
            .unwrap();
        assert!(still_present.is_some());
    }
}
