//! Process-wide server configuration (C8).
//!
//! Parsed once from a JSON file at startup into an immutable `ServerConfig`,
//! wrapped in an `Arc` and handed down to the dispatcher. No component
//! re-reads the file or rebuilds this value per request.

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::SyncError;

/// `{repositories: {name: {path}}, users: {name: {public_key, uses_repositories}}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub repositories: HashMap<String, RepositoryConfig>,
    pub users: HashMap<String, UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub path: PathBuf,
}

/// `public_key` is base64-encoded Ed25519.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub public_key: String,
    pub uses_repositories: Vec<String>,
}

impl ServerConfig {
    /// Parse configuration from a JSON file. Called exactly once, at
    /// process startup.
    pub fn load(path: &std::path::Path) -> Result<Self, SyncError> {
        let contents = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Whether `user` is permitted to use `repository`.
    pub fn user_can_use(&self, user: &str, repository: &str) -> bool {
        self.users
            .get(user)
            .is_some_and(|u| u.uses_repositories.iter().any(|r| r == repository))
    }
}
