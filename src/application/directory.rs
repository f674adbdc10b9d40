//! In-memory user and permission directory backing the demo API.
//!
//! Every write invalidates the dependency tag its readers are cached under, so
//! the next read builds a fresh fingerprint.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::application::error::HttpError;
use crate::cache::{CacheError, CacheManager};

const SOURCE: &str = "application::directory::UserDirectory";

/// Tag of every cached response that lists or shows users.
pub const USERS_TAG: &str = "users";
/// Tag of every cached response that shows role permissions.
pub const PERMISSIONS_TAG: &str = "perm";

const DEFAULT_LOCALE: &str = "en";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "viewer".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionsView {
    pub locale: String,
    pub roles: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("user {0} does not exist")]
    UnknownUser(u64),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to invalidate `{tag}`: {source}")]
    Invalidation {
        tag: &'static str,
        #[source]
        source: CacheError,
    },
}

impl From<DirectoryError> for HttpError {
    fn from(error: DirectoryError) -> Self {
        match error {
            DirectoryError::UnknownUser(_) => HttpError::from_error(
                SOURCE,
                StatusCode::NOT_FOUND,
                "User not found",
                &error,
            ),
            DirectoryError::InvalidInput(_) => HttpError::from_error(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Request could not be processed",
                &error,
            ),
            DirectoryError::Invalidation { .. } => HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &error,
            ),
        }
    }
}

#[derive(Debug, Default)]
struct Records {
    users: BTreeMap<u64, User>,
    next_id: u64,
    permissions: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct UserDirectory {
    records: Arc<RwLock<Records>>,
    cache: Arc<dyn CacheManager>,
}

impl UserDirectory {
    pub fn new(cache: Arc<dyn CacheManager>) -> Self {
        Self {
            records: Arc::new(RwLock::new(Records {
                next_id: 1,
                ..Records::default()
            })),
            cache,
        }
    }

    /// A directory pre-filled with a handful of users and roles.
    pub fn with_sample_data(cache: Arc<dyn CacheManager>) -> Self {
        let mut records = Records {
            next_id: 1,
            ..Records::default()
        };
        for (name, role) in [("alice", "admin"), ("bob", "editor"), ("carol", "viewer")] {
            let id = records.next_id;
            records.next_id += 1;
            records.users.insert(
                id,
                User {
                    id,
                    name: name.to_string(),
                    role: role.to_string(),
                },
            );
        }
        records.permissions.insert(
            "admin".to_string(),
            vec!["read".to_string(), "write".to_string(), "manage".to_string()],
        );
        records
            .permissions
            .insert("editor".to_string(), vec!["read".to_string(), "write".to_string()]);
        records
            .permissions
            .insert("viewer".to_string(), vec!["read".to_string()]);

        Self {
            records: Arc::new(RwLock::new(records)),
            cache,
        }
    }

    pub async fn list_users(&self) -> Vec<User> {
        self.records.read().await.users.values().cloned().collect()
    }

    pub async fn user(&self, id: u64) -> Result<User, DirectoryError> {
        self.records
            .read()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or(DirectoryError::UnknownUser(id))
    }

    pub async fn create_user(&self, new_user: NewUser) -> Result<User, DirectoryError> {
        let name = new_user.name.trim();
        if name.is_empty() {
            return Err(DirectoryError::InvalidInput(
                "user name must not be empty".to_string(),
            ));
        }

        let user = {
            let mut records = self.records.write().await;
            let id = records.next_id;
            records.next_id += 1;
            let user = User {
                id,
                name: name.to_string(),
                role: new_user.role,
            };
            records.users.insert(id, user.clone());
            user
        };

        self.invalidate(USERS_TAG)?;
        info!(user_id = user.id, "User created");
        Ok(user)
    }

    /// Permissions of every role, labelled with the primary language of `accept_language`.
    pub async fn permissions(&self, accept_language: Option<&str>) -> PermissionsView {
        let roles = self.records.read().await.permissions.clone();
        PermissionsView {
            locale: primary_locale(accept_language),
            roles,
        }
    }

    pub async fn set_permissions(
        &self,
        role: &str,
        permissions: Vec<String>,
    ) -> Result<Vec<String>, DirectoryError> {
        if role.trim().is_empty() {
            return Err(DirectoryError::InvalidInput(
                "role must not be empty".to_string(),
            ));
        }

        self.records
            .write()
            .await
            .permissions
            .insert(role.to_string(), permissions.clone());

        self.invalidate(PERMISSIONS_TAG)?;
        info!(role, "Role permissions updated");
        Ok(permissions)
    }

    fn invalidate(&self, tag: &'static str) -> Result<(), DirectoryError> {
        self.cache
            .invalidate(&[tag])
            .map_err(|source| DirectoryError::Invalidation { tag, source })
    }
}

fn primary_locale(accept_language: Option<&str>) -> String {
    accept_language
        .and_then(|header| header.split(',').next())
        .and_then(|tag| tag.split(';').next())
        .map(str::trim)
        .filter(|tag| !tag.is_empty() && *tag != "*")
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_LOCALE.to_string())
}
