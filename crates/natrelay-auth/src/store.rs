//! Credential lookup
//!
//! The provider never writes user records. It only asks a store for the
//! JSON record stored under a user key.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::AuthError;

/// Key to JSON lookup over user records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, user_key: &str) -> Result<Option<serde_json::Value>, AuthError>;
}

/// A user as stored in the credential store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub banned: bool,
}

impl UserRecord {
    pub fn from_json(value: serde_json::Value) -> Result<Self, AuthError> {
        serde_json::from_value(value).map_err(|e| AuthError::InvalidRecord(e.to_string()))
    }
}

/// In-memory store, used for tests and embedded setups
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_key: impl Into<String>, record: serde_json::Value) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_key.into(), record);
    }

    pub fn insert_user(&self, user_key: impl Into<String>, user: &UserRecord) {
        if let Ok(value) = serde_json::to_value(user) {
            self.insert(user_key, value);
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, user_key: &str) -> Result<Option<serde_json::Value>, AuthError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_key)
            .cloned())
    }
}

/// Store backed by a JSON object file `{ "<user key>": { "userId": "...", "banned": false } }`
///
/// The file is read once at construction.
pub struct JsonFileCredentialStore {
    records: HashMap<String, serde_json::Value>,
}

impl JsonFileCredentialStore {
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AuthError::Store(format!("failed to read {}: {}", path.display(), e))
        })?;
        let records: HashMap<String, serde_json::Value> = serde_json::from_str(&contents)
            .map_err(|e| AuthError::Store(format!("failed to parse {}: {}", path.display(), e)))?;

        tracing::info!(path = %path.display(), users = records.len(), "Loaded credential store");
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CredentialStore for JsonFileCredentialStore {
    async fn get(&self, user_key: &str) -> Result<Option<serde_json::Value>, AuthError> {
        Ok(self.records.get(user_key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCredentialStore::new();
        store.insert_user(
            "alice",
            &UserRecord {
                user_id: "42".to_string(),
                banned: false,
            },
        );

        let value = store.get("alice").await.unwrap().unwrap();
        assert_eq!(value["userId"], "42");
        assert!(store.get("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_file_store() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"alice": {{"userId": "7"}}, "mallory": {{"userId": "8", "banned": true}}}}"#
        )
        .unwrap();

        let store = JsonFileCredentialStore::load(file.path()).unwrap();
        assert_eq!(store.len(), 2);

        let mallory = UserRecord::from_json(store.get("mallory").await.unwrap().unwrap()).unwrap();
        assert!(mallory.banned);
        let alice = UserRecord::from_json(store.get("alice").await.unwrap().unwrap()).unwrap();
        assert!(!alice.banned);
        assert_eq!(alice.user_id, "7");
    }

    #[test]
    fn test_json_file_store_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            JsonFileCredentialStore::load(file.path()),
            Err(AuthError::Store(_))
        ));
    }

    #[test]
    fn test_record_without_user_id_is_invalid() {
        let result = UserRecord::from_json(serde_json::json!({ "banned": false }));
        assert!(matches!(result, Err(AuthError::InvalidRecord(_))));
    }
}
