//! Cached login token
//!
//! Stores the token used for the last successful negotiation in a small
//! JSON file so later runs can log in without passing it again.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClientError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRecord {
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginCache {
    path: PathBuf,
}

impl LoginCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record, a missing file is an empty record
    pub fn load(&self) -> Result<LoginRecord, ClientError> {
        if !self.path.exists() {
            return Ok(LoginRecord::default());
        }

        let json = fs::read_to_string(&self.path)?;
        serde_json::from_str(&json).map_err(|e| {
            ClientError::Config(format!("login cache {}: {}", self.path.display(), e))
        })
    }

    pub fn save(&self, record: &LoginRecord) -> Result<(), ClientError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(record)
            .map_err(|e| ClientError::Config(format!("login cache: {}", e)))?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn get_token(&self) -> Result<Option<String>, ClientError> {
        Ok(self.load()?.token)
    }

    pub fn set_token(&self, token: &str) -> Result<(), ClientError> {
        let mut record = self.load()?;
        record.token = Some(token.to_string());
        self.save(&record)
    }

    /// Forget the cached token; removes the file entirely
    pub fn clear(&self) -> Result<(), ClientError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Login cache cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LoginCache::new(dir.path().join("login.json"));
        assert_eq!(cache.get_token().unwrap(), None);
    }

    #[test]
    fn test_set_get_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LoginCache::new(dir.path().join("nested").join("login.json"));

        cache.set_token("tok-1").unwrap();
        assert_eq!(cache.get_token().unwrap().as_deref(), Some("tok-1"));

        cache.set_token("tok-2").unwrap();
        assert_eq!(cache.get_token().unwrap().as_deref(), Some("tok-2"));

        cache.clear().unwrap();
        assert!(!cache.path().exists());
        assert_eq!(cache.get_token().unwrap(), None);

        // clearing twice is fine
        cache.clear().unwrap();
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("login.json");
        fs::write(&path, "garbage").unwrap();
        assert!(matches!(
            LoginCache::new(path).load(),
            Err(ClientError::Config(_))
        ));
    }
}
