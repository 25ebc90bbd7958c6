//! Object storage for certificate artifacts.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::DocumentError;

/// Flat key → blob storage. Keys are `/`-separated paths.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a blob; `DocumentError::NotFound` if absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>, DocumentError>;

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), DocumentError>;

    async fn exists(&self, key: &str) -> Result<bool, DocumentError>;

    /// Delete a blob. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), DocumentError>;

    /// Copy `from` over `to`.
    async fn copy(&self, from: &str, to: &str) -> Result<(), DocumentError> {
        let bytes = self.get(from).await?;
        self.put(to, bytes).await
    }
}

/// Filesystem-backed store rooted at a directory.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, DocumentError> {
        let rel = Path::new(key);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !clean {
            return Err(DocumentError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid object key '{key}'"),
            )));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, DocumentError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DocumentError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), DocumentError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never observe a half-written blob.
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, DocumentError> {
        Ok(tokio::fs::try_exists(self.path_for(key)?).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), DocumentError> {
        match tokio::fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store, used by tests and local dry runs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorted list of stored keys.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, DocumentError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| DocumentError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), DocumentError> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, DocumentError> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), DocumentError> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}
