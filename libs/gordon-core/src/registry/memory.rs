use std::collections::HashMap;

use axum::body::Bytes;
use tokio::sync::RwLock;

use super::{Manifest, RegistryStorage, StorageError, digest_of};

/// In-memory registry storage.
///
/// Useful for tests and throwaway registries; nothing survives a restart.
#[derive(Default)]
pub struct MemoryRegistryStorage {
    // (repo, reference) -> manifest
    manifests: RwLock<HashMap<(String, String), Manifest>>,
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryRegistryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RegistryStorage for MemoryRegistryStorage {
    async fn get_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<Option<Manifest>, StorageError> {
        let manifests = self.manifests.read().await;
        Ok(manifests
            .get(&(repo.to_string(), reference.to_string()))
            .cloned())
    }

    async fn put_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        data: Bytes,
    ) -> Result<String, StorageError> {
        let digest = digest_of(&data);
        let manifest = Manifest {
            media_type: media_type.to_string(),
            digest: digest.clone(),
            data,
        };

        let mut manifests = self.manifests.write().await;
        // Address the manifest by tag and by digest, like a real registry
        manifests.insert((repo.to_string(), reference.to_string()), manifest.clone());
        manifests.insert((repo.to_string(), digest.clone()), manifest);
        Ok(digest)
    }

    async fn get_blob(&self, digest: &str) -> Result<Option<Bytes>, StorageError> {
        Ok(self.blobs.read().await.get(digest).cloned())
    }

    async fn stat_blob(&self, digest: &str) -> Result<Option<u64>, StorageError> {
        Ok(self
            .blobs
            .read()
            .await
            .get(digest)
            .map(|data| data.len() as u64))
    }

    async fn put_blob(&self, digest: &str, data: Bytes) -> Result<(), StorageError> {
        self.blobs.write().await.insert(digest.to_string(), data);
        Ok(())
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>, StorageError> {
        let manifests = self.manifests.read().await;
        let mut tags: Vec<String> = manifests
            .keys()
            .filter(|(r, reference)| r == repo && !reference.starts_with("sha256:"))
            .map(|(_, reference)| reference.clone())
            .collect();
        tags.sort();
        Ok(tags)
    }
}
