use std::path::{Path, PathBuf};

use axum::body::Bytes;
use tracing::debug;

use super::{Manifest, RegistryStorage, StorageError, digest_of};

/// Filesystem registry storage.
///
/// Blobs are content-addressed under `blobs/sha256/<hex>`; manifests live
/// under `manifests/<repo>/<reference>` with a sidecar `.type` file for
/// the media type. References that are digests reuse the blob encoding to
/// stay filename-safe.
pub struct FsRegistryStorage {
    blobs_dir: PathBuf,
    manifests_dir: PathBuf,
}

impl FsRegistryStorage {
    pub fn new(data_dir: &Path) -> Result<Self, StorageError> {
        let base = data_dir.join("registry");
        let blobs_dir = base.join("blobs").join("sha256");
        let manifests_dir = base.join("manifests");
        std::fs::create_dir_all(&blobs_dir)?;
        std::fs::create_dir_all(&manifests_dir)?;
        Ok(Self {
            blobs_dir,
            manifests_dir,
        })
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf, StorageError> {
        let hex = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| StorageError::InvalidDigest(digest.to_string()))?;
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest(digest.to_string()));
        }
        Ok(self.blobs_dir.join(hex))
    }

    fn manifest_path(&self, repo: &str, reference: &str) -> PathBuf {
        // Digest references contain a colon; store them by their hex part
        let reference = reference.strip_prefix("sha256:").unwrap_or(reference);
        self.manifests_dir.join(repo).join(reference)
    }
}

/// `<manifest path>.type` sidecar holding the media type.
///
/// Appends rather than `with_extension`, which would clobber dotted tags
/// like `v1.2`.
fn type_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".type");
    PathBuf::from(os)
}

#[async_trait::async_trait]
impl RegistryStorage for FsRegistryStorage {
    async fn get_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<Option<Manifest>, StorageError> {
        let path = self.manifest_path(repo, reference);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let media_type = tokio::fs::read_to_string(type_path(&path))
            .await
            .unwrap_or_else(|_| "application/vnd.docker.distribution.manifest.v2+json".to_string());

        Ok(Some(Manifest {
            media_type: media_type.trim().to_string(),
            digest: digest_of(&data),
            data,
        }))
    }

    async fn put_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        data: Bytes,
    ) -> Result<String, StorageError> {
        let digest = digest_of(&data);

        for reference in [reference, digest.as_str()] {
            let path = self.manifest_path(repo, reference);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &data).await?;
            tokio::fs::write(type_path(&path), media_type).await?;
        }

        debug!(repo, reference, %digest, "wrote manifest files");
        Ok(digest)
    }

    async fn get_blob(&self, digest: &str) -> Result<Option<Bytes>, StorageError> {
        match tokio::fs::read(self.blob_path(digest)?).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn stat_blob(&self, digest: &str) -> Result<Option<u64>, StorageError> {
        match tokio::fs::metadata(self.blob_path(digest)?).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_blob(&self, digest: &str, data: Bytes) -> Result<(), StorageError> {
        let actual = digest_of(&data);
        if actual != digest {
            return Err(StorageError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        tokio::fs::write(self.blob_path(digest)?, &data).await?;
        Ok(())
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.manifests_dir.join(repo);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut tags = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".type") {
                continue;
            }
            // Digest-addressed copies are 64 hex chars; everything else is
            // a tag
            if name.len() == 64 && name.chars().all(|c| c.is_ascii_hexdigit()) {
                continue;
            }
            if entry.file_type().await?.is_file() {
                tags.push(name);
            }
        }
        tags.sort();
        Ok(tags)
    }
}
