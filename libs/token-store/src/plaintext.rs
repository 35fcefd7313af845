use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::record::TokenRecord;
use crate::store::SecretsBackend;
use crate::StoreError;

/// Opt-in gate for storing secrets in plaintext files
pub const ALLOW_UNSAFE_ENV: &str = "GORDON_ALLOW_UNSAFE_SECRETS";

/// On-disk JSON payload: the JWT plus its metadata in one file
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StoredToken {
    jwt: String,
    metadata: TokenRecord,
}

/// Token backend storing plaintext JSON files on disk.
///
/// Refuses to construct unless `GORDON_ALLOW_UNSAFE_SECRETS=true`.
/// Filenames are the hex sha256 of the subject, so a hostile subject can
/// never escape the tokens directory; the original subject survives inside
/// the JSON payload. Directories are created `0700`, files `0600`.
pub struct PlaintextVault {
    tokens_dir: PathBuf,
    revoked_path: PathBuf,
}

impl PlaintextVault {
    pub fn new(data_dir: &Path) -> Result<Self, StoreError> {
        let opted_in = std::env::var(ALLOW_UNSAFE_ENV).is_ok_and(|v| v == "true");
        if !opted_in {
            return Err(StoreError::Unavailable(format!(
                "plaintext secrets backend requires {ALLOW_UNSAFE_ENV}=true"
            )));
        }

        let base = data_dir.join("secrets").join("gordon").join("registry");
        let tokens_dir = base.join("tokens");
        create_private_dir(&tokens_dir)?;

        warn!(
            dir = %tokens_dir.display(),
            "storing registry tokens in PLAINTEXT files; use the pass backend in production"
        );

        Ok(Self {
            revoked_path: base.join("revoked.json"),
            tokens_dir,
        })
    }

    fn token_path(&self, subject: &str) -> PathBuf {
        let digest = Sha256::digest(subject.as_bytes());
        self.tokens_dir.join(format!("{}.json", hex::encode(digest)))
    }
}

fn create_private_dir(dir: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(dir)?;
    Ok(())
}

async fn write_private_file(path: &Path, contents: &str) -> Result<(), StoreError> {
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait::async_trait]
impl SecretsBackend for PlaintextVault {
    async fn store(
        &self,
        subject: &str,
        jwt: &str,
        record: &TokenRecord,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string_pretty(&StoredToken {
            jwt: jwt.to_string(),
            metadata: record.clone(),
        })?;
        write_private_file(&self.token_path(subject), &payload).await?;
        debug!(subject, "stored token file");
        Ok(())
    }

    async fn load(&self, subject: &str) -> Result<Option<(String, TokenRecord)>, StoreError> {
        let Some(contents) = read_optional(&self.token_path(subject)).await? else {
            return Ok(None);
        };
        let stored: StoredToken = serde_json::from_str(&contents)?;
        Ok(Some((stored.jwt, stored.metadata)))
    }

    async fn remove(&self, subject: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.token_path(subject)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_subjects(&self) -> Result<Vec<String>, StoreError> {
        let mut subjects = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.tokens_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(subjects),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match read_optional(&path).await? {
                Some(contents) => match serde_json::from_str::<StoredToken>(&contents) {
                    Ok(stored) => subjects.push(stored.metadata.subject),
                    Err(err) => {
                        warn!(path = %path.display(), %err, "skipping unreadable token file");
                    }
                },
                None => {}
            }
        }
        Ok(subjects)
    }

    async fn load_revoked(&self) -> Result<Vec<String>, StoreError> {
        match read_optional(&self.revoked_path).await? {
            Some(contents) => Ok(serde_json::from_str(&contents)?),
            None => Ok(Vec::new()),
        }
    }

    async fn store_revoked(&self, ids: &[String]) -> Result<(), StoreError> {
        let contents = serde_json::to_string(ids)?;
        write_private_file(&self.revoked_path, &contents).await
    }
}
