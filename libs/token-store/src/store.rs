use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::record::TokenRecord;
use crate::subject::validate_subject;
use crate::{PassVault, PlaintextVault, StoreError, sops};

/// Per-call budget for a single backend operation
const BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw persistence behind a [`TokenStore`].
///
/// Implementations store a JWT plus its [`TokenRecord`] per subject and a
/// single revocation list. They do not validate subjects or cache; the
/// store does both.
#[async_trait::async_trait]
pub trait SecretsBackend: Send + Sync {
    async fn store(
        &self,
        subject: &str,
        jwt: &str,
        record: &TokenRecord,
    ) -> Result<(), StoreError>;

    async fn load(&self, subject: &str) -> Result<Option<(String, TokenRecord)>, StoreError>;

    async fn remove(&self, subject: &str) -> Result<(), StoreError>;

    async fn list_subjects(&self) -> Result<Vec<String>, StoreError>;

    async fn load_revoked(&self) -> Result<Vec<String>, StoreError>;

    async fn store_revoked(&self, ids: &[String]) -> Result<(), StoreError>;
}

/// Which secrets backend to construct at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretsBackendKind {
    #[default]
    Pass,
    Unsafe,
    Sops,
}

/// Construct the configured backend, failing fast when it is unavailable.
pub async fn open_backend(
    kind: SecretsBackendKind,
    data_dir: &Path,
) -> Result<Arc<dyn SecretsBackend>, StoreError> {
    match kind {
        SecretsBackendKind::Pass => Ok(Arc::new(PassVault::new().await?)),
        SecretsBackendKind::Unsafe => Ok(Arc::new(PlaintextVault::new(data_dir)?)),
        SecretsBackendKind::Sops => Err(sops::unavailable()),
    }
}

/// Token persistence with an in-memory read-through cache.
///
/// Cache reads take a shared lock; anything that mutates backend state takes
/// the exclusive lock for the whole operation. In particular [`Self::revoke`]
/// holds the exclusive revocation lock across its read-modify-write cycle so
/// a successful `revoke(id)` is visible to every later `is_revoked(id)`.
pub struct TokenStore {
    backend: Arc<dyn SecretsBackend>,
    cache: RwLock<HashMap<String, (String, TokenRecord)>>,
    revoked: RwLock<Option<HashSet<String>>>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn SecretsBackend>) -> Self {
        Self {
            backend,
            cache: RwLock::new(HashMap::new()),
            revoked: RwLock::new(None),
        }
    }

    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(BACKEND_TIMEOUT, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    /// The stored JWT and metadata for a subject, if any.
    pub async fn get_token(
        &self,
        subject: &str,
    ) -> Result<Option<(String, TokenRecord)>, StoreError> {
        validate_subject(subject)?;

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(subject) {
                debug!(subject, "token cache hit");
                return Ok(Some(entry.clone()));
            }
        }

        let loaded = self.with_timeout(self.backend.load(subject)).await?;
        if let Some((jwt, record)) = &loaded {
            let mut cache = self.cache.write().await;
            cache.insert(subject.to_string(), (jwt.clone(), record.clone()));
        }
        Ok(loaded)
    }

    /// Persist a token, replacing any previous token for the same subject.
    pub async fn save_token(&self, record: &TokenRecord, jwt: &str) -> Result<(), StoreError> {
        validate_subject(&record.subject)?;

        let mut cache = self.cache.write().await;
        self.with_timeout(self.backend.store(&record.subject, jwt, record))
            .await?;
        cache.insert(record.subject.clone(), (jwt.to_string(), record.clone()));
        Ok(())
    }

    /// Replace the JWT and expiry metadata of an existing token.
    ///
    /// Fails with [`StoreError::NotFound`] when the subject has no stored
    /// token; sliding expiry must never create records.
    pub async fn update_token_expiry(
        &self,
        record: &TokenRecord,
        new_jwt: &str,
    ) -> Result<(), StoreError> {
        validate_subject(&record.subject)?;

        let mut cache = self.cache.write().await;
        let existing = self.with_timeout(self.backend.load(&record.subject)).await?;
        let Some((_, previous)) = existing else {
            return Err(StoreError::NotFound(record.subject.clone()));
        };
        if previous.id != record.id {
            return Err(StoreError::UnknownTokenId(record.id.clone()));
        }

        self.with_timeout(self.backend.store(&record.subject, new_jwt, record))
            .await?;
        cache.insert(
            record.subject.clone(),
            (new_jwt.to_string(), record.clone()),
        );
        Ok(())
    }

    pub async fn delete_token(&self, subject: &str) -> Result<(), StoreError> {
        validate_subject(subject)?;

        let mut cache = self.cache.write().await;
        self.with_timeout(self.backend.remove(subject)).await?;
        cache.remove(subject);
        Ok(())
    }

    /// All stored token records.
    ///
    /// Each subject is loaded under its own fresh timeout so one slow
    /// subject cannot exhaust the budget of its siblings. Subjects that
    /// fail to load are skipped with a warning.
    pub async fn list_tokens(&self) -> Result<Vec<TokenRecord>, StoreError> {
        let subjects = self.with_timeout(self.backend.list_subjects()).await?;

        let mut records = Vec::with_capacity(subjects.len());
        for subject in subjects {
            if let Err(err) = validate_subject(&subject) {
                warn!(subject, %err, "skipping invalid subject from backend listing");
                continue;
            }
            match self.with_timeout(self.backend.load(&subject)).await {
                Ok(Some((_, record))) => records.push(record),
                Ok(None) => {}
                Err(err) => {
                    warn!(subject, %err, "failed to load token, skipping");
                }
            }
        }
        Ok(records)
    }

    /// Add a token ID to the revocation list.
    ///
    /// The whole read-modify-write runs under the exclusive lock and the
    /// cached set is updated before the lock is released, so revocation is
    /// linearizable with respect to [`Self::is_revoked`].
    pub async fn revoke(&self, id: &str) -> Result<(), StoreError> {
        let mut revoked = self.revoked.write().await;

        let mut ids = self.with_timeout(self.backend.load_revoked()).await?;
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
            self.with_timeout(self.backend.store_revoked(&ids)).await?;
        }

        *revoked = Some(ids.into_iter().collect());
        Ok(())
    }

    /// Whether a token ID is on the revocation list.
    pub async fn is_revoked(&self, id: &str) -> Result<bool, StoreError> {
        {
            let revoked = self.revoked.read().await;
            if let Some(set) = revoked.as_ref() {
                return Ok(set.contains(id));
            }
        }

        // One-shot load, double-checked under the write lock
        let mut revoked = self.revoked.write().await;
        if revoked.is_none() {
            let ids = self.with_timeout(self.backend.load_revoked()).await?;
            *revoked = Some(ids.into_iter().collect());
        }
        Ok(revoked.as_ref().is_some_and(|set| set.contains(id)))
    }

    /// Revoke the token with the given ID, marking its stored record and
    /// adding the ID to the revocation list.
    pub async fn revoke_token(&self, id: &str) -> Result<(), StoreError> {
        let subjects = self.with_timeout(self.backend.list_subjects()).await?;

        for subject in subjects {
            if validate_subject(&subject).is_err() {
                continue;
            }
            let Some((jwt, mut record)) = self.with_timeout(self.backend.load(&subject)).await?
            else {
                continue;
            };
            if record.id != id {
                continue;
            }

            record.revoked = true;
            {
                let mut cache = self.cache.write().await;
                self.with_timeout(self.backend.store(&subject, &jwt, &record))
                    .await?;
                cache.insert(subject.clone(), (jwt, record));
            }
            return self.revoke(id).await;
        }

        Err(StoreError::UnknownTokenId(id.to_string()))
    }

    /// Revoke every stored token. Returns how many were revoked.
    pub async fn revoke_all(&self) -> Result<usize, StoreError> {
        let records = self.list_tokens().await?;
        let mut count = 0;
        for record in records {
            if record.revoked {
                continue;
            }
            self.revoke_token(&record.id).await?;
            count += 1;
        }
        Ok(count)
    }
}
