use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use time::{Duration, OffsetDateTime};
use token_store::{StoreError, TokenRecord, TokenStore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::claims::TokenClaims;

/// How clients are expected to authenticate against the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Password,
    Token,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Token signing failed: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The authentication capability set the registry endpoints consume.
///
/// Implementations differ in storage; the HTTP layers only see this trait.
#[async_trait::async_trait]
pub trait AuthService: Send + Sync {
    fn auth_type(&self) -> AuthType;

    fn is_enabled(&self) -> bool;

    /// Check a username/password pair. Never reveals whether the user
    /// exists; the only outcomes are yes and no.
    async fn validate_password(&self, username: &str, password: &str) -> bool;

    /// Verify a JWT: signature, then expiry (when present), then the
    /// revocation list.
    async fn validate_token(&self, jwt: &str) -> Result<TokenClaims, AuthError>;

    /// Mint and persist an identity token. A zero `ttl` means the token
    /// never expires and the JWT carries no `exp` claim.
    async fn generate_token(
        &self,
        subject: &str,
        scopes: Vec<String>,
        ttl: Duration,
    ) -> Result<String, AuthError>;

    /// Mint a short-lived access token that is never persisted.
    ///
    /// Because nothing is stored, revocation cannot reach these; keep the
    /// TTL short (the token endpoint uses 5 minutes).
    async fn generate_access_token(
        &self,
        subject: &str,
        scopes: Vec<String>,
        ttl: Duration,
    ) -> Result<String, AuthError>;

    async fn revoke_token(&self, id: &str) -> Result<(), AuthError>;

    /// Revoke every stored token; returns how many were revoked.
    async fn revoke_all_tokens(&self) -> Result<usize, AuthError>;

    async fn list_tokens(&self) -> Result<Vec<TokenRecord>, AuthError>;
}

/// Configuration for [`JwtAuthService`]
pub struct JwtAuthConfig {
    pub enabled: bool,
    pub auth_type: AuthType,
    /// HS256 signing secret
    pub jwt_secret: String,
    /// `iss` claim value
    pub issuer: String,
    /// username -> bcrypt hash, used in password mode
    pub users: HashMap<String, String>,
}

/// [`AuthService`] implementation signing HS256 JWTs and persisting
/// identity tokens in a [`TokenStore`].
pub struct JwtAuthService {
    enabled: bool,
    auth_type: AuthType,
    issuer: String,
    users: HashMap<String, String>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    store: Arc<TokenStore>,
}

// A well-formed bcrypt hash (of an arbitrary string) verified against when
// the username is unknown, so lookup misses cost the same as hash mismatches.
const UNKNOWN_USER_HASH: &str = "$2a$12$R9h/cIPz0gi.URNNX3kh2OPST9/PgBkqquzi.Ss7KIUgO2t0jWMUW";

impl JwtAuthService {
    pub fn new(config: JwtAuthConfig, store: Arc<TokenStore>) -> Self {
        Self {
            enabled: config.enabled,
            auth_type: config.auth_type,
            issuer: config.issuer,
            users: config.users,
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            store,
        }
    }

    fn mint(
        &self,
        subject: &str,
        scopes: Vec<String>,
        ttl: Duration,
    ) -> Result<(TokenClaims, String), AuthError> {
        let now = OffsetDateTime::now_utc();
        let exp = if ttl.is_zero() {
            None
        } else {
            Some((now + ttl).unix_timestamp())
        };

        let claims = TokenClaims {
            jti: Uuid::new_v4().to_string(),
            sub: subject.to_string(),
            scopes,
            iat: now.unix_timestamp(),
            exp,
            iss: self.issuer.clone(),
        };

        let jwt = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(AuthError::Signing)?;
        Ok((claims, jwt))
    }
}

#[async_trait::async_trait]
impl AuthService for JwtAuthService {
    fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn validate_password(&self, username: &str, password: &str) -> bool {
        match self.users.get(username) {
            Some(hash) => bcrypt::verify(password, hash).unwrap_or(false),
            None => {
                // Burn a verification anyway so response timing does not
                // reveal which usernames exist
                let _ = bcrypt::verify(password, UNKNOWN_USER_HASH);
                false
            }
        }
    }

    async fn validate_token(&self, jwt: &str) -> Result<TokenClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Never-expiring identity tokens omit `exp` entirely; expiry is
        // still enforced whenever the claim is present
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = true;
        validation.validate_aud = false;

        let data = decode::<TokenClaims>(jwt, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => {
                    debug!(error = %e, "token failed verification");
                    AuthError::InvalidToken
                }
            }
        })?;

        if self.store.is_revoked(&data.claims.jti).await? {
            warn!(jti = %data.claims.jti, "rejected revoked token");
            return Err(AuthError::TokenRevoked);
        }

        Ok(data.claims)
    }

    async fn generate_token(
        &self,
        subject: &str,
        scopes: Vec<String>,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let (claims, jwt) = self.mint(subject, scopes, ttl)?;

        let record = TokenRecord {
            id: claims.jti.clone(),
            subject: subject.to_string(),
            scopes: claims.scopes.clone(),
            issued_at: claims.iat,
            expires_at: claims.exp.unwrap_or(0),
            revoked: false,
            last_extended_at: 0,
        };
        self.store.save_token(&record, &jwt).await?;

        debug!(subject, jti = %claims.jti, "issued identity token");
        Ok(jwt)
    }

    async fn generate_access_token(
        &self,
        subject: &str,
        scopes: Vec<String>,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let (claims, jwt) = self.mint(subject, scopes, ttl)?;
        debug!(subject, jti = %claims.jti, "issued access token");
        Ok(jwt)
    }

    async fn revoke_token(&self, id: &str) -> Result<(), AuthError> {
        self.store.revoke_token(id).await?;
        Ok(())
    }

    async fn revoke_all_tokens(&self) -> Result<usize, AuthError> {
        Ok(self.store.revoke_all().await?)
    }

    async fn list_tokens(&self) -> Result<Vec<TokenRecord>, AuthError> {
        Ok(self.store.list_tokens().await?)
    }
}
