use crate::scope::scopes_allow;

/// JWT claims carried by Gordon identity and access tokens
///
/// `exp` is omitted entirely for never-expiring tokens.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TokenClaims {
    /// Token ID; identity tokens persist under this ID and revocation is
    /// keyed on it
    pub jti: String,
    /// Subject (user identifier)
    pub sub: String,
    /// Granted scope strings
    pub scopes: Vec<String>,
    /// Issued at (unix timestamp)
    pub iat: i64,
    /// Expiration time (unix timestamp), absent when the token never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Issuer
    pub iss: String,
}

impl TokenClaims {
    /// Whether these claims permit `action` on repository `repo`
    pub fn can_access(&self, repo: &str, action: &str) -> bool {
        scopes_allow(&self.scopes, repo, action)
    }
}
