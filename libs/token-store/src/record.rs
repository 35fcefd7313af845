use time::OffsetDateTime;

/// Metadata persisted alongside each identity token JWT.
///
/// Timestamps are unix seconds. `expires_at == 0` means the token never
/// expires.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenRecord {
    /// Stable token ID; equals the JWT `jti` claim
    pub id: String,
    pub subject: String,
    /// Scope strings in `type:name:actions` form
    pub scopes: Vec<String>,
    pub issued_at: i64,
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub revoked: bool,
    /// When sliding expiry last pushed `expires_at` forward
    #[serde(default)]
    pub last_extended_at: i64,
}

impl TokenRecord {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at != 0 && self.expires_at <= now.unix_timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_expiry_never_expires() {
        let record = TokenRecord {
            id: "t1".to_string(),
            subject: "alice".to_string(),
            scopes: vec!["repository:*:pull".to_string()],
            issued_at: 0,
            expires_at: 0,
            revoked: false,
            last_extended_at: 0,
        };
        assert!(!record.is_expired(OffsetDateTime::now_utc()));
    }

    #[test]
    fn test_past_expiry_is_expired() {
        let now = OffsetDateTime::now_utc();
        let record = TokenRecord {
            id: "t1".to_string(),
            subject: "alice".to_string(),
            scopes: vec![],
            issued_at: now.unix_timestamp() - 7200,
            expires_at: now.unix_timestamp() - 3600,
            revoked: false,
            last_extended_at: 0,
        };
        assert!(record.is_expired(now));
    }

    #[test]
    fn test_meta_json_field_names() {
        let record = TokenRecord {
            id: "t1".to_string(),
            subject: "alice".to_string(),
            scopes: vec!["repository:*:pull".to_string()],
            issued_at: 100,
            expires_at: 200,
            revoked: false,
            last_extended_at: 150,
        };
        let json = serde_json::to_value(&record).unwrap();
        for key in [
            "id",
            "subject",
            "scopes",
            "issued_at",
            "expires_at",
            "revoked",
            "last_extended_at",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
    }
}
