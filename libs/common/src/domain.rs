use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Errors that can occur when parsing domain names
#[derive(Debug, Clone, thiserror::Error)]
pub enum DomainParseError {
    #[error("Domain cannot be empty")]
    Empty,

    #[error("Domain must not exceed 253 characters")]
    TooLong,

    #[error("Invalid domain label: {0}")]
    InvalidLabel(String),
}

/// An external hostname that Gordon routes traffic for (e.g., "app.example.com")
///
/// Stored lowercased so `Host` header lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Domain(String);

impl Domain {
    pub fn new(s: &str) -> Result<Self, DomainParseError> {
        let trimmed = s.trim().to_ascii_lowercase();

        if trimmed.is_empty() {
            return Err(DomainParseError::Empty);
        }

        if trimmed.len() > 253 {
            return Err(DomainParseError::TooLong);
        }

        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(DomainParseError::InvalidLabel(label.to_string()));
            }
            if !label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                return Err(DomainParseError::InvalidLabel(label.to_string()));
            }
            if label.starts_with('-') || label.ends_with('-') {
                return Err(DomainParseError::InvalidLabel(label.to_string()));
            }
        }

        Ok(Self(trimmed))
    }

    /// Match against a `Host` header value, ignoring any `:port` suffix
    pub fn matches_host(&self, host: &str) -> bool {
        let bare = host.rsplit_once(':').map_or(host, |(h, port)| {
            // "[::1]:8080" style hosts split on the wrong colon unless the
            // port part is all digits
            if port.chars().all(|c| c.is_ascii_digit()) {
                h
            } else {
                host
            }
        });
        bare.eq_ignore_ascii_case(&self.0)
    }
}

impl FromStr for Domain {
    type Err = DomainParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Domain {
    type Error = DomainParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

impl From<Domain> for String {
    fn from(d: Domain) -> Self {
        d.0
    }
}

impl Deref for Domain {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
