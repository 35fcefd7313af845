use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Errors that can occur when parsing image references
#[derive(Debug, Clone, thiserror::Error)]
pub enum ImageParseError {
    #[error("Image reference cannot be empty")]
    Empty,

    #[error("Invalid repository name: {0}")]
    InvalidRepository(String),

    #[error("Invalid tag: {0}")]
    InvalidTag(String),
}

/// A container image reference (e.g., "myorg/app:v1")
///
/// Can represent:
/// - Images in Gordon's own registry: "myorg/app:v1"
/// - Fully qualified public registry URLs: "ghcr.io/org/repo:tag"
/// - Docker Hub shorthand: "nginx:latest"
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    repository: String,
    tag: String,
    // Cached full reference for efficiency
    #[serde(skip)]
    full_ref: String,
}

impl ImageRef {
    /// Parse an image reference. If no tag is specified, defaults to "latest".
    pub fn parse(image: &str) -> Result<Self, ImageParseError> {
        if image.trim().is_empty() {
            return Err(ImageParseError::Empty);
        }

        // A colon after the last slash separates the tag; a colon before it
        // belongs to a registry host port ("registry.example.com:5000/app")
        let (repository, tag) = match image.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (image, "latest"),
        };

        if repository.is_empty() || repository.len() > 255 {
            return Err(ImageParseError::InvalidRepository(
                "Repository must be 1-255 characters".to_string(),
            ));
        }

        if !repository
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':'))
        {
            return Err(ImageParseError::InvalidRepository(
                "Repository can only contain alphanumeric, hyphens, underscores, dots, slashes"
                    .to_string(),
            ));
        }

        if tag.is_empty() || tag.len() > 128 {
            return Err(ImageParseError::InvalidTag(
                "Tag must be 1-128 characters".to_string(),
            ));
        }

        if !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ImageParseError::InvalidTag(
                "Tag can only contain alphanumeric, hyphens, underscores, and dots".to_string(),
            ));
        }

        let full_ref = format!("{}:{}", repository, tag);

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            full_ref,
        })
    }

    /// Repository without tag (e.g., "myorg/app")
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag (e.g., "v1", "latest")
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Full reference including tag (e.g., "myorg/app:v1")
    pub fn as_str(&self) -> &str {
        &self.full_ref
    }
}

impl FromStr for ImageRef {
    type Err = ImageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = ImageParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ImageRef> for String {
    fn from(img: ImageRef) -> Self {
        img.full_ref
    }
}

impl Deref for ImageRef {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.full_ref
    }
}

impl AsRef<str> for ImageRef {
    fn as_ref(&self) -> &str {
        &self.full_ref
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_ref)
    }
}
