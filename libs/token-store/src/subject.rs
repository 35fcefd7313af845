use crate::StoreError;

/// Validate a token subject before it is used to build a backend path.
///
/// Accepted subjects match `^[A-Za-z0-9/_.@-]+$`, never contain `..`, and
/// never end with the reserved `.meta` suffix. Everything else is rejected
/// so a subject can be interpolated into a `pass` entry path or a filename
/// without escaping.
pub fn validate_subject(subject: &str) -> Result<(), StoreError> {
    if subject.is_empty() {
        return Err(StoreError::InvalidSubject("subject is empty".to_string()));
    }

    if let Some(bad) = subject
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '/' | '_' | '.' | '@' | '-'))
    {
        return Err(StoreError::InvalidSubject(format!(
            "subject contains disallowed character {bad:?}"
        )));
    }

    if subject.contains("..") {
        return Err(StoreError::InvalidSubject(
            "subject must not contain '..'".to_string(),
        ));
    }

    if subject.ends_with(".meta") {
        return Err(StoreError::InvalidSubject(
            "subject must not end with the reserved '.meta' suffix".to_string(),
        ));
    }

    Ok(())
}
