use subtle::ConstantTimeEq;

/// Pre-shared credential pair for Gordon's own registry client.
///
/// Callers on the loopback interface presenting this pair skip JWT
/// authentication entirely (the "internal bypass"). An empty username or
/// password disables the bypass; both components are compared in constant
/// time and both must match.
#[derive(Debug, Clone, Default)]
pub struct InternalCredentials {
    username: String,
    password: String,
}

impl InternalCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// A pair that never matches anything
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    pub fn matches(&self, username: &str, password: &str) -> bool {
        if !self.is_configured() {
            return false;
        }
        // Evaluate both comparisons unconditionally; no short-circuit on the
        // username so a mismatch in either component takes the same time
        let user_ok = ct_eq(username, &self.username);
        let pass_ok = ct_eq(password, &self.password);
        user_ok & pass_ok
    }
}

fn ct_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
