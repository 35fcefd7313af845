//! Registry authorization scopes.
//!
//! A scope is a `type:name:actions` string, e.g.
//! `repository:myorg/app:push,pull` or `admin:*:read`. The name may be a
//! literal repository path, a bare `*`, or a prefix wildcard `myorg/*`.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScopeError {
    #[error("Invalid scope: {0}")]
    InvalidScope(String),
}

/// A parsed repository scope
///
/// Action order is preserved so [`Scope::to_string`] reproduces the input
/// exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Resource class, "repository" or "admin"
    pub resource_type: String,
    /// Repository name, `*`, or prefix wildcard `prefix/*`
    pub name: String,
    /// Actions in original order (e.g. ["push", "pull"])
    pub actions: Vec<String>,
}

impl Scope {
    /// Parse a `type:name:actions` scope string.
    ///
    /// Splits on `:` at most twice; anything with fewer than three parts is
    /// rejected. Actions are comma-separated and trimmed.
    pub fn parse(s: &str) -> Result<Self, ScopeError> {
        let mut parts = s.splitn(3, ':');
        let (Some(resource_type), Some(name), Some(actions)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ScopeError::InvalidScope(s.to_string()));
        };

        Ok(Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            actions: actions.split(',').map(|a| a.trim().to_string()).collect(),
        })
    }

    /// Whether this scope permits `action` on the repository `repo`.
    ///
    /// Name matching is literal, `*`, or prefix wildcard: `myorg/*` covers
    /// `myorg/app` and `myorg/team/app` but never `myorg` itself. A scope
    /// with an empty name grants nothing.
    pub fn can_access(&self, repo: &str, action: &str) -> bool {
        if self.resource_type != "repository" {
            return false;
        }
        if self.name.is_empty() {
            return false;
        }

        let name_matches = self.name == repo
            || self.name == "*"
            || self
                .name
                .strip_suffix("/*")
                .is_some_and(|prefix| repo.starts_with(&format!("{prefix}/")));

        let action_matches = self.actions.iter().any(|a| a == action || a == "*");

        name_matches && action_matches
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource_type,
            self.name,
            self.actions.join(",")
        )
    }
}

impl FromStr for Scope {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A parsed administrative scope, `admin:<resource>:<actions>`
///
/// Actions are drawn from `read`, `write`, `*`; a `*` resource matches
/// anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminScope {
    pub resource: String,
    pub actions: Vec<String>,
}

impl AdminScope {
    pub fn parse(s: &str) -> Result<Self, ScopeError> {
        let scope = Scope::parse(s)?;
        if scope.resource_type != "admin" {
            return Err(ScopeError::InvalidScope(s.to_string()));
        }
        Ok(Self {
            resource: scope.name,
            actions: scope.actions,
        })
    }

    pub fn can_access(&self, resource: &str, action: &str) -> bool {
        if self.resource.is_empty() {
            return false;
        }
        let resource_matches = self.resource == resource || self.resource == "*";
        let action_matches = self.actions.iter().any(|a| a == action || a == "*");
        resource_matches && action_matches
    }
}

/// Whether any of the scope strings grants admin `action` on `resource`.
pub fn has_admin_access(scopes: &[String], resource: &str, action: &str) -> bool {
    scopes.iter().any(|s| {
        AdminScope::parse(s).is_ok_and(|admin| admin.can_access(resource, action))
    })
}

/// Whether any of the scope strings permits `action` on repository `repo`.
///
/// Two forms are honoured: full `repository:name:actions` scope strings,
/// and the bare action names `push` / `pull` that password-login tokens
/// carry as an unrestricted grant of that action.
pub fn scopes_allow(scopes: &[String], repo: &str, action: &str) -> bool {
    scopes.iter().any(|s| {
        if s == action {
            return true;
        }
        Scope::parse(s).is_ok_and(|scope| scope.can_access(repo, action))
    })
}
