use std::collections::HashMap;

use crate::{Domain, ImageRef};

/// The authoritative mapping from an external hostname to an image.
///
/// The deployment reconciler ensures at most one running container per
/// domain; the reverse proxy resolves `Host` headers against this table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Route {
    pub domain: Domain,
    pub image: ImageRef,
    /// Whether the upstream container itself serves HTTPS
    #[serde(default)]
    pub https: bool,
}

/// Read access to the live routing configuration.
///
/// Implemented by the config manager in the binary; consumed by the proxy
/// and the deployment reconciler so neither depends on how config is loaded.
pub trait ConfigService: Send + Sync {
    fn routes(&self) -> Vec<Route>;

    /// Static `domain -> host:port` entries proxied to hosts Gordon does
    /// not manage. Targets must pass SSRF validation before use.
    fn external_routes(&self) -> HashMap<String, String>;
}
