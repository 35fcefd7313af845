//! Config file loading and live reload.
//!
//! Gordon reads one TOML file. The [`ConfigManager`] keeps the parsed
//! config behind a lock, revalidates and swaps it on reload (SIGHUP), and
//! publishes a `config.reload` event so the proxy and the reconciler pick
//! up route changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use common::{ConfigService, Domain, Event, EventBus, ImageRef, Route};
use serde::Deserialize;
use token_store::SecretsBackendKind;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid route domain {0:?}: {1}")]
    RouteDomain(String, common::DomainParseError),

    #[error("Invalid route image {0:?}: {1}")]
    RouteImage(String, common::ImageParseError),

    #[error("External route {domain:?} rejected: {reason}")]
    ExternalRoute { domain: String, reason: String },

    #[error("auth.jwt_secret or auth.jwt_secret_file is required when auth is enabled")]
    MissingJwtSecret,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// domain -> image
    #[serde(default)]
    pub routes: HashMap<String, String>,
    /// domain -> host:port, proxied to hosts Gordon does not manage
    #[serde(default)]
    pub external_routes: HashMap<String, String>,
    #[serde(default)]
    pub routes_https: HttpsRoutes,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    #[serde(default = "default_registry_port")]
    pub registry_port: u16,
    /// Domain serving Gordon's own registry through the proxy
    #[serde(default)]
    pub registry_domain: Option<String>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub registry_storage: StorageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Fs,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_auth_type")]
    pub auth_type: registry_auth::AuthType,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub jwt_secret_file: Option<PathBuf>,
    #[serde(default = "default_issuer")]
    pub token_issuer: String,
    #[serde(default)]
    pub secrets_backend: SecretsBackendKind,
    /// username -> bcrypt hash
    #[serde(default)]
    pub users: HashMap<String, String>,
    #[serde(default)]
    pub internal: InternalPair,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct InternalPair {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct HttpsRoutes {
    #[serde(default)]
    pub domains: Vec<String>,
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_registry_port() -> u16 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_auth_type() -> registry_auth::AuthType {
    registry_auth::AuthType::Password
}

fn default_issuer() -> String {
    "gordon".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            proxy_port: default_proxy_port(),
            registry_port: default_registry_port(),
            registry_domain: None,
            data_dir: None,
            registry_storage: StorageKind::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auth_type: default_auth_type(),
            jwt_secret: None,
            jwt_secret_file: None,
            token_issuer: default_issuer(),
            secrets_backend: SecretsBackendKind::Pass,
            users: HashMap::new(),
            internal: InternalPair::default(),
        }
    }
}

impl Config {
    /// The HS256 signing secret, inline or from a file.
    pub fn jwt_secret(&self) -> Result<String, ConfigError> {
        if let Some(secret) = &self.auth.jwt_secret {
            return Ok(secret.clone());
        }
        if let Some(path) = &self.auth.jwt_secret_file {
            let secret = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            return Ok(secret.trim().to_string());
        }
        Err(ConfigError::MissingJwtSecret)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.server.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("gordon")
        })
    }
}

/// Parse and validate one config file.
pub async fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = toml::from_str(&raw)?;
    validate(&config).await?;
    Ok(config)
}

async fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.auth.enabled {
        config.jwt_secret()?;
    }

    for (domain, image) in &config.routes {
        Domain::new(domain).map_err(|e| ConfigError::RouteDomain(domain.clone(), e))?;
        ImageRef::parse(image).map_err(|e| ConfigError::RouteImage(image.clone(), e))?;
    }

    // Refuse to start with an external route pointing into a blocked range
    for (domain, target) in &config.external_routes {
        proxy::validate_external_route_target(target)
            .await
            .map_err(|e| ConfigError::ExternalRoute {
                domain: domain.clone(),
                reason: e.to_string(),
            })?;
    }

    Ok(())
}

/// Live configuration handle shared across subsystems.
pub struct ConfigManager {
    path: PathBuf,
    current: RwLock<Config>,
    bus: EventBus,
}

impl ConfigManager {
    pub async fn load(path: PathBuf, bus: EventBus) -> Result<Self, ConfigError> {
        let config = load(&path).await?;
        info!(path = %path.display(), routes = config.routes.len(), "loaded configuration");
        Ok(Self {
            path,
            current: RwLock::new(config),
            bus,
        })
    }

    pub fn current(&self) -> Config {
        self.current.read().unwrap().clone()
    }

    /// Re-read the config file; on success swap it in and publish
    /// `config.reload`. A broken file keeps the previous config running.
    pub async fn reload(&self) {
        match load(&self.path).await {
            Ok(config) => {
                *self.current.write().unwrap() = config;
                info!(path = %self.path.display(), "reloaded configuration");
                self.bus.publish(Event::ConfigReloaded);
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "config reload failed, keeping previous config");
            }
        }
    }
}

impl ConfigService for ConfigManager {
    fn routes(&self) -> Vec<Route> {
        let config = self.current.read().unwrap();
        let https_domains = &config.routes_https.domains;

        let mut routes = Vec::with_capacity(config.routes.len());
        for (domain, image) in &config.routes {
            let (Ok(domain), Ok(image)) = (Domain::new(domain), ImageRef::parse(image)) else {
                // Validated at load time; only a racing edit can get here
                warn!(domain = %domain, "skipping invalid route entry");
                continue;
            };
            let https = https_domains.iter().any(|d| domain.matches_host(d));
            routes.push(Route {
                domain,
                image,
                https,
            });
        }
        routes.sort_by(|a, b| a.domain.as_ref().cmp(b.domain.as_ref()));
        routes
    }

    fn external_routes(&self) -> HashMap<String, String> {
        self.current.read().unwrap().external_routes.clone()
    }
}
