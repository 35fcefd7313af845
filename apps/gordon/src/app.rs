//! Wires the subsystems together and runs the two listeners: the
//! registry (with the token server mounted under `/auth`) and the
//! reverse proxy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, middleware};
use common::{Event, EventBus};
use gordon_core::deploy::Deployer;
use gordon_core::docker::DockerCli;
use gordon_core::registry::{
    FsRegistryStorage, MemoryRegistryStorage, RegistryState, RegistryStorage,
};
use proxy::{ProxyConfig, ProxyService, spawn_event_listener};
use registry_auth::{
    AuthService, InternalCredentials, JwtAuthConfig, JwtAuthService, RegistryAuthState,
    TokenServerState, registry_auth_v2,
};
use token_store::TokenStore;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{ConfigManager, StorageKind};

/// How often the reconciler re-checks the runtime between config reloads
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let bus = EventBus::new(64);
    let manager = Arc::new(ConfigManager::load(config_path, bus.clone()).await?);
    let config = manager.current();
    let data_dir = config.data_dir();

    // Token store: fail fast if the chosen backend is unavailable
    let backend = token_store::open_backend(config.auth.secrets_backend, &data_dir).await?;
    let store = Arc::new(TokenStore::new(backend));

    let auth: Arc<dyn AuthService> = Arc::new(JwtAuthService::new(
        JwtAuthConfig {
            enabled: config.auth.enabled,
            auth_type: config.auth.auth_type,
            jwt_secret: if config.auth.enabled {
                config.jwt_secret()?
            } else {
                config.jwt_secret().unwrap_or_default()
            },
            issuer: config.auth.token_issuer.clone(),
            users: config.auth.users.clone(),
        },
        store,
    ));
    let internal = InternalCredentials::new(
        config.auth.internal.username.clone(),
        config.auth.internal.password.clone(),
    );

    let runtime = Arc::new(DockerCli::default());
    let proxy_service = Arc::new(ProxyService::new(
        ProxyConfig {
            registry_domain: config.server.registry_domain.clone(),
            registry_port: config.server.registry_port,
        },
        manager.clone(),
        runtime.clone(),
        runtime.clone(),
    )?);
    spawn_event_listener(proxy_service.clone(), &bus);

    spawn_reconciler(
        Deployer::new(runtime, bus.clone()),
        manager.clone(),
        bus.clone(),
    );
    spawn_sighup_handler(manager.clone());

    let storage: Arc<dyn RegistryStorage> = match config.server.registry_storage {
        StorageKind::Fs => Arc::new(FsRegistryStorage::new(&data_dir)?),
        StorageKind::Memory => Arc::new(MemoryRegistryStorage::new()),
    };

    let registry_app = Router::new()
        .nest(
            "/auth",
            registry_auth::router(TokenServerState {
                auth: auth.clone(),
                internal: internal.clone(),
            }),
        )
        .merge(
            gordon_core::registry::router(RegistryState::new(storage)).layer(
                middleware::from_fn_with_state(
                    RegistryAuthState { auth, internal },
                    registry_auth_v2,
                ),
            ),
        )
        .layer(TraceLayer::new_for_http());

    let proxy_app = proxy::router(proxy_service).layer(TraceLayer::new_for_http());

    let registry_addr = SocketAddr::from(([0, 0, 0, 0], config.server.registry_port));
    let proxy_addr = SocketAddr::from(([0, 0, 0, 0], config.server.proxy_port));
    let registry_listener = TcpListener::bind(registry_addr).await?;
    let proxy_listener = TcpListener::bind(proxy_addr).await?;
    info!(%registry_addr, %proxy_addr, "gordon listening");

    let registry_server = axum::serve(
        registry_listener,
        registry_app.into_make_service_with_connect_info::<SocketAddr>(),
    );
    let proxy_server = axum::serve(
        proxy_listener,
        proxy_app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    tokio::try_join!(registry_server.into_future(), proxy_server.into_future())?;
    Ok(())
}

/// Reconcile at startup, on every config reload, and on a slow interval so
/// crashed containers come back without operator action.
fn spawn_reconciler(deployer: Deployer, manager: Arc<ConfigManager>, bus: EventBus) {
    tokio::spawn(async move {
        use common::ConfigService;

        let mut events = bus.subscribe();
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);

        loop {
            let routes = manager.routes();
            if let Err(err) = deployer.reconcile(&routes).await {
                error!(error = %err, "reconcile pass failed");
            }

            loop {
                tokio::select! {
                    _ = ticker.tick() => break,
                    event = events.recv() => match event {
                        Ok(Event::ConfigReloaded) => break,
                        Ok(_) => continue,
                        Err(_) => break,
                    },
                }
            }
        }
    });
}

fn spawn_sighup_handler(manager: Arc<ConfigManager>) {
    tokio::spawn(async move {
        let mut hangup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(signal) => signal,
                Err(err) => {
                    error!(error = %err, "failed to install SIGHUP handler");
                    return;
                }
            };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading configuration");
            manager.reload().await;
        }
    });
}
