//! Docker Registry v2 Token Authentication
//!
//! This crate implements the Docker Registry v2 token authentication
//! protocol for Gordon's registry:
//! <https://distribution.github.io/distribution/spec/auth/token/>
//!
//! - [`scope`]: parse and match `type:name:actions` scope strings
//! - [`service`]: the [`AuthService`] capability set (passwords, JWTs,
//!   revocation) backed by a [`token_store::TokenStore`]
//! - [`server`]: the `/auth/password` and `/auth/token` HTTP endpoints
//! - [`middleware`]: per-request scope enforcement on the `/v2` surface

mod claims;
mod internal;
pub mod middleware;
pub mod scope;
mod server;
mod service;

pub use claims::TokenClaims;
pub use internal::InternalCredentials;
pub use middleware::{RegistryAuthState, registry_auth_v2};
pub use scope::{AdminScope, Scope, ScopeError, has_admin_access, scopes_allow};
pub use server::{TokenServerState, router};
pub use service::{AuthError, AuthService, AuthType, JwtAuthService, JwtAuthConfig};
