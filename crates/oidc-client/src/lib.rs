//! OpenID Connect relying-party client.
//!
//! A server-side application uses this crate to delegate user
//! authentication to an external identity provider and to obtain, validate,
//! refresh, introspect, and revoke the tokens that authorize its API calls.
//!
//! Components are independently constructible and wired by plain
//! constructor composition; [`OidcClient`] bundles the usual set for hosts
//! that want a single handle:
//!
//! - [`discovery::DiscoveryClient`]: single-flight, TTL-cached
//!   `.well-known/openid-configuration` retrieval
//! - [`jwks::JwksClient`]: signing-key fetch, cache, and selection
//! - [`auth::Auth`]: authorization URLs, redirect handling, device flow,
//!   logout
//! - [`token::TokenClient`]: grant exchange, proactive refresh,
//!   introspection, revocation, claims
//!
//! Concurrency primitives (the scheduling/deadlock-aware mutex and the TTL
//! cache) live in the sibling `unrelated-sync` crate.

pub mod auth;
pub mod config;
pub mod discovery;
pub mod encoding;
pub mod error;
pub mod jwks;
pub mod jwt;
pub mod pkce;
pub mod session;
pub mod state;
pub mod token;
pub mod urls;

pub use auth::{Auth, AuthorizationRequest, DeviceAuthorization};
pub use config::{ClientConfig, GrantType, PkceMethod, ResponseMode, TokenEndpointAuthMethod};
pub use discovery::{DiscoveryClient, ProviderMetadata};
pub use error::{OidcError, Result};
pub use jwks::{Jwk, Jwks, JwksClient};
pub use session::SessionStore;
pub use state::{StateEntry, StateLedger};
pub use token::{TokenClient, TokenSet};

use std::sync::Arc;

/// Facade wiring discovery, JWKS, token, and auth components for one
/// relying-party client.
#[derive(Debug)]
pub struct OidcClient {
    config: Arc<ClientConfig>,
    discovery: Arc<DiscoveryClient>,
    jwks: Arc<JwksClient>,
    tokens: Arc<TokenClient>,
    auth: Auth,
}

impl OidcClient {
    /// Validate `config` and assemble the component graph on `http`.
    pub fn new(config: ClientConfig, http: reqwest::Client) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let discovery = Arc::new(DiscoveryClient::new(http.clone(), &config.discovery_url)?);
        let jwks = Arc::new(JwksClient::new(http.clone(), Arc::clone(&discovery)));
        let tokens = Arc::new(TokenClient::new(
            http.clone(),
            Arc::clone(&config),
            Arc::clone(&discovery),
            Arc::clone(&jwks),
        ));
        let auth = Auth::new(
            Arc::clone(&config),
            http,
            Arc::clone(&discovery),
            Arc::clone(&jwks),
            Arc::clone(&tokens),
        );
        Ok(Self {
            config,
            discovery,
            jwks,
            tokens,
            auth,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn discovery(&self) -> &Arc<DiscoveryClient> {
        &self.discovery
    }

    #[must_use]
    pub fn jwks(&self) -> &Arc<JwksClient> {
        &self.jwks
    }

    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenClient> {
        &self.tokens
    }

    #[must_use]
    pub fn auth(&self) -> &Auth {
        &self.auth
    }
}
