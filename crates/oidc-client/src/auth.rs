//! Authorization-flow orchestration: authorization URLs, redirect handling,
//! the device-code flow, and RP-initiated logout.

use crate::config::{ClientConfig, GrantType};
use crate::discovery::DiscoveryClient;
use crate::encoding::generate_random_string;
use crate::error::{OidcError, Result};
use crate::jwks::JwksClient;
use crate::jwt::{self, IdTokenVerification};
use crate::pkce::generate_pkce;
use crate::state::{StateEntry, StateLedger};
use crate::token::{TokenClient, TokenSet, post_form, unix_now_u64};
use crate::urls::{self, AuthorizationUrlParams, LogoutUrlParams};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

/// Everything the host needs to send the browser off to the IdP.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub code_verifier: Option<String>,
}

/// Response to a device-authorization request (RFC 8628 §3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    #[serde(default = "default_device_interval")]
    pub interval: u64,
}

fn default_device_interval() -> u64 {
    5
}

/// Orchestrates the browser-facing flows and binds redirects back to the
/// pending authentication via the state ledger.
#[derive(Debug)]
pub struct Auth {
    config: Arc<ClientConfig>,
    http: reqwest::Client,
    discovery: Arc<DiscoveryClient>,
    jwks: Arc<JwksClient>,
    tokens: Arc<TokenClient>,
    ledger: StateLedger,
}

impl Auth {
    #[must_use]
    pub fn new(
        config: Arc<ClientConfig>,
        http: reqwest::Client,
        discovery: Arc<DiscoveryClient>,
        jwks: Arc<JwksClient>,
        tokens: Arc<TokenClient>,
    ) -> Self {
        Self {
            config,
            http,
            discovery,
            jwks,
            tokens,
            ledger: StateLedger::new(),
        }
    }

    /// The pending-authorization ledger, for host-side garbage collection.
    #[must_use]
    pub fn state_ledger(&self) -> &StateLedger {
        &self.ledger
    }

    /// Build the authorization URL and record the pending state.
    ///
    /// `extra` parameters are appended after the standard ones (and after
    /// the config's `additional_params`).
    pub async fn authorization_url(
        &self,
        extra: &[(String, String)],
    ) -> Result<AuthorizationRequest> {
        if !self.config.grant_type.supports_authorization_url() {
            return Err(OidcError::InvalidGrantType {
                grant: self.config.grant_type.to_string(),
                operation: "an authorization URL",
            });
        }

        let metadata = self.discovery.discover(false).await?;
        let state = generate_random_string(16)?;
        let nonce = generate_random_string(16)?;

        let pkce = if self.config.pkce && self.config.grant_type == GrantType::AuthorizationCode {
            Some(generate_pkce(self.config.pkce_method)?)
        } else {
            None
        };

        // The ledger entry must exist before the URL leaves this function,
        // or a fast redirect could race it.
        self.ledger
            .add_state(
                &state,
                &nonce,
                pkce.as_ref().map(|p| p.code_verifier.as_str()),
            )
            .await?;

        let mut merged: Vec<(String, String)> = self.config.additional_params.clone();
        merged.extend_from_slice(extra);
        if let Some(max_age) = self.config.max_age {
            merged.push(("max_age".to_string(), max_age.to_string()));
        }
        if let Some(ui_locales) = &self.config.ui_locales {
            merged.push(("ui_locales".to_string(), ui_locales.clone()));
        }

        let url = urls::build_authorization_url(
            &AuthorizationUrlParams {
                authorization_endpoint: &metadata.authorization_endpoint,
                response_type: &self.config.response_type,
                client_id: &self.config.client_id,
                redirect_uri: &self.config.redirect_uri,
                scopes: &self.config.scopes,
                state: &state,
                code_challenge: pkce.as_ref().map(|p| p.code_challenge.as_str()),
                code_challenge_method: pkce
                    .as_ref()
                    .and_then(|_| self.config.pkce_method)
                    .map(|m| m.as_str()),
                prompt: self.config.prompt.as_deref(),
                display: self.config.display.as_deref(),
                response_mode: self.config.response_mode.map(|m| m.as_str()),
                nonce: Some(&nonce),
                acr_values: self.config.acr_values.as_deref(),
            },
            &merged,
        )?;

        tracing::debug!(state = %state, "authorization URL issued");
        Ok(AuthorizationRequest {
            url,
            state,
            code_verifier: pkce.map(|p| p.code_verifier),
        })
    }

    /// Handle the authorization-code redirect: consume the state, exchange
    /// the code, and verify the ID token against the recorded nonce.
    pub async fn handle_redirect(&self, code: &str, returned_state: &str) -> Result<TokenSet> {
        let entry = self.ledger.take_state(returned_state).await?;

        if self.config.pkce
            && self.config.grant_type == GrantType::AuthorizationCode
            && entry.code_verifier.is_none()
        {
            return Err(OidcError::CodeVerifierMissing);
        }

        let tokens = self
            .tokens
            .exchange_code_for_token(code, entry.code_verifier.as_deref())
            .await
            .map_err(|e| OidcError::TokenExchange {
                source: Box::new(e),
            })?;

        if let Some(id_token) = tokens.id_token.as_deref() {
            self.verify_id_token(id_token, &entry).await?;
        }

        tracing::debug!("authorization code redirect handled");
        Ok(tokens)
    }

    /// Handle an implicit-flow redirect fragment
    /// (`access_token=…&state=…`, with or without the leading `#`).
    pub async fn handle_redirect_implicit(&self, fragment: &str) -> Result<TokenSet> {
        let fragment = fragment.trim_start_matches('#');
        let mut fields: Vec<(String, String)> = Vec::new();
        for (key, value) in url::form_urlencoded::parse(fragment.as_bytes()) {
            fields.push((key.into_owned(), value.into_owned()));
        }
        let get = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        if let Some(error) = get("error") {
            let description = get("error_description").unwrap_or("no description");
            return Err(OidcError::Token {
                message: format!("{error}: {description}"),
            });
        }

        let access_token = get("access_token").ok_or(OidcError::TokenNotFound)?;
        let state = get("state").ok_or(OidcError::StateMissing)?;
        let entry = self.ledger.take_state(state).await?;

        if let Some(id_token) = get("id_token") {
            self.verify_id_token(id_token, &entry).await?;
        }

        let mut tokens = TokenSet {
            access_token: access_token.to_string(),
            refresh_token: None,
            id_token: get("id_token").map(str::to_string),
            token_type: get("token_type").map(str::to_string),
            expires_in: get("expires_in").and_then(|v| v.parse().ok()),
            scope: get("scope").map(str::to_string),
            expires_at: None,
        };
        tokens.stamp(unix_now_u64());
        self.tokens.set_token_set(tokens.clone());
        Ok(tokens)
    }

    /// Start the device-code flow (RFC 8628).
    pub async fn start_device_authorization(&self) -> Result<DeviceAuthorization> {
        if self.config.grant_type != GrantType::DeviceCode {
            return Err(OidcError::InvalidGrantType {
                grant: self.config.grant_type.to_string(),
                operation: "device authorization",
            });
        }
        let metadata = self.discovery.discover(false).await?;
        let endpoint = metadata
            .device_authorization_endpoint
            .ok_or(OidcError::EndpointMissing {
                endpoint: "device_authorization_endpoint",
            })?;

        let params = vec![
            ("client_id".to_string(), self.config.client_id.clone()),
            ("scope".to_string(), self.config.scope_value()),
        ];
        let body = post_form(&self.http, &endpoint, &params, None).await?;
        let authorization: DeviceAuthorization =
            serde_json::from_value(body).map_err(|e| OidcError::TokenRequest {
                status: None,
                body: None,
                source: Some(Box::new(e)),
            })?;
        tracing::debug!(user_code = %authorization.user_code, "device authorization started");
        Ok(authorization)
    }

    /// Poll the token endpoint until the user approves the device code.
    ///
    /// `authorization_pending` keeps the interval, `slow_down` adds five
    /// seconds, `expired_token` aborts. An overall `timeout`, when given,
    /// bounds the whole wait.
    pub async fn poll_device_token(
        &self,
        device_code: &str,
        interval: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<TokenSet> {
        let mut interval = interval.unwrap_or(DEFAULT_POLL_INTERVAL);
        let started = tokio::time::Instant::now();

        loop {
            if let Some(timeout) = timeout
                && started.elapsed() >= timeout
            {
                return Err(OidcError::Timeout);
            }

            match self.tokens.exchange_device_code(device_code).await {
                Ok(tokens) => {
                    self.tokens.set_token_set(tokens.clone());
                    tracing::debug!("device code approved");
                    return Ok(tokens);
                }
                Err(err) => match device_poll_error_code(&err) {
                    Some("authorization_pending") => {}
                    Some("slow_down") => {
                        interval += SLOW_DOWN_INCREMENT;
                        tracing::debug!(interval_secs = interval.as_secs(), "slow_down received");
                    }
                    Some("expired_token") => return Err(OidcError::DeviceCodeExpired),
                    Some(code) => {
                        return Err(OidcError::TokenPolling {
                            error_code: code.to_string(),
                            description: device_poll_error_description(&err),
                        });
                    }
                    None => return Err(err),
                },
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Build the RP-initiated logout URL.
    pub async fn logout_url(
        &self,
        id_token_hint: Option<&str>,
        state: Option<&str>,
    ) -> Result<String> {
        let metadata = self.discovery.discover(false).await?;
        let endpoint = metadata
            .end_session_endpoint
            .as_deref()
            .ok_or(OidcError::EndpointMissing {
                endpoint: "end_session_endpoint",
            })?;

        urls::build_logout_url(&LogoutUrlParams {
            end_session_endpoint: endpoint,
            client_id: &self.config.client_id,
            post_logout_redirect_uri: self.config.post_logout_redirect_uri.as_deref(),
            id_token_hint,
            state,
            logout_hint: None,
            ui_locales: self.config.ui_locales.as_deref(),
        })
    }

    async fn verify_id_token(&self, id_token: &str, entry: &StateEntry) -> Result<()> {
        let metadata = self.discovery.discover(false).await?;
        let checks = IdTokenVerification {
            expected_issuer: &metadata.issuer,
            expected_audience: &self.config.client_id,
            expected_nonce: Some(entry.nonce.as_str()),
            clock_skew: self.config.clock_skew,
            max_future_iat: self.config.max_future_iat,
        };
        jwt::verify_id_token(id_token, &self.jwks, &checks).await?;
        Ok(())
    }
}

/// The OAuth error code inside a token-endpoint error response, if the
/// failure was an HTTP error with a JSON body.
fn device_poll_error_code(err: &OidcError) -> Option<&str> {
    match err {
        OidcError::TokenRequest { body: Some(body), .. } => {
            body.get("error").and_then(serde_json::Value::as_str)
        }
        _ => None,
    }
}

fn device_poll_error_description(err: &OidcError) -> Option<String> {
    match err {
        OidcError::TokenRequest { body: Some(body), .. } => body
            .get("error_description")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
