//! Token lifecycle: grant exchange, proactive refresh, introspection,
//! revocation, and claims extraction.

use crate::config::{ClientConfig, GrantType, TokenEndpointAuthMethod};
use crate::discovery::DiscoveryClient;
use crate::encoding::generate_random_string;
use crate::error::{OidcError, Result};
use crate::jwks::JwksClient;
use crate::jwt::{self, IdTokenVerification, SigningKey};
use crate::urls::build_url_encoded_body;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use unrelated_sync::{AcquireOptions, Mutex};

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Tokens returned by the IdP, plus the absolute expiry stamped at receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Unix seconds; `None` when the IdP sent no `expires_in`, in which case
    /// the token is treated as valid indefinitely (introspect to be sure).
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl TokenSet {
    /// Derive `expires_at` from `expires_in` relative to `now`.
    pub fn stamp(&mut self, now: u64) {
        self.expires_at = self.expires_in.map(|ttl| now + ttl);
    }

    /// Whether the access token is still at least `threshold` seconds away
    /// from expiry.
    #[must_use]
    pub fn is_fresh(&self, threshold: u64, now: u64) -> bool {
        match self.expires_at {
            None => true,
            Some(at) => at.saturating_sub(now) >= threshold,
        }
    }
}

/// Client for the token, introspection, revocation, and userinfo endpoints.
///
/// The stored [`TokenSet`] is serialised by a per-client mutex across
/// refresh/store/clear, so concurrent callers that observe a stale token
/// produce exactly one refresh request.
#[derive(Debug)]
pub struct TokenClient {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    discovery: Arc<DiscoveryClient>,
    jwks: Arc<JwksClient>,
    tokens: parking_lot::RwLock<Option<TokenSet>>,
    refresh_lock: Mutex,
}

impl TokenClient {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        config: Arc<ClientConfig>,
        discovery: Arc<DiscoveryClient>,
        jwks: Arc<JwksClient>,
    ) -> Self {
        Self {
            http,
            config,
            discovery,
            jwks,
            tokens: parking_lot::RwLock::new(None),
            refresh_lock: Mutex::with_name("token-refresh"),
        }
    }

    /// The current token set, if any.
    #[must_use]
    pub fn token_set(&self) -> Option<TokenSet> {
        self.tokens.read().clone()
    }

    /// Replace the stored token set verbatim (no restamping).
    pub fn set_token_set(&self, tokens: TokenSet) {
        *self.tokens.write() = Some(tokens);
    }

    /// Drop the stored token set.
    pub fn clear_tokens(&self) {
        *self.tokens.write() = None;
    }

    /// Exchange an authorization code (with its PKCE verifier) for tokens.
    pub async fn exchange_code_for_token(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenSet> {
        let mut params = vec![("code".to_string(), code.to_string())];
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier".to_string(), verifier.to_string()));
        }
        params.push(("redirect_uri".to_string(), self.config.redirect_uri.clone()));
        let tokens = self.token_request("authorization_code", params).await?;
        self.set_token_set(tokens.clone());
        Ok(tokens)
    }

    /// Exchange a device code. Does not store the result; polling does that
    /// once the grant actually succeeds.
    pub async fn exchange_device_code(&self, device_code: &str) -> Result<TokenSet> {
        let params = vec![("device_code".to_string(), device_code.to_string())];
        self.token_request("urn:ietf:params:oauth:grant-type:device_code", params)
            .await
    }

    /// JWT-bearer / SAML2-bearer assertion exchange, per the configured
    /// grant.
    pub async fn exchange_assertion(&self, assertion: &str) -> Result<TokenSet> {
        let grant = match &self.config.grant_type {
            g @ (GrantType::JwtBearer | GrantType::Saml2Bearer) => g
                .token_request_value()
                .unwrap_or_default()
                .to_string(),
            other => {
                return Err(OidcError::UnsupportedGrantType {
                    grant: other.to_string(),
                });
            }
        };
        let params = vec![
            ("assertion".to_string(), assertion.to_string()),
            ("scope".to_string(), self.config.scope_value()),
        ];
        let tokens = self.token_request(&grant, params).await?;
        self.set_token_set(tokens.clone());
        Ok(tokens)
    }

    /// Obtain a token set using the configured grant when no flow-specific
    /// input is required (client credentials or a custom grant).
    pub async fn request_token(&self) -> Result<TokenSet> {
        let grant = match &self.config.grant_type {
            GrantType::ClientCredentials => "client_credentials".to_string(),
            GrantType::Custom(value) => value.clone(),
            other => {
                return Err(OidcError::UnsupportedGrantType {
                    grant: other.to_string(),
                });
            }
        };
        let tokens = self.token_request(&grant, Vec::new()).await?;
        self.set_token_set(tokens.clone());
        Ok(tokens)
    }

    /// Refresh the stored token set.
    ///
    /// Single-flight: losers of the lock race observe the winner's token and
    /// do not hit the network. On failure the prior token set is left intact
    /// so the caller can decide whether to re-authenticate.
    pub async fn refresh_access_token(&self) -> Result<TokenSet> {
        let _guard = self.refresh_lock.acquire(AcquireOptions::default()).await?;

        let now = unix_now_u64();
        if let Some(tokens) = self.token_set()
            && tokens.is_fresh(self.config.token_refresh_threshold, now)
        {
            return Ok(tokens);
        }

        let Some(refresh_token) = self.token_set().and_then(|t| t.refresh_token) else {
            return Err(OidcError::TokenRefresh {
                source: Box::new(OidcError::NoAccessToken),
            });
        };

        let params = vec![("refresh_token".to_string(), refresh_token.clone())];
        match self.token_request("refresh_token", params).await {
            Ok(mut tokens) => {
                // Providers may rotate or omit the refresh token; keep the
                // old one when none comes back.
                if tokens.refresh_token.is_none() {
                    tokens.refresh_token = Some(refresh_token);
                }
                self.set_token_set(tokens.clone());
                Ok(tokens)
            }
            Err(err) => {
                tracing::warn!(error = %err, "token refresh failed; keeping prior tokens");
                Err(OidcError::TokenRefresh {
                    source: Box::new(err),
                })
            }
        }
    }

    /// A valid access token, refreshing or re-acquiring when stale.
    ///
    /// Returns `None` when there is no token and the configured grant cannot
    /// mint one without user interaction.
    pub async fn get_access_token(&self) -> Result<Option<String>> {
        let now = unix_now_u64();
        if let Some(tokens) = self.token_set()
            && tokens.is_fresh(self.config.token_refresh_threshold, now)
        {
            return Ok(Some(tokens.access_token));
        }

        let has_refresh_token = self
            .token_set()
            .and_then(|t| t.refresh_token)
            .is_some();
        if has_refresh_token {
            return Ok(Some(self.refresh_access_token().await?.access_token));
        }

        match &self.config.grant_type {
            GrantType::ClientCredentials | GrantType::Custom(_) => {
                let _guard = self.refresh_lock.acquire(AcquireOptions::default()).await?;
                if let Some(tokens) = self.token_set()
                    && tokens.is_fresh(self.config.token_refresh_threshold, unix_now_u64())
                {
                    return Ok(Some(tokens.access_token));
                }
                Ok(Some(self.request_token().await?.access_token))
            }
            _ => Ok(None),
        }
    }

    /// RFC 7662 token introspection.
    pub async fn introspect_token(
        &self,
        token: &str,
        token_type_hint: Option<&str>,
    ) -> Result<Value> {
        let metadata = self.discovery.discover(false).await?;
        let endpoint = metadata.introspection_endpoint.ok_or(OidcError::EndpointMissing {
            endpoint: "introspection_endpoint",
        })?;

        let mut params = vec![("token".to_string(), token.to_string())];
        if let Some(hint) = token_type_hint {
            params.push(("token_type_hint".to_string(), hint.to_string()));
        }
        let basic = self.apply_client_auth(&mut params, &metadata.token_endpoint)?;
        post_form(&self.http, &endpoint, &params, basic.as_ref()).await
    }

    /// RFC 7009 token revocation. A successfully revoked token that matches
    /// the stored access or refresh token clears the token set.
    pub async fn revoke_token(&self, token: &str, token_type_hint: Option<&str>) -> Result<()> {
        let metadata = self.discovery.discover(false).await?;
        let endpoint = metadata.revocation_endpoint.ok_or(OidcError::EndpointMissing {
            endpoint: "revocation_endpoint",
        })?;

        let mut params = vec![("token".to_string(), token.to_string())];
        if let Some(hint) = token_type_hint {
            params.push(("token_type_hint".to_string(), hint.to_string()));
        }
        let basic = self.apply_client_auth(&mut params, &metadata.token_endpoint)?;
        post_form(&self.http, &endpoint, &params, basic.as_ref()).await?;

        let matches_stored = self.token_set().is_some_and(|t| {
            t.access_token == token || t.refresh_token.as_deref() == Some(token)
        });
        if matches_stored {
            self.clear_tokens();
            tracing::debug!("revoked token matched the stored set; tokens cleared");
        }
        Ok(())
    }

    /// Claims for the current access token: verified JWT payload when the
    /// token is a JWS, otherwise the userinfo response.
    pub async fn get_claims(&self) -> Result<Value> {
        let access_token = self
            .get_access_token()
            .await?
            .ok_or(OidcError::NoAccessToken)?;
        let metadata = self.discovery.discover(false).await?;

        if access_token.matches('.').count() == 2 {
            let checks = IdTokenVerification {
                expected_issuer: &metadata.issuer,
                expected_audience: &self.config.client_id,
                expected_nonce: None,
                clock_skew: self.config.clock_skew,
                max_future_iat: self.config.max_future_iat,
            };
            let decoded = jwt::verify_id_token(&access_token, &self.jwks, &checks).await?;
            return Ok(decoded.payload);
        }

        let endpoint = metadata
            .userinfo_endpoint
            .ok_or(OidcError::UserinfoMissing)?;
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(&access_token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| OidcError::TokenRequest {
                status: e.status().map(|s| s.as_u16()),
                body: None,
                source: Some(Box::new(e)),
            })?;
        response.json().await.map_err(|e| OidcError::TokenRequest {
            status: None,
            body: None,
            source: Some(Box::new(e)),
        })
    }

    /// POST to the token endpoint with the given grant and parameters,
    /// applying client authentication.
    async fn token_request(
        &self,
        grant_type: &str,
        grant_params: Vec<(String, String)>,
    ) -> Result<TokenSet> {
        let metadata = self.discovery.discover(false).await?;
        let mut params = vec![("grant_type".to_string(), grant_type.to_string())];
        params.extend(grant_params);
        let basic = self.apply_client_auth(&mut params, &metadata.token_endpoint)?;

        let body = post_form(&self.http, &metadata.token_endpoint, &params, basic.as_ref()).await?;
        let mut tokens: TokenSet = serde_json::from_value(body).map_err(|e| OidcError::TokenRequest {
            status: None,
            body: None,
            source: Some(Box::new(e)),
        })?;
        tokens.stamp(unix_now_u64());
        Ok(tokens)
    }

    /// Append client-authentication parameters; returns basic-auth
    /// credentials when the method uses the Authorization header.
    fn apply_client_auth(
        &self,
        params: &mut Vec<(String, String)>,
        token_endpoint: &str,
    ) -> Result<Option<(String, String)>> {
        let method = match &self.config.token_endpoint_auth_method {
            TokenEndpointAuthMethod::Other(unknown) => {
                tracing::warn!(
                    method = %unknown,
                    "unrecognised token endpoint auth method; defaulting to client_secret_post"
                );
                TokenEndpointAuthMethod::ClientSecretPost
            }
            method => method.clone(),
        };

        params.push(("client_id".to_string(), self.config.client_id.clone()));
        match &method {
            TokenEndpointAuthMethod::ClientSecretPost => {
                let secret = self.require_secret(&method)?;
                params.push(("client_secret".to_string(), secret.to_string()));
                Ok(None)
            }
            TokenEndpointAuthMethod::ClientSecretBasic => {
                let secret = self.require_secret(&method)?;
                Ok(Some((self.config.client_id.clone(), secret.to_string())))
            }
            TokenEndpointAuthMethod::ClientSecretJwt => {
                let secret = self.require_secret(&method)?;
                let assertion = self.client_assertion(
                    token_endpoint,
                    "HS256",
                    &SigningKey::Secret(secret.as_bytes()),
                )?;
                params.push((
                    "client_assertion_type".to_string(),
                    CLIENT_ASSERTION_TYPE.to_string(),
                ));
                params.push(("client_assertion".to_string(), assertion));
                Ok(None)
            }
            TokenEndpointAuthMethod::PrivateKeyJwt => {
                let pem = self
                    .config
                    .private_key_pem
                    .as_deref()
                    .ok_or(OidcError::MissingPrivateKey)?;
                let alg = self
                    .config
                    .request_object_signing_alg
                    .as_deref()
                    .ok_or(OidcError::MissingSigningAlg)?;
                let key = if alg.starts_with("ES") {
                    SigningKey::EcPem(pem)
                } else {
                    SigningKey::RsaPem(pem)
                };
                let assertion = self.client_assertion(token_endpoint, alg, &key)?;
                params.push((
                    "client_assertion_type".to_string(),
                    CLIENT_ASSERTION_TYPE.to_string(),
                ));
                params.push(("client_assertion".to_string(), assertion));
                Ok(None)
            }
            TokenEndpointAuthMethod::TlsClientAuth => {
                // The certificate is presented at the TLS layer; the body
                // carries only the client id.
                if !self.config.tls_client_bound_access_token {
                    return Err(OidcError::MissingTlsCert);
                }
                Ok(None)
            }
            TokenEndpointAuthMethod::None | TokenEndpointAuthMethod::Other(_) => Ok(None),
        }
    }

    fn require_secret(&self, method: &TokenEndpointAuthMethod) -> Result<&str> {
        self.config
            .client_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| OidcError::MissingClientSecret {
                method: method.to_string(),
            })
    }

    /// RFC 7523 client-authentication assertion.
    fn client_assertion(
        &self,
        token_endpoint: &str,
        alg: &str,
        key: &SigningKey<'_>,
    ) -> Result<String> {
        let now = jwt::unix_now();
        let claims = json!({
            "iss": self.config.client_id,
            "sub": self.config.client_id,
            "aud": token_endpoint,
            "jti": generate_random_string(16)?,
            "iat": now,
            "exp": now + 300,
        });
        jwt::encode(alg, None, &claims, key)
    }
}

/// POST a form body; returns the parsed JSON response (or `Null` for an
/// empty success body). Non-2xx responses become `TOKEN_REQUEST_ERROR` with
/// the status and parsed body attached for diagnostics.
pub(crate) async fn post_form(
    http: &reqwest::Client,
    url: &str,
    params: &[(String, String)],
    basic: Option<&(String, String)>,
) -> Result<Value> {
    let body = build_url_encoded_body(params)?;
    let mut request = http
        .post(url)
        .header(
            reqwest::header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )
        .body(body);
    if let Some((user, pass)) = basic {
        request = request.basic_auth(user, Some(pass));
    }

    let response = request.send().await.map_err(|e| OidcError::TokenRequest {
        status: None,
        body: None,
        source: Some(Box::new(e)),
    })?;
    let status = response.status();
    let text = response.text().await.map_err(|e| OidcError::TokenRequest {
        status: Some(status.as_u16()),
        body: None,
        source: Some(Box::new(e)),
    })?;
    let parsed: Option<Value> = if text.trim().is_empty() {
        None
    } else {
        Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    };

    if !status.is_success() {
        return Err(OidcError::TokenRequest {
            status: Some(status.as_u16()),
            body: parsed,
            source: None,
        });
    }
    Ok(parsed.unwrap_or(Value::Null))
}

pub(crate) fn unix_now_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PkceMethod;

    fn client_with(config: ClientConfig) -> TokenClient {
        let http = reqwest::Client::new();
        let discovery = Arc::new(
            DiscoveryClient::new(http.clone(), "https://idp/.well-known/openid-configuration")
                .expect("discovery"),
        );
        let jwks = Arc::new(JwksClient::new(http.clone(), Arc::clone(&discovery)));
        TokenClient::new(http, Arc::new(config), discovery, jwks)
    }

    fn base_config(method: TokenEndpointAuthMethod) -> ClientConfig {
        let mut cfg = ClientConfig::new(
            "abc",
            "https://app/cb",
            "https://idp/.well-known/openid-configuration",
            GrantType::AuthorizationCode,
        );
        cfg.pkce = true;
        cfg.pkce_method = Some(PkceMethod::S256);
        cfg.token_endpoint_auth_method = method;
        cfg
    }

    fn keys(params: &[(String, String)]) -> Vec<&str> {
        params.iter().map(|(k, _)| k.as_str()).collect()
    }

    #[test]
    fn token_set_freshness() {
        let mut tokens = TokenSet {
            access_token: "a".to_string(),
            refresh_token: None,
            id_token: None,
            token_type: Some("Bearer".to_string()),
            expires_in: Some(3600),
            scope: None,
            expires_at: None,
        };
        tokens.stamp(1_000);
        assert_eq!(tokens.expires_at, Some(4_600));
        assert!(tokens.is_fresh(60, 1_000));
        assert!(tokens.is_fresh(60, 4_540));
        assert!(!tokens.is_fresh(60, 4_541));
        assert!(!tokens.is_fresh(60, 9_000));

        // No expires_in means valid indefinitely.
        tokens.expires_at = None;
        assert!(tokens.is_fresh(60, u64::MAX));
    }

    #[test]
    fn client_secret_post_puts_secret_in_body() {
        let mut cfg = base_config(TokenEndpointAuthMethod::ClientSecretPost);
        cfg.client_secret = Some("s3cret".to_string());
        let client = client_with(cfg);

        let mut params = Vec::new();
        let basic = client
            .apply_client_auth(&mut params, "https://idp/token")
            .expect("auth");
        assert!(basic.is_none());
        assert_eq!(keys(&params), vec!["client_id", "client_secret"]);
    }

    #[test]
    fn client_secret_basic_keeps_secret_out_of_body() {
        let mut cfg = base_config(TokenEndpointAuthMethod::ClientSecretBasic);
        cfg.client_secret = Some("s3cret".to_string());
        let client = client_with(cfg);

        let mut params = Vec::new();
        let basic = client
            .apply_client_auth(&mut params, "https://idp/token")
            .expect("auth");
        assert_eq!(basic, Some(("abc".to_string(), "s3cret".to_string())));
        assert_eq!(keys(&params), vec!["client_id"]);
    }

    #[test]
    fn client_secret_jwt_attaches_an_hmac_assertion() {
        let mut cfg = base_config(TokenEndpointAuthMethod::ClientSecretJwt);
        cfg.client_secret = Some("s3cret".to_string());
        let client = client_with(cfg);

        let mut params = Vec::new();
        client
            .apply_client_auth(&mut params, "https://idp/token")
            .expect("auth");
        assert_eq!(
            keys(&params),
            vec!["client_id", "client_assertion_type", "client_assertion"]
        );
        assert_eq!(params[1].1, CLIENT_ASSERTION_TYPE);

        let assertion = &params[2].1;
        let decoded = jwt::decode(assertion).expect("decode");
        assert_eq!(decoded.header.alg, "HS256");
        assert_eq!(decoded.payload["iss"], "abc");
        assert_eq!(decoded.payload["sub"], "abc");
        assert_eq!(decoded.payload["aud"], "https://idp/token");
        jwt::verify_signature(
            assertion,
            &jsonwebtoken::DecodingKey::from_secret(b"s3cret"),
            "HS256",
        )
        .expect("assertion verifies with the client secret");
    }

    #[test]
    fn missing_material_yields_specific_errors() {
        let client = client_with(base_config(TokenEndpointAuthMethod::ClientSecretPost));
        let mut params = Vec::new();
        let err = client
            .apply_client_auth(&mut params, "https://idp/token")
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_CLIENT_SECRET");

        let client = client_with(base_config(TokenEndpointAuthMethod::PrivateKeyJwt));
        let mut params = Vec::new();
        let err = client
            .apply_client_auth(&mut params, "https://idp/token")
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_PRIVATE_KEY");

        let client = client_with(base_config(TokenEndpointAuthMethod::TlsClientAuth));
        let mut params = Vec::new();
        let err = client
            .apply_client_auth(&mut params, "https://idp/token")
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_TLS_CERT");
    }

    #[test]
    fn none_method_sends_only_the_client_id() {
        let client = client_with(base_config(TokenEndpointAuthMethod::None));
        let mut params = Vec::new();
        let basic = client
            .apply_client_auth(&mut params, "https://idp/token")
            .expect("auth");
        assert!(basic.is_none());
        assert_eq!(keys(&params), vec!["client_id"]);
    }

    #[test]
    fn unknown_method_falls_back_to_client_secret_post() {
        let mut cfg = base_config(TokenEndpointAuthMethod::Other("bespoke_auth".to_string()));
        cfg.client_secret = Some("s3cret".to_string());
        let client = client_with(cfg);

        let mut params = Vec::new();
        let basic = client
            .apply_client_auth(&mut params, "https://idp/token")
            .expect("auth");
        assert!(basic.is_none());
        assert_eq!(keys(&params), vec!["client_id", "client_secret"]);
    }

    #[tokio::test]
    async fn request_token_rejects_interactive_grants() {
        let client = client_with(base_config(TokenEndpointAuthMethod::None));
        let err = client.request_token().await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_GRANT_TYPE");
    }

    #[tokio::test]
    async fn refresh_without_a_refresh_token_fails() {
        let client = client_with(base_config(TokenEndpointAuthMethod::None));
        client.set_token_set(TokenSet {
            access_token: "old".to_string(),
            refresh_token: None,
            id_token: None,
            token_type: None,
            expires_in: Some(3600),
            scope: None,
            expires_at: Some(0),
        });
        let err = client.refresh_access_token().await.unwrap_err();
        assert_eq!(err.code(), "TOKEN_REFRESH_ERROR");
    }
}
