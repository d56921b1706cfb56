//! Discovery-metadata retrieval (`.well-known/openid-configuration`).

use crate::error::{OidcError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use unrelated_sync::{AcquireOptions, Mutex, TtlCache};

const DISCOVERY_CACHE_KEY: &str = "discoveryConfig";
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Provider metadata, validated so the four required endpoints are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub jwks_uri: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub introspection_endpoint: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub device_authorization_endpoint: Option<String>,
    /// Anything else the provider advertises, kept verbatim.
    #[serde(flatten)]
    pub additional: serde_json::Map<String, serde_json::Value>,
}

/// Raw document as fetched; required fields are checked by hand so a missing
/// endpoint surfaces as `INVALID_DISCOVERY_CONFIG` rather than a parse error.
#[derive(Debug, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    issuer: Option<String>,
    #[serde(default)]
    jwks_uri: Option<String>,
    #[serde(default)]
    authorization_endpoint: Option<String>,
    #[serde(default)]
    token_endpoint: Option<String>,
    #[serde(default)]
    userinfo_endpoint: Option<String>,
    #[serde(default)]
    introspection_endpoint: Option<String>,
    #[serde(default)]
    revocation_endpoint: Option<String>,
    #[serde(default)]
    end_session_endpoint: Option<String>,
    #[serde(default)]
    device_authorization_endpoint: Option<String>,
    #[serde(flatten)]
    additional: serde_json::Map<String, serde_json::Value>,
}

impl RawMetadata {
    fn validate(self) -> Result<ProviderMetadata> {
        fn required(value: Option<String>, field: &'static str) -> Result<String> {
            match value {
                Some(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(OidcError::InvalidDiscoveryConfig { field }),
            }
        }

        Ok(ProviderMetadata {
            issuer: required(self.issuer, "issuer")?,
            jwks_uri: required(self.jwks_uri, "jwks_uri")?,
            authorization_endpoint: required(self.authorization_endpoint, "authorization_endpoint")?,
            token_endpoint: required(self.token_endpoint, "token_endpoint")?,
            userinfo_endpoint: self.userinfo_endpoint,
            introspection_endpoint: self.introspection_endpoint,
            revocation_endpoint: self.revocation_endpoint,
            end_session_endpoint: self.end_session_endpoint,
            device_authorization_endpoint: self.device_authorization_endpoint,
            additional: self.additional,
        })
    }
}

/// Single-flight, TTL-cached fetch of the provider's discovery document.
#[derive(Debug)]
pub struct DiscoveryClient {
    http: reqwest::Client,
    discovery_url: String,
    ttl: Duration,
    cache: TtlCache<ProviderMetadata>,
    fetch_lock: Mutex,
}

impl DiscoveryClient {
    pub fn new(http: reqwest::Client, discovery_url: &str) -> Result<Self> {
        Self::with_ttl(http, discovery_url, DEFAULT_TTL)
    }

    pub fn with_ttl(http: reqwest::Client, discovery_url: &str, ttl: Duration) -> Result<Self> {
        if url::Url::parse(discovery_url).is_err() {
            return Err(OidcError::InvalidDiscoveryUrl {
                url: discovery_url.to_string(),
            });
        }
        Ok(Self {
            http,
            discovery_url: discovery_url.to_string(),
            ttl,
            cache: TtlCache::new(ttl),
            fetch_lock: Mutex::with_name("discovery-fetch"),
        })
    }

    #[must_use]
    pub fn discovery_url(&self) -> &str {
        &self.discovery_url
    }

    /// Fetch (or return the cached) provider metadata.
    ///
    /// Concurrent callers against a cold cache share one HTTP fetch: losers
    /// of the lock race find the winner's result in the cache.
    pub async fn discover(&self, force_refresh: bool) -> Result<ProviderMetadata> {
        if !force_refresh
            && let Some(meta) = self.cache.get(DISCOVERY_CACHE_KEY)
        {
            return Ok(meta);
        }

        let _guard = self.fetch_lock.acquire(AcquireOptions::default()).await?;
        if !force_refresh
            && let Some(meta) = self.cache.get(DISCOVERY_CACHE_KEY)
        {
            return Ok(meta);
        }

        let meta = self.fetch().await?;
        self.cache
            .set(DISCOVERY_CACHE_KEY, meta.clone(), Some(self.ttl))?;
        Ok(meta)
    }

    /// Drop the cached document; the next `discover` refetches.
    pub fn invalidate(&self) {
        self.cache.delete(DISCOVERY_CACHE_KEY);
    }

    async fn fetch(&self) -> Result<ProviderMetadata> {
        tracing::debug!(url = %self.discovery_url, "fetching discovery metadata");
        let response = self
            .http
            .get(&self.discovery_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| OidcError::Discovery { source: Box::new(e) })?;
        let raw: RawMetadata = response
            .json()
            .await
            .map_err(|e| OidcError::Discovery { source: Box::new(e) })?;
        raw.validate()
    }
}
