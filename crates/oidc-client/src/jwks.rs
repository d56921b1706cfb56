//! JWKS retrieval, caching, and key selection.

use crate::discovery::DiscoveryClient;
use crate::error::{OidcError, Result};
use crate::jwt::JwsHeader;
use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use unrelated_sync::{AcquireOptions, Mutex, TtlCache};

const JWKS_CACHE_KEY: &str = "jwks";
const DEFAULT_TTL: Duration = Duration::from_secs(600);
/// Floor between refresh attempts so attacker-chosen `kid`s cannot drive a
/// fetch loop.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ops: Option<Vec<String>>,
    // RSA components (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    // EC components.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    // Symmetric key material.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Fetches the provider's key set and resolves JWS headers to verification
/// keys.
#[derive(Debug)]
pub struct JwksClient {
    http: reqwest::Client,
    discovery: Arc<DiscoveryClient>,
    ttl: Duration,
    cache: TtlCache<Jwks>,
    fetch_lock: Mutex,
    last_attempt: parking_lot::Mutex<Option<Instant>>,
}

impl JwksClient {
    #[must_use]
    pub fn new(http: reqwest::Client, discovery: Arc<DiscoveryClient>) -> Self {
        Self::with_ttl(http, discovery, DEFAULT_TTL)
    }

    #[must_use]
    pub fn with_ttl(http: reqwest::Client, discovery: Arc<DiscoveryClient>, ttl: Duration) -> Self {
        Self {
            http,
            discovery,
            ttl,
            cache: TtlCache::new(ttl),
            fetch_lock: Mutex::with_name("jwks-fetch"),
            last_attempt: parking_lot::Mutex::new(None),
        }
    }

    /// Resolve the verification key for a JWS header.
    ///
    /// A key that is absent from the cached set triggers one refetch (rate
    /// limited) before the lookup fails.
    pub async fn get_key(&self, header: &JwsHeader) -> Result<DecodingKey> {
        let jwks = self.get_jwks(false).await?;
        match select_key(&jwks, header) {
            Ok(jwk) => decode_key(jwk),
            Err(OidcError::KeyNotFound { .. }) => {
                let jwks = self.get_jwks(true).await?;
                let jwk = select_key(&jwks, header)?;
                decode_key(jwk)
            }
            Err(err) => Err(err),
        }
    }

    /// The cached key set, fetching if stale or `force_refresh` is set.
    pub async fn get_jwks(&self, force_refresh: bool) -> Result<Jwks> {
        if !force_refresh
            && let Some(jwks) = self.cache.get(JWKS_CACHE_KEY)
        {
            return Ok(jwks);
        }

        let _guard = self.fetch_lock.acquire(AcquireOptions::default()).await?;
        if !force_refresh
            && let Some(jwks) = self.cache.get(JWKS_CACHE_KEY)
        {
            return Ok(jwks);
        }

        // Rate-limit forced refreshes; fall back to the cached set if one
        // exists.
        {
            let last = *self.last_attempt.lock();
            if let Some(last) = last
                && last.elapsed() < MIN_REFRESH_INTERVAL
                && let Some(jwks) = self.cache.get(JWKS_CACHE_KEY)
            {
                return Ok(jwks);
            }
        }
        *self.last_attempt.lock() = Some(Instant::now());

        let metadata = self.discovery.discover(false).await?;
        let (jwks, header_ttl) = self.fetch(&metadata.jwks_uri).await?;
        let ttl = header_ttl.unwrap_or(self.ttl);
        self.cache.set(JWKS_CACHE_KEY, jwks.clone(), Some(ttl))?;
        Ok(jwks)
    }

    async fn fetch(&self, jwks_uri: &str) -> Result<(Jwks, Option<Duration>)> {
        tracing::debug!(url = %jwks_uri, "fetching JWKS");
        let response = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| OidcError::Discovery { source: Box::new(e) })?;
        let header_ttl = parse_cache_control_max_age(response.headers());
        let jwks: Jwks = response
            .json()
            .await
            .map_err(|e| OidcError::Discovery { source: Box::new(e) })?;
        Ok((jwks, header_ttl))
    }
}

/// Pick the JWK a header refers to.
///
/// With a `kid`, only an exact match counts. Without one, candidates are
/// narrowed by the key type the algorithm implies and by signing use; the
/// match must be unambiguous.
fn select_key<'a>(jwks: &'a Jwks, header: &JwsHeader) -> Result<&'a Jwk> {
    if let Some(kid) = header.kid.as_deref() {
        return jwks
            .keys
            .iter()
            .find(|k| k.kid.as_deref() == Some(kid))
            .ok_or_else(|| OidcError::KeyNotFound {
                kid: Some(kid.to_string()),
            });
    }

    let wanted_kty = kty_for_alg(&header.alg).ok_or_else(|| OidcError::UnsupportedAlgorithm {
        alg: header.alg.clone(),
    })?;
    let candidates: Vec<&Jwk> = jwks
        .keys
        .iter()
        .filter(|k| k.kty == wanted_kty)
        .filter(|k| is_signing_key(k))
        .collect();
    match candidates.as_slice() {
        [only] => Ok(only),
        [] => Err(OidcError::KeyNotFound { kid: None }),
        _ => Err(OidcError::MultipleMatchingKeys),
    }
}

fn is_signing_key(jwk: &Jwk) -> bool {
    match (&jwk.use_, &jwk.key_ops) {
        (Some(use_), _) => use_ == "sig",
        (None, Some(ops)) => ops.iter().any(|op| op == "verify"),
        (None, None) => true,
    }
}

fn kty_for_alg(alg: &str) -> Option<&'static str> {
    if alg.starts_with("RS") || alg.starts_with("PS") {
        Some("RSA")
    } else if alg.starts_with("ES") {
        Some("EC")
    } else if alg.starts_with("HS") {
        Some("oct")
    } else {
        None
    }
}

/// Convert a JWK into a verification key handle.
fn decode_key(jwk: &Jwk) -> Result<DecodingKey> {
    match jwk.kty.as_str() {
        "RSA" => {
            let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
                return Err(OidcError::InvalidInput {
                    message: "RSA JWK is missing 'n' or 'e'".to_string(),
                });
            };
            DecodingKey::from_rsa_components(n, e)
                .map_err(|e| OidcError::JwtDecode { source: Box::new(e) })
        }
        "EC" => {
            let crv = jwk.crv.as_deref().unwrap_or_default();
            if !matches!(crv, "P-256" | "P-384" | "P-521") {
                return Err(OidcError::UnsupportedCurve {
                    crv: crv.to_string(),
                });
            }
            let (Some(x), Some(y)) = (jwk.x.as_deref(), jwk.y.as_deref()) else {
                return Err(OidcError::InvalidInput {
                    message: "EC JWK is missing 'x' or 'y'".to_string(),
                });
            };
            DecodingKey::from_ec_components(x, y)
                .map_err(|e| OidcError::JwtDecode { source: Box::new(e) })
        }
        "oct" => {
            let Some(k) = jwk.k.as_deref() else {
                return Err(OidcError::InvalidInput {
                    message: "oct JWK is missing 'k'".to_string(),
                });
            };
            let secret = crate::encoding::base64url_decode(k)?;
            Ok(DecodingKey::from_secret(&secret))
        }
        other => Err(OidcError::InvalidInput {
            message: format!("unsupported JWK key type '{other}'"),
        }),
    }
}

fn parse_cache_control_max_age(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers
        .get(reqwest::header::CACHE_CONTROL)?
        .to_str()
        .ok()?;
    for part in value.split(',').map(str::trim) {
        if let Some(rest) = part.strip_prefix("max-age=")
            && let Ok(secs) = rest.parse::<u64>()
        {
            return Some(Duration::from_secs(secs));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn header(alg: &str, kid: Option<&str>) -> JwsHeader {
        JwsHeader {
            alg: alg.to_string(),
            kid: kid.map(str::to_string),
            typ: None,
            crit: None,
            extra: serde_json::Map::new(),
        }
    }

    fn rsa_jwk(kid: &str) -> Jwk {
        // 2048-bit modulus from RFC 7517 appendix A.1.
        serde_json::from_value(json!({
            "kty": "RSA",
            "kid": kid,
            "use": "sig",
            "n": "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
            "e": "AQAB",
        }))
        .expect("jwk")
    }

    fn oct_jwk(kid: Option<&str>) -> Jwk {
        serde_json::from_value(json!({
            "kty": "oct",
            "kid": kid,
            "k": "c2VjcmV0LWJ5dGVz",
        }))
        .expect("jwk")
    }

    #[test]
    fn kid_lookup_finds_the_exact_key() {
        let jwks = Jwks {
            keys: vec![rsa_jwk("a"), rsa_jwk("b")],
        };
        let jwk = select_key(&jwks, &header("RS256", Some("b"))).expect("select");
        assert_eq!(jwk.kid.as_deref(), Some("b"));

        let err = select_key(&jwks, &header("RS256", Some("zz"))).unwrap_err();
        assert_eq!(err.code(), "KEY_NOT_FOUND");
    }

    #[test]
    fn kid_less_lookup_filters_by_kty_and_use() {
        let jwks = Jwks {
            keys: vec![rsa_jwk("a"), oct_jwk(None)],
        };
        let jwk = select_key(&jwks, &header("RS256", None)).expect("select");
        assert_eq!(jwk.kty, "RSA");

        let jwk = select_key(&jwks, &header("HS256", None)).expect("select");
        assert_eq!(jwk.kty, "oct");
    }

    #[test]
    fn ambiguous_kid_less_lookup_fails() {
        let jwks = Jwks {
            keys: vec![rsa_jwk("a"), rsa_jwk("b")],
        };
        let err = select_key(&jwks, &header("RS256", None)).unwrap_err();
        assert_eq!(err.code(), "MULTIPLE_MATCHING_KEYS");
    }

    #[test]
    fn encryption_keys_are_not_signing_candidates() {
        let mut enc = rsa_jwk("enc");
        enc.use_ = Some("enc".to_string());
        let jwks = Jwks {
            keys: vec![enc, rsa_jwk("sig")],
        };
        let jwk = select_key(&jwks, &header("RS256", None)).expect("select");
        assert_eq!(jwk.kid.as_deref(), Some("sig"));
    }

    #[test]
    fn rsa_and_oct_jwks_decode_to_keys() {
        decode_key(&rsa_jwk("a")).expect("rsa key");
        decode_key(&oct_jwk(None)).expect("oct key");
    }

    #[test]
    fn unknown_curve_is_rejected() {
        let jwk: Jwk = serde_json::from_value(json!({
            "kty": "EC",
            "crv": "secp256k1",
            "x": "AA",
            "y": "AA",
        }))
        .expect("jwk");
        let err = decode_key(&jwk).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_CURVE");
    }

    #[test]
    fn cache_control_max_age_is_parsed() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CACHE_CONTROL,
            "public, max-age=120, must-revalidate".parse().expect("value"),
        );
        assert_eq!(
            parse_cache_control_max_age(&headers),
            Some(Duration::from_secs(120))
        );

        headers.insert(reqwest::header::CACHE_CONTROL, "no-store".parse().expect("value"));
        assert_eq!(parse_cache_control_max_age(&headers), None);
    }
}
