//! Compact JWS codec, ID-token claims validation, and signature
//! verification.
//!
//! Signature math is delegated to `jsonwebtoken`, but with its claim checks
//! disabled: the claims validator here is the single source of truth for
//! issuer/audience/azp/time/nonce semantics, so behavior does not depend on
//! the crate's built-in approximations.

use crate::error::{OidcError, Result};
use crate::jwks::JwksClient;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr as _;
use std::time::{SystemTime, UNIX_EPOCH};

/// Protected JOSE header, decoded raw so fields the verification backend
/// does not model (`crit`, vendor extras) are still visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crit: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct DecodedJwt {
    pub header: JwsHeader,
    pub payload: Value,
    pub signature: Vec<u8>,
}

/// Expected values for ID-token claim validation.
#[derive(Debug, Clone)]
pub struct IdTokenVerification<'a> {
    pub expected_issuer: &'a str,
    pub expected_audience: &'a str,
    pub expected_nonce: Option<&'a str>,
    /// Seconds of tolerance on `exp` and `nbf`.
    pub clock_skew: u64,
    /// Upper bound on how far in the future `iat` may lie.
    pub max_future_iat: u64,
}

/// Split a compact JWS and decode its header and payload.
pub fn decode(token: &str) -> Result<DecodedJwt> {
    let parts: Vec<&str> = token.split('.').collect();
    let [header_b64, payload_b64, signature_b64] = parts.as_slice() else {
        return Err(OidcError::InvalidJwtFormat);
    };

    let header_json = crate::encoding::base64url_decode(header_b64)
        .map_err(|e| OidcError::JwtDecode { source: Box::new(e) })?;
    let header: JwsHeader = serde_json::from_slice(&header_json)
        .map_err(|e| OidcError::JwtDecode { source: Box::new(e) })?;

    let payload_json = crate::encoding::base64url_decode(payload_b64)
        .map_err(|e| OidcError::JwtDecode { source: Box::new(e) })?;
    let payload: Value = serde_json::from_slice(&payload_json)
        .map_err(|e| OidcError::JwtDecode { source: Box::new(e) })?;

    let signature = crate::encoding::base64url_decode(signature_b64)
        .map_err(|e| OidcError::JwtDecode { source: Box::new(e) })?;

    Ok(DecodedJwt {
        header,
        payload,
        signature,
    })
}

/// Key material for producing a signed JWS (client assertions).
pub enum SigningKey<'a> {
    /// `HS*`: raw shared-secret bytes.
    Secret(&'a [u8]),
    /// `RS*` / `PS*`: PKCS#1 or PKCS#8 PEM.
    RsaPem(&'a str),
    /// `ES*`: SEC1 or PKCS#8 PEM.
    EcPem(&'a str),
}

/// Produce a signed compact JWS over `claims`.
pub fn encode(alg: &str, kid: Option<&str>, claims: &Value, key: &SigningKey<'_>) -> Result<String> {
    let algorithm = parse_algorithm(alg)?;
    let encoding_key = match key {
        SigningKey::Secret(secret) => EncodingKey::from_secret(secret),
        SigningKey::RsaPem(pem) => EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| OidcError::JwtEncode { source: Box::new(e) })?,
        SigningKey::EcPem(pem) => EncodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|e| OidcError::JwtEncode { source: Box::new(e) })?,
    };
    let mut header = Header::new(algorithm);
    header.kid = kid.map(str::to_string);
    jsonwebtoken::encode(&header, claims, &encoding_key)
        .map_err(|e| OidcError::JwtEncode { source: Box::new(e) })
}

/// Verify only the signature of `token` against `key`.
///
/// Claim checks are disabled here on purpose; run
/// [`validate_claims`] separately.
pub fn verify_signature(token: &str, key: &DecodingKey, alg: &str) -> Result<()> {
    let algorithm = parse_algorithm(alg)?;
    let mut validation = Validation::new(algorithm);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims::<&str>(&[]);

    match jsonwebtoken::decode::<Value>(token, key, &validation) {
        Ok(_) => Ok(()),
        Err(e) => match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidSignature => Err(OidcError::SignatureInvalid),
            jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => {
                Err(OidcError::UnsupportedAlgorithm {
                    alg: alg.to_string(),
                })
            }
            _ => Err(OidcError::JwtDecode { source: Box::new(e) }),
        },
    }
}

/// Full ID-token verification: decode, claim checks, JWKS key lookup,
/// signature.
pub async fn verify_id_token(
    token: &str,
    jwks: &JwksClient,
    checks: &IdTokenVerification<'_>,
) -> Result<DecodedJwt> {
    let decoded = decode(token)?;

    // `crit` marks JOSE extensions the verifier must understand; this
    // library understands none.
    if decoded
        .header
        .crit
        .as_ref()
        .is_some_and(|crit| !crit.is_empty())
    {
        return Err(OidcError::IdTokenValidation {
            reason: "critical JOSE header extensions are not supported".to_string(),
        });
    }
    if let Some(typ) = decoded.header.typ.as_deref()
        && !typ.eq_ignore_ascii_case("JWT")
        && !typ.eq_ignore_ascii_case("at+jwt")
    {
        return Err(OidcError::InvalidJwtType {
            typ: typ.to_string(),
        });
    }

    validate_claims(&decoded.payload, checks)?;

    let key = jwks.get_key(&decoded.header).await?;
    verify_signature(token, &key, &decoded.header.alg)?;
    Ok(decoded)
}

/// Validate the registered claims against `checks` at the current time.
pub fn validate_claims(payload: &Value, checks: &IdTokenVerification<'_>) -> Result<()> {
    validate_claims_at(payload, checks, unix_now())
}

fn validate_claims_at(payload: &Value, checks: &IdTokenVerification<'_>, now: i64) -> Result<()> {
    let fail = |reason: String| Err(OidcError::IdTokenValidation { reason });

    let Some(obj) = payload.as_object() else {
        return fail("payload is not a JSON object".to_string());
    };

    match obj.get("iss").and_then(Value::as_str) {
        Some(iss) if iss == checks.expected_issuer => {}
        Some(iss) => {
            return fail(format!(
                "issuer mismatch: expected '{}', got '{iss}'",
                checks.expected_issuer
            ));
        }
        None => return fail("iss claim is missing".to_string()),
    }

    let audiences: Vec<&str> = match obj.get("aud") {
        Some(Value::String(aud)) => vec![aud.as_str()],
        Some(Value::Array(auds)) => auds.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    if !audiences.contains(&checks.expected_audience) {
        return fail(format!(
            "audience does not include '{}'",
            checks.expected_audience
        ));
    }
    if audiences.len() > 1
        && let Some(azp) = obj.get("azp")
    {
        match azp.as_str() {
            Some(azp) if azp == checks.expected_audience => {}
            _ => {
                return fail(format!(
                    "azp must equal '{}' when aud has multiple values",
                    checks.expected_audience
                ));
            }
        }
    }

    let skew = checks.clock_skew as i64;
    match obj.get("exp").and_then(Value::as_i64) {
        Some(exp) if exp > now - skew => {}
        Some(exp) => return fail(format!("token expired at {exp} (now {now})")),
        None => return fail("exp claim is missing".to_string()),
    }
    if let Some(iat) = obj.get("iat").and_then(Value::as_i64)
        && iat > now + checks.max_future_iat as i64
    {
        return fail(format!("iat {iat} is too far in the future (now {now})"));
    }
    if let Some(nbf) = obj.get("nbf").and_then(Value::as_i64)
        && nbf > now + skew
    {
        return fail(format!("token not valid before {nbf} (now {now})"));
    }

    if let Some(expected) = checks.expected_nonce {
        match obj.get("nonce").and_then(Value::as_str) {
            Some(nonce) if nonce == expected => {}
            _ => return fail("nonce mismatch".to_string()),
        }
    }

    Ok(())
}

fn parse_algorithm(alg: &str) -> Result<Algorithm> {
    Algorithm::from_str(alg).map_err(|_| OidcError::UnsupportedAlgorithm {
        alg: alg.to_string(),
    })
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
