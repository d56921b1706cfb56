//! Error types for `unrelated-oidc-client`.
//!
//! Every variant maps to a short machine-readable code via
//! [`OidcError::code`]; component boundaries wrap raw network/parse failures
//! with their own variant and keep the cause as `#[source]`, while typed
//! library errors pass through unwrapped.

use thiserror::Error;
use unrelated_sync::SyncError;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, OidcError>;

#[derive(Error, Debug)]
pub enum OidcError {
    // -- Configuration --------------------------------------------------
    #[error("invalid discovery URL: '{url}'")]
    InvalidDiscoveryUrl { url: String },

    #[error("invalid PKCE configuration: {reason}")]
    InvalidPkceConfig { reason: String },

    #[error("'{method}' client authentication requires a client secret")]
    MissingClientSecret { method: String },

    #[error("private_key_jwt client authentication requires a private key PEM")]
    MissingPrivateKey,

    #[error("private_key_jwt client authentication requires a signing algorithm")]
    MissingSigningAlg,

    #[error("tls_client_auth requires a TLS-bound client certificate")]
    MissingTlsCert,

    #[error("grant type '{grant}' does not support {operation}")]
    InvalidGrantType { grant: String, operation: &'static str },

    #[error("unsupported grant type '{grant}' for a token request")]
    UnsupportedGrantType { grant: String },

    #[error("unsupported PKCE method '{method}'")]
    UnsupportedPkceMethod { method: String },

    #[error("unsupported signing algorithm '{alg}'")]
    UnsupportedAlgorithm { alg: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    // -- Discovery ------------------------------------------------------
    #[error("failed to fetch or parse discovery metadata")]
    Discovery {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("discovery metadata is missing required field '{field}'")]
    InvalidDiscoveryConfig { field: &'static str },

    #[error("identity provider does not advertise '{endpoint}'")]
    EndpointMissing { endpoint: &'static str },

    #[error("identity provider does not advertise a userinfo endpoint")]
    UserinfoMissing,

    // -- State / CSRF ---------------------------------------------------
    #[error("state '{state}' is already pending")]
    StateAlreadyExists { state: String },

    #[error("returned state does not match any pending authorization")]
    StateMismatch,

    #[error("no code verifier was recorded for this authorization")]
    CodeVerifierMissing,

    #[error("redirect is missing the 'state' parameter")]
    StateMissing,

    #[error("redirect is missing the expected token")]
    TokenNotFound,

    // -- Token ----------------------------------------------------------
    #[error("token endpoint request failed{}", fmt_status(.status))]
    TokenRequest {
        status: Option<u16>,
        body: Option<serde_json::Value>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("token refresh failed")]
    TokenRefresh {
        #[source]
        source: Box<OidcError>,
    },

    #[error("authorization code exchange failed")]
    TokenExchange {
        #[source]
        source: Box<OidcError>,
    },

    #[error("device token polling failed with '{error_code}'")]
    TokenPolling {
        error_code: String,
        description: Option<String>,
    },

    #[error("token error: {message}")]
    Token { message: String },

    #[error("device code expired before the user approved the request")]
    DeviceCodeExpired,

    #[error("operation timed out")]
    Timeout,

    #[error("no access token is available")]
    NoAccessToken,

    // -- JWT ------------------------------------------------------------
    #[error("unexpected JWT type '{typ}'")]
    InvalidJwtType { typ: String },

    #[error("compact JWS must have exactly three dot-separated parts")]
    InvalidJwtFormat,

    #[error("failed to decode JWT segment")]
    JwtDecode {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to encode or sign JWT")]
    JwtEncode {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("ID token validation failed: {reason}")]
    IdTokenValidation { reason: String },

    #[error("JWS signature verification failed")]
    SignatureInvalid,

    #[error("multiple JWKS keys match the token header; cannot choose")]
    MultipleMatchingKeys,

    #[error("no JWKS key matches the token header{}", fmt_kid(.kid))]
    KeyNotFound { kid: Option<String> },

    #[error("unsupported elliptic curve '{crv}'")]
    UnsupportedCurve { crv: String },

    // -- URL / encoding -------------------------------------------------
    #[error("failed to build URL: {message}")]
    UrlBuild { message: String },

    #[error("base64url encoding failed: {message}")]
    Encode { message: String },

    #[error("base64url decoding failed")]
    Decode {
        #[source]
        source: base64::DecodeError,
    },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("random string length must be at least 1")]
    InvalidLength,

    #[error("random string length must not exceed 1024")]
    LengthExceeded,

    #[error("invalid parameters: {message}")]
    InvalidParams { message: String },

    // -- Concurrency / cache (from unrelated-sync) ----------------------
    #[error(transparent)]
    Sync(#[from] SyncError),
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" (HTTP {s})"),
        None => String::new(),
    }
}

fn fmt_kid(kid: &Option<String>) -> String {
    match kid {
        Some(kid) => format!(" (kid '{kid}')"),
        None => String::new(),
    }
}

impl OidcError {
    /// Short machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            OidcError::InvalidDiscoveryUrl { .. } => "INVALID_DISCOVERY_URL",
            OidcError::InvalidPkceConfig { .. } => "INVALID_PKCE_CONFIG",
            OidcError::MissingClientSecret { .. } => "MISSING_CLIENT_SECRET",
            OidcError::MissingPrivateKey => "MISSING_PRIVATE_KEY",
            OidcError::MissingSigningAlg => "MISSING_SIGNING_ALG",
            OidcError::MissingTlsCert => "MISSING_TLS_CERT",
            OidcError::InvalidGrantType { .. } => "INVALID_GRANT_TYPE",
            OidcError::UnsupportedGrantType { .. } => "UNSUPPORTED_GRANT_TYPE",
            OidcError::UnsupportedPkceMethod { .. } => "UNSUPPORTED_PKCE_METHOD",
            OidcError::UnsupportedAlgorithm { .. } => "UNSUPPORTED_ALGORITHM",
            OidcError::Config { .. } => "CONFIG_ERROR",
            OidcError::Discovery { .. } => "DISCOVERY_ERROR",
            OidcError::InvalidDiscoveryConfig { .. } => "INVALID_DISCOVERY_CONFIG",
            OidcError::EndpointMissing { .. } => "ENDPOINT_MISSING",
            OidcError::UserinfoMissing => "USERINFO_MISSING",
            OidcError::StateAlreadyExists { .. } => "STATE_ALREADY_EXISTS",
            OidcError::StateMismatch => "STATE_MISMATCH",
            OidcError::CodeVerifierMissing => "CODE_VERIFIER_MISSING",
            OidcError::StateMissing => "STATE_MISSING",
            OidcError::TokenNotFound => "TOKEN_NOT_FOUND",
            OidcError::TokenRequest { .. } => "TOKEN_REQUEST_ERROR",
            OidcError::TokenRefresh { .. } => "TOKEN_REFRESH_ERROR",
            OidcError::TokenExchange { .. } => "TOKEN_EXCHANGE_ERROR",
            OidcError::TokenPolling { .. } => "TOKEN_POLLING_ERROR",
            OidcError::Token { .. } => "TOKEN_ERROR",
            OidcError::DeviceCodeExpired => "DEVICE_CODE_EXPIRED",
            OidcError::Timeout => "TIMEOUT_ERROR",
            OidcError::NoAccessToken => "NO_ACCESS_TOKEN",
            OidcError::InvalidJwtType { .. } => "INVALID_JWT_TYPE",
            OidcError::InvalidJwtFormat => "INVALID_JWT_FORMAT",
            OidcError::JwtDecode { .. } => "JWT_DECODE_ERROR",
            OidcError::JwtEncode { .. } => "JWT_ENCODE_ERROR",
            OidcError::IdTokenValidation { .. } => "ID_TOKEN_VALIDATION_ERROR",
            OidcError::SignatureInvalid => "SIGNATURE_INVALID",
            OidcError::MultipleMatchingKeys => "MULTIPLE_MATCHING_KEYS",
            OidcError::KeyNotFound { .. } => "KEY_NOT_FOUND",
            OidcError::UnsupportedCurve { .. } => "UNSUPPORTED_CURVE",
            OidcError::UrlBuild { .. } => "URL_BUILD_ERROR",
            OidcError::Encode { .. } => "ENCODE_ERROR",
            OidcError::Decode { .. } => "DECODE_ERROR",
            OidcError::InvalidInput { .. } => "INVALID_INPUT",
            OidcError::InvalidLength => "INVALID_LENGTH",
            OidcError::LengthExceeded => "LENGTH_EXCEEDED",
            OidcError::InvalidParams { .. } => "INVALID_PARAMS",
            OidcError::Sync(err) => err.code(),
        }
    }

    /// The error-response body returned by the IdP, when one was captured.
    #[must_use]
    pub fn response_body(&self) -> Option<&serde_json::Value> {
        match self {
            OidcError::TokenRequest { body, .. } => body.as_ref(),
            OidcError::TokenRefresh { source } | OidcError::TokenExchange { source } => {
                source.response_body()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_wrappers() {
        let inner = OidcError::TokenRequest {
            status: Some(400),
            body: Some(serde_json::json!({"error": "invalid_grant"})),
            source: None,
        };
        assert_eq!(inner.code(), "TOKEN_REQUEST_ERROR");

        let wrapped = OidcError::TokenRefresh {
            source: Box::new(inner),
        };
        assert_eq!(wrapped.code(), "TOKEN_REFRESH_ERROR");
        assert_eq!(
            wrapped.response_body().and_then(|b| b["error"].as_str()),
            Some("invalid_grant")
        );
    }

    #[test]
    fn sync_errors_keep_their_codes() {
        let err = OidcError::from(SyncError::InvalidKey);
        assert_eq!(err.code(), "INVALID_KEY");
    }
}
