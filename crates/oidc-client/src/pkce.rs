//! PKCE verifier/challenge generation (RFC 7636).

use crate::config::PkceMethod;
use crate::encoding::{base64url_encode, random_bytes};
use crate::error::{OidcError, Result};
use sha2::{Digest as _, Sha256};

#[derive(Debug, Clone)]
pub struct Pkce {
    pub code_verifier: String,
    pub code_challenge: String,
}

/// Generate a verifier (32 random bytes, base64url) and its challenge.
///
/// `method` is `None` when the config enabled PKCE without choosing a
/// method, which is a configuration error.
pub fn generate_pkce(method: Option<PkceMethod>) -> Result<Pkce> {
    let method = method.ok_or_else(|| OidcError::InvalidPkceConfig {
        reason: "pkce_method is required when PKCE is enabled".to_string(),
    })?;
    let code_verifier = base64url_encode(&random_bytes(32)?);
    let code_challenge = challenge_for(&code_verifier, method);
    Ok(Pkce {
        code_verifier,
        code_challenge,
    })
}

/// The challenge for an existing verifier.
#[must_use]
pub fn challenge_for(verifier: &str, method: PkceMethod) -> String {
    match method {
        PkceMethod::Plain => verifier.to_string(),
        PkceMethod::S256 => base64url_encode(&Sha256::digest(verifier.as_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s256_matches_rfc_7636_appendix_b() {
        let challenge = challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk", PkceMethod::S256);
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn plain_echoes_the_verifier() {
        let pkce = generate_pkce(Some(PkceMethod::Plain)).expect("generate");
        assert_eq!(pkce.code_verifier, pkce.code_challenge);
        // 32 bytes base64url-encode to 43 characters.
        assert_eq!(pkce.code_verifier.len(), 43);
    }

    #[test]
    fn generated_s256_challenge_round_trips() {
        let pkce = generate_pkce(Some(PkceMethod::S256)).expect("generate");
        assert_eq!(
            pkce.code_challenge,
            challenge_for(&pkce.code_verifier, PkceMethod::S256)
        );
        assert_ne!(pkce.code_verifier, pkce.code_challenge);
    }

    #[test]
    fn missing_method_is_a_config_error() {
        let err = generate_pkce(None).unwrap_err();
        assert_eq!(err.code(), "INVALID_PKCE_CONFIG");
    }
}
