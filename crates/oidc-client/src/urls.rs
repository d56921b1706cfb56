//! Authorization/logout URL construction and form-body encoding.
//!
//! Query and body values use application/x-www-form-urlencoded encoding
//! (spaces become `+`), and parameters are appended in the order the
//! protocol surfaces document them, so produced URLs are stable and
//! comparable.

use crate::error::{OidcError, Result};
use url::Url;
use url::form_urlencoded::Serializer;

/// Inputs for [`build_authorization_url`]; optional fields are omitted from
/// the query when absent.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationUrlParams<'a> {
    pub authorization_endpoint: &'a str,
    pub response_type: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a [String],
    pub state: &'a str,
    pub code_challenge: Option<&'a str>,
    pub code_challenge_method: Option<&'a str>,
    pub prompt: Option<&'a str>,
    pub display: Option<&'a str>,
    pub response_mode: Option<&'a str>,
    pub nonce: Option<&'a str>,
    pub acr_values: Option<&'a [String]>,
}

/// Build the authorization-request URL.
///
/// Field order: `response_type`, `client_id`, `redirect_uri`, `scope`,
/// `state`, `code_challenge[_method]`, `prompt`, `display`, `response_mode`,
/// `nonce`, `acr_values`, then `extra`. A bare `code_challenge` defaults its
/// method to `S256`.
pub fn build_authorization_url(
    params: &AuthorizationUrlParams<'_>,
    extra: &[(String, String)],
) -> Result<String> {
    let mut url = parse_endpoint(params.authorization_endpoint)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", params.response_type);
        query.append_pair("client_id", params.client_id);
        query.append_pair("redirect_uri", params.redirect_uri);
        query.append_pair("scope", &params.scopes.join(" "));
        query.append_pair("state", params.state);
        if let Some(challenge) = params.code_challenge {
            query.append_pair("code_challenge", challenge);
            query.append_pair(
                "code_challenge_method",
                params.code_challenge_method.unwrap_or("S256"),
            );
        }
        if let Some(prompt) = params.prompt {
            query.append_pair("prompt", prompt);
        }
        if let Some(display) = params.display {
            query.append_pair("display", display);
        }
        if let Some(mode) = params.response_mode {
            query.append_pair("response_mode", mode);
        }
        if let Some(nonce) = params.nonce {
            query.append_pair("nonce", nonce);
        }
        if let Some(acr) = params.acr_values
            && !acr.is_empty()
        {
            query.append_pair("acr_values", &acr.join(" "));
        }
        for (key, value) in extra {
            query.append_pair(key, value);
        }
    }
    Ok(url.into())
}

/// Inputs for [`build_logout_url`].
#[derive(Debug, Clone, Default)]
pub struct LogoutUrlParams<'a> {
    pub end_session_endpoint: &'a str,
    pub client_id: &'a str,
    pub post_logout_redirect_uri: Option<&'a str>,
    pub id_token_hint: Option<&'a str>,
    pub state: Option<&'a str>,
    pub logout_hint: Option<&'a str>,
    pub ui_locales: Option<&'a str>,
}

/// Build the RP-initiated logout URL; empty optional parameters are omitted.
pub fn build_logout_url(params: &LogoutUrlParams<'_>) -> Result<String> {
    let mut url = parse_endpoint(params.end_session_endpoint)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("client_id", params.client_id);
        for (key, value) in [
            ("post_logout_redirect_uri", params.post_logout_redirect_uri),
            ("id_token_hint", params.id_token_hint),
            ("state", params.state),
            ("logout_hint", params.logout_hint),
            ("ui_locales", params.ui_locales),
        ] {
            if let Some(value) = value
                && !value.is_empty()
            {
                query.append_pair(key, value);
            }
        }
    }
    Ok(url.into())
}

/// Percent-encode a form body, preserving parameter order.
pub fn build_url_encoded_body(params: &[(String, String)]) -> Result<String> {
    let mut serializer = Serializer::new(String::new());
    for (key, value) in params {
        if key.is_empty() {
            return Err(OidcError::InvalidParams {
                message: "form parameter keys must not be empty".to_string(),
            });
        }
        serializer.append_pair(key, value);
    }
    Ok(serializer.finish())
}

fn parse_endpoint(endpoint: &str) -> Result<Url> {
    Url::parse(endpoint).map_err(|e| OidcError::UrlBuild {
        message: format!("invalid endpoint '{endpoint}': {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_url_field_order_and_encoding() {
        let scopes = vec!["openid".to_string(), "profile".to_string()];
        let url = build_authorization_url(
            &AuthorizationUrlParams {
                authorization_endpoint: "https://idp/authorize",
                response_type: "code",
                client_id: "abc",
                redirect_uri: "https://app/cb",
                scopes: &scopes,
                state: "xyz",
                code_challenge: Some("CC"),
                ..AuthorizationUrlParams::default()
            },
            &[],
        )
        .expect("build");

        let (base, query) = url.split_once('?').expect("query");
        assert_eq!(base, "https://idp/authorize");
        assert_eq!(
            query,
            "response_type=code&client_id=abc&redirect_uri=https%3A%2F%2Fapp%2Fcb\
             &scope=openid+profile&state=xyz&code_challenge=CC&code_challenge_method=S256"
        );
    }

    #[test]
    fn optional_fields_appear_iff_provided() {
        let scopes = vec!["openid".to_string()];
        let acr = vec!["urn:mace:incommon:iap:silver".to_string(), "loa2".to_string()];
        let url = build_authorization_url(
            &AuthorizationUrlParams {
                authorization_endpoint: "https://idp/authorize",
                response_type: "id_token token",
                client_id: "abc",
                redirect_uri: "https://app/cb",
                scopes: &scopes,
                state: "s",
                prompt: Some("login"),
                response_mode: Some("fragment"),
                nonce: Some("n-1"),
                acr_values: Some(&acr),
                ..AuthorizationUrlParams::default()
            },
            &[("audience".to_string(), "https://api".to_string())],
        )
        .expect("build");

        assert!(url.contains("response_type=id_token+token"));
        assert!(url.contains("prompt=login"));
        assert!(url.contains("response_mode=fragment"));
        assert!(url.contains("nonce=n-1"));
        assert!(url.contains("acr_values=urn%3Amace%3Aincommon%3Aiap%3Asilver+loa2"));
        assert!(url.ends_with("audience=https%3A%2F%2Fapi"));
        assert!(!url.contains("display="));
        assert!(!url.contains("code_challenge"));
    }

    #[test]
    fn explicit_challenge_method_is_preserved() {
        let scopes = vec!["openid".to_string()];
        let url = build_authorization_url(
            &AuthorizationUrlParams {
                authorization_endpoint: "https://idp/authorize",
                response_type: "code",
                client_id: "abc",
                redirect_uri: "https://app/cb",
                scopes: &scopes,
                state: "s",
                code_challenge: Some("CC"),
                code_challenge_method: Some("plain"),
                ..AuthorizationUrlParams::default()
            },
            &[],
        )
        .expect("build");
        assert!(url.contains("code_challenge_method=plain"));
    }

    #[test]
    fn logout_url_omits_empty_optionals() {
        let url = build_logout_url(&LogoutUrlParams {
            end_session_endpoint: "https://idp/logout",
            client_id: "abc",
            post_logout_redirect_uri: Some("https://app/"),
            id_token_hint: None,
            state: Some(""),
            logout_hint: None,
            ui_locales: Some("fr-CA fr en"),
        })
        .expect("build");

        assert_eq!(
            url,
            "https://idp/logout?client_id=abc\
             &post_logout_redirect_uri=https%3A%2F%2Fapp%2F&ui_locales=fr-CA+fr+en"
        );
    }

    #[test]
    fn form_body_encoding() {
        let body = build_url_encoded_body(&[
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("redirect_uri".to_string(), "https://app/cb?a=b".to_string()),
            ("scope".to_string(), "openid profile".to_string()),
        ])
        .expect("encode");
        assert_eq!(
            body,
            "grant_type=authorization_code&redirect_uri=https%3A%2F%2Fapp%2Fcb%3Fa%3Db&scope=openid+profile"
        );

        let err = build_url_encoded_body(&[(String::new(), "v".to_string())]).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
    }

    #[test]
    fn invalid_endpoint_is_a_url_build_error() {
        let err = build_logout_url(&LogoutUrlParams {
            end_session_endpoint: "::::",
            client_id: "abc",
            ..LogoutUrlParams::default()
        })
        .unwrap_err();
        assert_eq!(err.code(), "URL_BUILD_ERROR");
    }
}
