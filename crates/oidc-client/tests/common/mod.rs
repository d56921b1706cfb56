use unrelated_oidc_client::{
    ClientConfig, GrantType, OidcClient, PkceMethod, TokenEndpointAuthMethod,
};
use unrelated_test_support::MockIdp;

/// Public-client config pointed at the mock IdP.
pub fn config_for(idp: &MockIdp, grant: GrantType) -> ClientConfig {
    let mut config = ClientConfig::new("abc", "https://app/cb", &idp.discovery_url(), grant);
    config.scopes = vec!["openid".to_string(), "profile".to_string()];
    config
}

pub fn client_for(idp: &MockIdp, grant: GrantType) -> OidcClient {
    OidcClient::new(config_for(idp, grant), reqwest::Client::new()).expect("client")
}

/// Code-flow client with PKCE S256 enabled.
pub fn pkce_client_for(idp: &MockIdp) -> OidcClient {
    let mut config = config_for(idp, GrantType::AuthorizationCode);
    config.pkce = true;
    config.pkce_method = Some(PkceMethod::S256);
    OidcClient::new(config, reqwest::Client::new()).expect("client")
}

/// Confidential client using `client_secret_post`.
pub fn confidential_client_for(idp: &MockIdp, grant: GrantType) -> OidcClient {
    let mut config = config_for(idp, grant);
    config.client_secret = Some("s3cret".to_string());
    config.token_endpoint_auth_method = TokenEndpointAuthMethod::ClientSecretPost;
    OidcClient::new(config, reqwest::Client::new()).expect("client")
}

/// The value of `name` in the URL's query string, percent-decoded.
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let parsed = url::Url::parse(url).expect("parse url");
    parsed
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}
