mod common;

use common::{client_for, pkce_client_for, query_param};
use serde_json::json;
use unrelated_oidc_client::GrantType;
use unrelated_test_support::MockIdp;

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_secs() as i64
}

#[tokio::test]
async fn authorization_code_flow_end_to_end() {
    let idp = MockIdp::spawn().await.expect("idp");
    let client = pkce_client_for(&idp);

    let request = client.auth().authorization_url(&[]).await.expect("auth url");
    assert_eq!(query_param(&request.url, "response_type").as_deref(), Some("code"));
    assert_eq!(query_param(&request.url, "client_id").as_deref(), Some("abc"));
    assert_eq!(
        query_param(&request.url, "scope").as_deref(),
        Some("openid profile")
    );
    assert_eq!(
        query_param(&request.url, "state").as_deref(),
        Some(request.state.as_str())
    );
    assert_eq!(
        query_param(&request.url, "code_challenge_method").as_deref(),
        Some("S256")
    );
    let nonce = query_param(&request.url, "nonce").expect("nonce in url");
    let verifier = request.code_verifier.clone().expect("pkce verifier");

    let now = unix_now();
    let id_token = idp
        .sign_id_token(json!({
            "sub": "user-1",
            "aud": "abc",
            "exp": now + 300,
            "iat": now,
            "nonce": nonce,
        }))
        .expect("sign");
    idp.set_default_token_response(json!({
        "access_token": "at-1",
        "refresh_token": "rt-1",
        "token_type": "Bearer",
        "expires_in": 3600,
        "id_token": id_token,
    }));

    let tokens = client
        .auth()
        .handle_redirect("auth-code-1", &request.state)
        .await
        .expect("redirect");
    assert_eq!(tokens.access_token, "at-1");
    assert!(tokens.expires_at.is_some());
    assert_eq!(
        client.tokens().token_set().expect("stored").access_token,
        "at-1"
    );

    let exchange = &idp.requests("/token")[0];
    assert!(exchange.body.contains("grant_type=authorization_code"));
    assert!(exchange.body.contains("code=auth-code-1"));
    assert!(exchange.body.contains(&format!("code_verifier={verifier}")));
    assert!(exchange.body.contains("redirect_uri=https%3A%2F%2Fapp%2Fcb"));
    assert!(exchange.body.contains("client_id=abc"));

    // The state was consumed; replaying the redirect must fail.
    let err = client
        .auth()
        .handle_redirect("auth-code-1", &request.state)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STATE_MISMATCH");
}

#[tokio::test]
async fn id_token_with_wrong_nonce_is_rejected() {
    let idp = MockIdp::spawn().await.expect("idp");
    let client = pkce_client_for(&idp);

    let request = client.auth().authorization_url(&[]).await.expect("auth url");
    let now = unix_now();
    let id_token = idp
        .sign_id_token(json!({
            "sub": "user-1",
            "aud": "abc",
            "exp": now + 300,
            "iat": now,
            "nonce": "not-the-nonce",
        }))
        .expect("sign");
    idp.set_default_token_response(json!({
        "access_token": "at-1",
        "token_type": "Bearer",
        "expires_in": 3600,
        "id_token": id_token,
    }));

    let err = client
        .auth()
        .handle_redirect("auth-code-1", &request.state)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ID_TOKEN_VALIDATION_ERROR");
    assert!(err.to_string().contains("nonce"));
}

#[tokio::test]
async fn failed_code_exchange_is_wrapped() {
    let idp = MockIdp::spawn().await.expect("idp");
    let client = pkce_client_for(&idp);

    let request = client.auth().authorization_url(&[]).await.expect("auth url");
    idp.push_token_response(400, json!({"error": "invalid_grant"}));

    let err = client
        .auth()
        .handle_redirect("bad-code", &request.state)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TOKEN_EXCHANGE_ERROR");
    assert_eq!(
        err.response_body().and_then(|b| b["error"].as_str()),
        Some("invalid_grant")
    );
}

#[tokio::test]
async fn unknown_state_is_a_mismatch() {
    let idp = MockIdp::spawn().await.expect("idp");
    let client = pkce_client_for(&idp);

    let err = client
        .auth()
        .handle_redirect("code", "never-issued")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STATE_MISMATCH");
}

#[tokio::test]
async fn implicit_flow_parses_the_fragment() {
    let idp = MockIdp::spawn().await.expect("idp");
    let mut config = common::config_for(&idp, GrantType::Implicit);
    config.response_type = "id_token token".to_string();
    let client = unrelated_oidc_client::OidcClient::new(config, reqwest::Client::new())
        .expect("client");

    let request = client.auth().authorization_url(&[]).await.expect("auth url");
    let nonce = query_param(&request.url, "nonce").expect("nonce");
    assert!(request.code_verifier.is_none());

    let now = unix_now();
    let id_token = idp
        .sign_id_token(json!({
            "sub": "user-1",
            "aud": "abc",
            "exp": now + 300,
            "iat": now,
            "nonce": nonce,
        }))
        .expect("sign");
    let fragment = format!(
        "#access_token=implicit-at&token_type=Bearer&expires_in=3600&state={}&id_token={}",
        request.state, id_token
    );

    let tokens = client
        .auth()
        .handle_redirect_implicit(&fragment)
        .await
        .expect("fragment");
    assert_eq!(tokens.access_token, "implicit-at");
    assert_eq!(tokens.id_token.as_deref(), Some(id_token.as_str()));
    assert!(client.tokens().token_set().is_some());
}

#[tokio::test]
async fn implicit_flow_propagates_idp_errors() {
    let idp = MockIdp::spawn().await.expect("idp");
    let client = client_for(&idp, GrantType::Implicit);

    let err = client
        .auth()
        .handle_redirect_implicit("error=access_denied&error_description=user+said+no&state=s")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TOKEN_ERROR");
    assert!(err.to_string().contains("access_denied"));

    let err = client
        .auth()
        .handle_redirect_implicit("state=s")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TOKEN_NOT_FOUND");

    let err = client
        .auth()
        .handle_redirect_implicit("access_token=at")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STATE_MISSING");
}

#[tokio::test]
async fn client_credentials_grant_has_no_authorization_url() {
    let idp = MockIdp::spawn().await.expect("idp");
    let client = common::confidential_client_for(&idp, GrantType::ClientCredentials);

    let err = client.auth().authorization_url(&[]).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_GRANT_TYPE");
}

#[tokio::test]
async fn logout_url_contains_the_configured_fields() {
    let idp = MockIdp::spawn().await.expect("idp");
    let mut config = common::config_for(&idp, GrantType::AuthorizationCode);
    config.post_logout_redirect_uri = Some("https://app/goodbye".to_string());
    let client = unrelated_oidc_client::OidcClient::new(config, reqwest::Client::new())
        .expect("client");

    let url = client
        .auth()
        .logout_url(Some("the-id-token"), Some("logout-state"))
        .await
        .expect("logout url");
    assert!(url.starts_with(&format!("{}/logout?", idp.issuer())));
    assert_eq!(query_param(&url, "client_id").as_deref(), Some("abc"));
    assert_eq!(
        query_param(&url, "post_logout_redirect_uri").as_deref(),
        Some("https://app/goodbye")
    );
    assert_eq!(query_param(&url, "id_token_hint").as_deref(), Some("the-id-token"));
    assert_eq!(query_param(&url, "state").as_deref(), Some("logout-state"));
}

#[tokio::test]
async fn logout_requires_an_end_session_endpoint() {
    let idp = MockIdp::spawn_with(unrelated_test_support::MockIdpOptions {
        end_session: false,
        ..Default::default()
    })
    .await
    .expect("idp");
    let client = client_for(&idp, GrantType::AuthorizationCode);

    let err = client.auth().logout_url(None, None).await.unwrap_err();
    assert_eq!(err.code(), "ENDPOINT_MISSING");
}
