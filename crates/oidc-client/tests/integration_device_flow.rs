mod common;

use common::client_for;
use serde_json::json;
use std::time::Duration;
use unrelated_oidc_client::GrantType;
use unrelated_test_support::{MockIdp, MockIdpOptions};

#[tokio::test]
async fn device_authorization_returns_the_verification_handles() {
    let idp = MockIdp::spawn().await.expect("idp");
    let client = client_for(&idp, GrantType::DeviceCode);

    let authorization = client
        .auth()
        .start_device_authorization()
        .await
        .expect("device authorization");
    assert_eq!(authorization.device_code, "mock-device-code");
    assert_eq!(authorization.user_code, "ABCD-EFGH");
    assert_eq!(authorization.interval, 5);

    let request = &idp.requests("/device")[0];
    assert!(request.body.contains("client_id=abc"));
    assert!(request.body.contains("scope=openid+profile"));
}

#[tokio::test]
async fn device_authorization_requires_the_grant_and_endpoint() {
    let idp = MockIdp::spawn().await.expect("idp");
    let client = client_for(&idp, GrantType::AuthorizationCode);
    let err = client.auth().start_device_authorization().await.unwrap_err();
    assert_eq!(err.code(), "INVALID_GRANT_TYPE");

    let bare = MockIdp::spawn_with(MockIdpOptions {
        device_endpoint: false,
        ..Default::default()
    })
    .await
    .expect("idp");
    let client = client_for(&bare, GrantType::DeviceCode);
    let err = client.auth().start_device_authorization().await.unwrap_err();
    assert_eq!(err.code(), "ENDPOINT_MISSING");
}

#[tokio::test(start_paused = true)]
async fn polling_honors_pending_and_slow_down() {
    let idp = MockIdp::spawn().await.expect("idp");
    let client = client_for(&idp, GrantType::DeviceCode);

    idp.push_token_response(400, json!({"error": "authorization_pending"}));
    idp.push_token_response(400, json!({"error": "slow_down"}));
    idp.set_default_token_response(json!({
        "access_token": "device-at",
        "token_type": "Bearer",
        "expires_in": 3600,
    }));

    let tokens = client
        .auth()
        .poll_device_token("mock-device-code", None, None)
        .await
        .expect("poll");
    assert_eq!(tokens.access_token, "device-at");
    assert_eq!(
        client.tokens().token_set().expect("stored").access_token,
        "device-at"
    );

    let polls = idp.requests("/token");
    assert_eq!(polls.len(), 3);
    for poll in &polls {
        assert!(poll.body.contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Adevice_code"));
        assert!(poll.body.contains("device_code=mock-device-code"));
        assert!(poll.body.contains("client_id=abc"));
    }
    // 5 s after the pending, then 10 s after the slow_down bumped the
    // interval: the third request lands at least 15 virtual seconds in.
    let elapsed = polls[2].at.duration_since(polls[0].at);
    assert!(elapsed >= Duration::from_secs(15), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn expired_device_code_aborts_polling() {
    let idp = MockIdp::spawn().await.expect("idp");
    let client = client_for(&idp, GrantType::DeviceCode);

    idp.push_token_response(400, json!({"error": "expired_token"}));
    let err = client
        .auth()
        .poll_device_token("mock-device-code", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "DEVICE_CODE_EXPIRED");
}

#[tokio::test(start_paused = true)]
async fn unexpected_polling_errors_surface_the_idp_code() {
    let idp = MockIdp::spawn().await.expect("idp");
    let client = client_for(&idp, GrantType::DeviceCode);

    idp.push_token_response(
        400,
        json!({"error": "access_denied", "error_description": "user declined"}),
    );
    let err = client
        .auth()
        .poll_device_token("mock-device-code", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TOKEN_POLLING_ERROR");
    assert!(err.to_string().contains("access_denied"));
}

#[tokio::test(start_paused = true)]
async fn overall_timeout_bounds_the_wait() {
    let idp = MockIdp::spawn().await.expect("idp");
    let client = client_for(&idp, GrantType::DeviceCode);

    for _ in 0..3 {
        idp.push_token_response(400, json!({"error": "authorization_pending"}));
    }

    let err = client
        .auth()
        .poll_device_token(
            "mock-device-code",
            None,
            Some(Duration::from_secs(12)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TIMEOUT_ERROR");
    // Polls at t=0, 5, 10; the t=15 check trips the 12 s deadline first.
    assert_eq!(idp.hits("/token"), 3);
}
