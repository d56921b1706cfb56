//! In-process mock identity provider for integration tests.
//!
//! [`MockIdp`] serves discovery, JWKS, token, device-authorization,
//! introspection, revocation, and userinfo endpoints on an ephemeral local
//! port. Token responses can be scripted per-request; every request is
//! journaled with its (tokio) timestamp so tests can assert call counts,
//! bodies, and pacing.

use anyhow::Context as _;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::Mutex;
use rsa::pkcs8::{EncodePrivateKey as _, LineEnding};
use rsa::traits::PublicKeyParts as _;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const TEST_KID: &str = "test-key-1";

/// RSA signing key pair in the shapes the tests need: a PEM for signing and
/// a JWK for the mock JWKS document.
#[derive(Clone)]
pub struct TestRsaKey {
    pub kid: String,
    pub private_pem: String,
    pub jwk: Value,
}

impl TestRsaKey {
    /// Generate a fresh 2048-bit key. Slow-ish; reuse within a test.
    pub fn generate(kid: &str) -> anyhow::Result<Self> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).context("generate RSA key")?;
        let public = RsaPublicKey::from(&private);
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .context("encode PKCS#8 PEM")?
            .to_string();
        let jwk = json!({
            "kty": "RSA",
            "kid": kid,
            "use": "sig",
            "alg": "RS256",
            "n": URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
        });
        Ok(Self {
            kid: kid.to_string(),
            private_pem,
            jwk,
        })
    }

    /// Sign `claims` as an RS256 JWT carrying this key's `kid`.
    pub fn sign(&self, claims: &Value) -> anyhow::Result<String> {
        let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(self.private_pem.as_bytes())
            .context("load signing key")?;
        jsonwebtoken::encode(&header, claims, &key).context("sign JWT")
    }
}

/// One observed HTTP request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub body: String,
    pub authorization: Option<String>,
    pub at: tokio::time::Instant,
}

/// A scripted response for the token endpoint.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub status: u16,
    pub body: Value,
}

struct IdpState {
    issuer: String,
    key: Mutex<TestRsaKey>,
    journal: Mutex<Vec<RecordedRequest>>,
    token_script: Mutex<VecDeque<ScriptedResponse>>,
    default_token_response: Mutex<Value>,
    userinfo_response: Mutex<Value>,
    advertise_device_endpoint: bool,
    advertise_introspection: bool,
    advertise_revocation: bool,
    advertise_end_session: bool,
    advertise_userinfo: bool,
}

/// Which optional endpoints the discovery document advertises.
#[derive(Debug, Clone)]
pub struct MockIdpOptions {
    pub device_endpoint: bool,
    pub introspection: bool,
    pub revocation: bool,
    pub end_session: bool,
    pub userinfo: bool,
}

impl Default for MockIdpOptions {
    fn default() -> Self {
        Self {
            device_endpoint: true,
            introspection: true,
            revocation: true,
            end_session: true,
            userinfo: true,
        }
    }
}

pub struct MockIdp {
    state: Arc<IdpState>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl MockIdp {
    pub async fn spawn() -> anyhow::Result<Self> {
        Self::spawn_with(MockIdpOptions::default()).await
    }

    pub async fn spawn_with(options: MockIdpOptions) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind ephemeral port")?;
        let addr = listener.local_addr().context("local_addr")?;
        let issuer = format!("http://{addr}");

        let key = TestRsaKey::generate(TEST_KID)?;
        let state = Arc::new(IdpState {
            issuer: issuer.clone(),
            key: Mutex::new(key),
            journal: Mutex::new(Vec::new()),
            token_script: Mutex::new(VecDeque::new()),
            default_token_response: Mutex::new(json!({
                "access_token": "mock-access-token",
                "token_type": "Bearer",
                "expires_in": 3600,
            })),
            userinfo_response: Mutex::new(json!({
                "sub": "user-1",
                "name": "Test User",
            })),
            advertise_device_endpoint: options.device_endpoint,
            advertise_introspection: options.introspection,
            advertise_revocation: options.revocation,
            advertise_end_session: options.end_session,
            advertise_userinfo: options.userinfo,
        });

        let app = Router::new()
            .route("/.well-known/openid-configuration", get(discovery_handler))
            .route("/jwks", get(jwks_handler))
            .route("/token", post(token_handler))
            .route("/device", post(device_handler))
            .route("/introspect", post(introspect_handler))
            .route("/revoke", post(revoke_handler))
            .route("/userinfo", get(userinfo_handler))
            .with_state(Arc::clone(&state));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let server = tokio::spawn(async move {
            let _ = server.await;
        });

        Ok(Self {
            state,
            shutdown: Some(shutdown_tx),
            server: Some(server),
        })
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.state.issuer
    }

    #[must_use]
    pub fn discovery_url(&self) -> String {
        format!("{}/.well-known/openid-configuration", self.state.issuer)
    }

    #[must_use]
    pub fn key(&self) -> TestRsaKey {
        self.state.key.lock().clone()
    }

    /// Swap the signing key (and the published JWKS) to simulate rotation.
    pub fn rotate_key(&self, key: TestRsaKey) {
        *self.state.key.lock() = key;
    }

    /// Sign an ID token with the current key, filling in the issuer.
    pub fn sign_id_token(&self, mut claims: Value) -> anyhow::Result<String> {
        if claims.get("iss").is_none() {
            claims["iss"] = json!(self.state.issuer);
        }
        self.state.key.lock().sign(&claims)
    }

    /// Queue a one-shot token-endpoint response; once the queue drains, the
    /// default response is served.
    pub fn push_token_response(&self, status: u16, body: Value) {
        self.state
            .token_script
            .lock()
            .push_back(ScriptedResponse { status, body });
    }

    pub fn set_default_token_response(&self, body: Value) {
        *self.state.default_token_response.lock() = body;
    }

    pub fn set_userinfo_response(&self, body: Value) {
        *self.state.userinfo_response.lock() = body;
    }

    /// Requests observed for `path`, in order.
    #[must_use]
    pub fn requests(&self, path: &str) -> Vec<RecordedRequest> {
        self.state
            .journal
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn hits(&self, path: &str) -> usize {
        self.requests(path).len()
    }
}

impl Drop for MockIdp {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

fn record(state: &IdpState, path: &str, headers: &HeaderMap, body: String) {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.journal.lock().push(RecordedRequest {
        path: path.to_string(),
        body,
        authorization,
        at: tokio::time::Instant::now(),
    });
}

async fn discovery_handler(State(state): State<Arc<IdpState>>, headers: HeaderMap) -> Response {
    record(&state, "/.well-known/openid-configuration", &headers, String::new());
    let issuer = &state.issuer;
    let mut doc = json!({
        "issuer": issuer,
        "jwks_uri": format!("{issuer}/jwks"),
        "authorization_endpoint": format!("{issuer}/authorize"),
        "token_endpoint": format!("{issuer}/token"),
    });
    if state.advertise_device_endpoint {
        doc["device_authorization_endpoint"] = json!(format!("{issuer}/device"));
    }
    if state.advertise_introspection {
        doc["introspection_endpoint"] = json!(format!("{issuer}/introspect"));
    }
    if state.advertise_revocation {
        doc["revocation_endpoint"] = json!(format!("{issuer}/revoke"));
    }
    if state.advertise_end_session {
        doc["end_session_endpoint"] = json!(format!("{issuer}/logout"));
    }
    if state.advertise_userinfo {
        doc["userinfo_endpoint"] = json!(format!("{issuer}/userinfo"));
    }
    axum::Json(doc).into_response()
}

async fn jwks_handler(State(state): State<Arc<IdpState>>, headers: HeaderMap) -> Response {
    record(&state, "/jwks", &headers, String::new());
    let jwk = state.key.lock().jwk.clone();
    axum::Json(json!({ "keys": [jwk] })).into_response()
}

async fn token_handler(
    State(state): State<Arc<IdpState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    record(&state, "/token", &headers, body);
    let scripted = state.token_script.lock().pop_front();
    match scripted {
        Some(scripted) => {
            let status =
                StatusCode::from_u16(scripted.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, axum::Json(scripted.body)).into_response()
        }
        None => axum::Json(state.default_token_response.lock().clone()).into_response(),
    }
}

async fn device_handler(
    State(state): State<Arc<IdpState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    record(&state, "/device", &headers, body);
    axum::Json(json!({
        "device_code": "mock-device-code",
        "user_code": "ABCD-EFGH",
        "verification_uri": format!("{}/activate", state.issuer),
        "expires_in": 1800,
        "interval": 5,
    }))
    .into_response()
}

async fn introspect_handler(
    State(state): State<Arc<IdpState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    record(&state, "/introspect", &headers, body);
    axum::Json(json!({
        "active": true,
        "token_type": "Bearer",
        "sub": "user-1",
    }))
    .into_response()
}

async fn revoke_handler(
    State(state): State<Arc<IdpState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    record(&state, "/revoke", &headers, body);
    StatusCode::OK.into_response()
}

async fn userinfo_handler(State(state): State<Arc<IdpState>>, headers: HeaderMap) -> Response {
    record(&state, "/userinfo", &headers, String::new());
    let authorized = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer "));
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    }
    axum::Json(state.userinfo_response.lock().clone()).into_response()
}
