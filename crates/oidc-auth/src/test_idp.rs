//! In-process identity provider for HTTP tests.
//!
//! Serves the token, userinfo and revocation endpoints on 127.0.0.1:0 and
//! records every form it receives.
//!
//! Token endpoint behavior:
//! - `authorization_code` with `code=good-code` → `at-1`/`rt-1`/`id-1`, anything else → 400
//! - `refresh_token` with `rt-1` → `at-2` (no rotation), `revoked` → 400, `server-error` → 500
//!
//! Userinfo accepts `at-1`/`at-2` (`sub = idp|123`) and `no-sub` (claims
//! without `sub`); anything else is 401.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::json;

use crate::config::OidcConfig;

type Recorded = Arc<Mutex<Vec<(String, HashMap<String, String>)>>>;

pub(crate) struct TestIdp {
    base: String,
    recorded: Recorded,
}

impl TestIdp {
    pub(crate) async fn spawn() -> Self {
        let recorded: Recorded = Arc::default();
        let app = Router::new()
            .route("/oauth/token", post(token))
            .route("/oauth/revoke", post(revoke))
            .route("/userinfo", get(userinfo))
            .with_state(recorded.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            recorded,
        }
    }

    pub(crate) fn config(&self) -> OidcConfig {
        OidcConfig::from_domain(&self.base, "client-1", "http://127.0.0.1:8400/callback")
    }

    /// Last form posted to `path`.
    pub(crate) fn last_form(&self, path: &str) -> Option<HashMap<String, String>> {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| p == path)
            .map(|(_, form)| form.clone())
    }

    pub(crate) fn count(&self, path: &str) -> usize {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .count()
    }
}

async fn token(
    State(recorded): State<Recorded>,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    recorded
        .lock()
        .unwrap()
        .push(("/oauth/token".into(), form.clone()));

    let grant = form.get("grant_type").map(String::as_str);
    match grant {
        Some("authorization_code") if form.get("code").map(String::as_str) == Some("good-code") => (
            StatusCode::OK,
            Json(json!({
                "access_token": "at-1",
                "refresh_token": "rt-1",
                "id_token": "id-1",
                "expires_in": 3600,
                "token_type": "Bearer"
            })),
        ),
        Some("refresh_token") => match form.get("refresh_token").map(String::as_str) {
            Some("rt-1") => (
                StatusCode::OK,
                Json(json!({ "access_token": "at-2", "expires_in": 3600 })),
            ),
            Some("server-error") => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "server_error" })),
            ),
            _ => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid_grant" })),
            ),
        },
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant" })),
        ),
    }
}

async fn revoke(
    State(recorded): State<Recorded>,
    Form(form): Form<HashMap<String, String>>,
) -> StatusCode {
    recorded.lock().unwrap().push(("/oauth/revoke".into(), form));
    StatusCode::OK
}

async fn userinfo(headers: HeaderMap) -> impl IntoResponse {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match token {
        Some("at-1" | "at-2") => (
            StatusCode::OK,
            Json(json!({ "sub": "idp|123", "email": "operator@example.com" })),
        ),
        Some("no-sub") => (
            StatusCode::OK,
            Json(json!({ "email": "operator@example.com" })),
        ),
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid_token" })),
        ),
    }
}
