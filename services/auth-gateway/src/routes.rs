//! HTTP surface of the gateway
//!
//! Endpoints:
//! - GET  /login     302 to the provider (200 JSON when already signed in)
//! - GET  /callback  completes the login, 302 to `post_login_path`
//! - POST /logout    JSON logout report
//! - GET  /logout    302 to the provider's end-session URL, or `/`
//! - GET  /session   session snapshot (never tokens)
//! - GET  /token     current access token, refreshed when close to expiry
//! - GET  /health
//! - GET  /metrics   Prometheus text exposition

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use auth_session::{AuthSessionManager, LoginOutcome, LogoutReport, Session};
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use provider::LoginParams;
use tracing::{info, warn};

use crate::error::{error_body, status_for};
use crate::metrics;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<AuthSessionManager>,
    pub post_login_path: String,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/login", get(login_handler))
        .route("/callback", get(callback_handler))
        .route("/logout", get(logout_redirect_handler).post(logout_handler))
        .route("/session", get(session_handler))
        .route("/token", get(token_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json_response(
    route: &'static str,
    started: Instant,
    status: StatusCode,
    body: serde_json::Value,
) -> Response {
    metrics::record_request(route, status.as_u16(), started.elapsed().as_secs_f64());
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn redirect_response(route: &'static str, started: Instant, location: String) -> Response {
    metrics::record_request(
        route,
        StatusCode::FOUND.as_u16(),
        started.elapsed().as_secs_f64(),
    );
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn error_response(route: &'static str, started: Instant, err: &auth_session::Error) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        warn!(route, error = %err, "request failed");
    }
    json_response(route, started, status, error_body(err))
}

/// Session snapshot without token material.
fn session_json(session: &Session) -> serde_json::Value {
    serde_json::json!({
        "session_id": session.session_id.as_str(),
        "state": session.state.label(),
        "authenticated": session.is_authenticated(),
        "identity": session.identity,
        "last_error": session.last_error.as_ref().map(error_body),
    })
}

fn report_json(report: &LogoutReport) -> serde_json::Value {
    serde_json::json!({
        "status": "logged_out",
        "warnings": report.warnings.iter().map(error_body).collect::<Vec<_>>(),
        "redirect": report.redirect,
    })
}

/// Login parameters from the query string: `scope` is space separated,
/// `redirect_uri` overrides the configured one, anything else is passed to
/// the provider as an authorization parameter.
fn login_params(query: BTreeMap<String, String>) -> LoginParams {
    let mut params = LoginParams::default();
    for (name, value) in query {
        match name.as_str() {
            "scope" => {
                for scope in value.split_whitespace() {
                    params = params.with_scope(scope);
                }
            }
            "redirect_uri" => params = params.with_redirect_uri(value),
            _ => params = params.with_param(name, value),
        }
    }
    params
}

async fn login_handler(
    State(state): State<AppState>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Response {
    const ROUTE: &str = "/login";
    let started = Instant::now();

    if state.manager.is_authenticated() {
        return json_response(
            ROUTE,
            started,
            StatusCode::OK,
            session_json(&state.manager.session()),
        );
    }

    match state.manager.login(login_params(query)).await {
        Ok(LoginOutcome::Redirect { url }) => redirect_response(ROUTE, started, url),
        Ok(LoginOutcome::Authenticated(session)) => {
            json_response(ROUTE, started, StatusCode::OK, session_json(&session))
        }
        Err(e) => error_response(ROUTE, started, &e),
    }
}

async fn callback_handler(State(state): State<AppState>, uri: Uri) -> Response {
    const ROUTE: &str = "/callback";
    let started = Instant::now();
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());

    match state.manager.handle_callback_location(&uri.to_string()).await {
        Ok(session) => {
            info!(
                request_id,
                subject = session.identity.as_ref().map(|i| i.subject.as_str()),
                "login completed"
            );
            redirect_response(ROUTE, started, state.post_login_path.clone())
        }
        Err(e) => {
            warn!(request_id, error = %e, "callback rejected");
            error_response(ROUTE, started, &e)
        }
    }
}

async fn logout_handler(State(state): State<AppState>) -> Response {
    const ROUTE: &str = "/logout";
    let started = Instant::now();
    match state.manager.logout().await {
        Ok(report) => json_response(ROUTE, started, StatusCode::OK, report_json(&report)),
        Err(e) => error_response(ROUTE, started, &e),
    }
}

async fn logout_redirect_handler(State(state): State<AppState>) -> Response {
    const ROUTE: &str = "/logout";
    let started = Instant::now();
    match state.manager.logout().await {
        Ok(report) => {
            let location = report.redirect.unwrap_or_else(|| "/".to_string());
            redirect_response(ROUTE, started, location)
        }
        Err(e) => error_response(ROUTE, started, &e),
    }
}

async fn session_handler(State(state): State<AppState>) -> Response {
    json_response(
        "/session",
        Instant::now(),
        StatusCode::OK,
        session_json(&state.manager.session()),
    )
}

async fn token_handler(State(state): State<AppState>) -> Response {
    const ROUTE: &str = "/token";
    let started = Instant::now();
    match state.manager.get_access_token().await {
        Ok(access_token) => {
            let expires_at = state.manager.token_expires_at().await;
            json_response(
                ROUTE,
                started,
                StatusCode::OK,
                serde_json::json!({
                    "access_token": access_token,
                    "expires_at": expires_at,
                }),
            )
        }
        Err(e) => error_response(ROUTE, started, &e),
    }
}

/// Health endpoint: always 200 while the process serves requests; the
/// session state is informational.
async fn health_handler(State(state): State<AppState>) -> Response {
    json_response(
        "/health",
        Instant::now(),
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "session_state": state.manager.state().label(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        }),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth_session::{MemoryTokenStore, SessionState, TokenStore};
    use axum::body::Body;
    use axum::http::Request;
    use provider::{Identity, MockProvider, TokenRecord};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        manager: Arc<AuthSessionManager>,
        mock: Arc<MockProvider>,
        store: Arc<MemoryTokenStore>,
    }

    fn now_millis() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    fn test_app(mock: MockProvider) -> TestApp {
        let mock = Arc::new(mock);
        let store = Arc::new(MemoryTokenStore::new());
        let manager = Arc::new(
            AuthSessionManager::builder(mock.clone())
                .session_id("operator")
                .token_store(store.clone())
                .build(),
        );
        let (_recorder, prometheus) = metrics::isolated_recorder();
        let state = AppState {
            manager: manager.clone(),
            post_login_path: "/session".into(),
            prometheus,
            started_at: Instant::now(),
        };
        TestApp {
            router: build_router(state, 1000),
            manager,
            mock,
            store,
        }
    }

    async fn send(router: &Router, method: &str, uri: &str) -> (StatusCode, Response) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        (response.status(), response)
    }

    async fn json_of(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn location_of(response: &Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
    }

    fn tokens(access: &str) -> TokenRecord {
        let now = now_millis();
        TokenRecord::new(access, now, now + 3_600_000).with_refresh_token("R1")
    }

    async fn sign_in(app: &TestApp) {
        app.mock.push_exchange(Ok(tokens("T1")));
        app.mock
            .push_identity(Ok(Identity::new("user-1", now_millis() + 3_600_000)));
        let (status, _) = send(&app.router, "GET", "/callback?code=abc&state=xyz").await;
        assert_eq!(status, StatusCode::FOUND);
    }

    #[tokio::test]
    async fn login_redirects_to_provider() {
        let app = test_app(MockProvider::new());
        let (status, response) = send(
            &app.router,
            "GET",
            "/login?scope=openid%20email&prompt=login",
        )
        .await;

        assert_eq!(status, StatusCode::FOUND);
        assert!(location_of(&response).starts_with("https://mock.idp/authorize"));
        assert_eq!(app.manager.state(), SessionState::Authenticating);

        let params = app.mock.last_login_params().unwrap();
        assert_eq!(params.scopes, vec!["openid", "email"]);
        assert_eq!(params.extra.get("prompt").map(String::as_str), Some("login"));
    }

    #[tokio::test]
    async fn second_login_while_pending_conflicts() {
        let app = test_app(MockProvider::new());
        send(&app.router, "GET", "/login").await;
        let (status, response) = send(&app.router, "GET", "/login").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json_of(response).await["error"]["kind"], "operation_in_progress");
    }

    #[tokio::test]
    async fn callback_signs_in_and_redirects() {
        let app = test_app(MockProvider::new());
        app.mock.push_exchange(Ok(tokens("T1")));
        app.mock
            .push_identity(Ok(Identity::new("user-1", now_millis() + 3_600_000)));

        let (status, response) = send(&app.router, "GET", "/callback?code=abc&state=xyz").await;
        assert_eq!(status, StatusCode::FOUND);
        assert_eq!(location_of(&response), "/session");

        let seen = app.mock.seen_contexts();
        assert_eq!(seen[0].code(), Some("abc"));
        assert_eq!(seen[0].state(), Some("xyz"));

        let (status, response) = send(&app.router, "GET", "/session").await;
        assert_eq!(status, StatusCode::OK);
        let json = json_of(response).await;
        assert_eq!(json["state"], "authenticated");
        assert_eq!(json["identity"]["subject"], "user-1");
        assert!(json.get("access_token").is_none());
        assert!(!json.to_string().contains("T1"), "session JSON must not leak tokens");
    }

    #[tokio::test]
    async fn replayed_callback_conflicts() {
        let app = test_app(MockProvider::new());
        sign_in(&app).await;

        let (status, response) = send(&app.router, "GET", "/callback?code=abc&state=xyz").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json_of(response).await["error"]["kind"], "duplicate_callback");
        assert_eq!(app.mock.calls().complete_callback, 1);
    }

    #[tokio::test]
    async fn callback_without_params_is_bad_request() {
        let app = test_app(MockProvider::new());
        let (status, response) = send(&app.router, "GET", "/callback").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_of(response).await["error"]["kind"], "callback_invalid");
    }

    #[tokio::test]
    async fn login_when_signed_in_returns_session() {
        let app = test_app(MockProvider::new());
        sign_in(&app).await;

        let (status, response) = send(&app.router, "GET", "/login").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(response).await["authenticated"], true);
        assert_eq!(app.mock.calls().initiate_login, 0);
    }

    #[tokio::test]
    async fn token_returns_access_token_and_expiry() {
        let app = test_app(MockProvider::new());
        let (status, _) = send(&app.router, "GET", "/token").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        sign_in(&app).await;
        let (status, response) = send(&app.router, "GET", "/token").await;
        assert_eq!(status, StatusCode::OK);
        let json = json_of(response).await;
        assert_eq!(json["access_token"], "T1");
        assert!(json["expires_at"].as_u64().unwrap() > now_millis());
    }

    #[tokio::test]
    async fn post_logout_reports_and_clears_tokens() {
        let app = test_app(MockProvider::new());
        sign_in(&app).await;

        let (status, response) = send(&app.router, "POST", "/logout").await;
        assert_eq!(status, StatusCode::OK);
        let json = json_of(response).await;
        assert_eq!(json["status"], "logged_out");
        assert_eq!(json["warnings"].as_array().unwrap().len(), 0);
        assert!(json["redirect"].is_null());

        assert_eq!(app.manager.state(), SessionState::Unauthenticated);
        assert!(app.store.get(app.manager.session_id()).await.is_none());
    }

    #[tokio::test]
    async fn get_logout_follows_provider_redirect() {
        let app = test_app(
            MockProvider::new().with_logout_redirect("https://mock.idp/v2/logout?client_id=c"),
        );
        sign_in(&app).await;

        let (status, response) = send(&app.router, "GET", "/logout").await;
        assert_eq!(status, StatusCode::FOUND);
        assert_eq!(
            location_of(&response),
            "https://mock.idp/v2/logout?client_id=c"
        );

        let app = test_app(MockProvider::new());
        let (status, response) = send(&app.router, "GET", "/logout").await;
        assert_eq!(status, StatusCode::FOUND);
        assert_eq!(location_of(&response), "/");
    }

    #[tokio::test]
    async fn disposed_manager_is_unavailable() {
        let app = test_app(MockProvider::new());
        sign_in(&app).await;
        app.manager.dispose();

        let (status, response) = send(&app.router, "GET", "/token").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_of(response).await["error"]["kind"], "cancelled");
    }

    #[tokio::test]
    async fn health_reports_session_state() {
        let app = test_app(MockProvider::new());
        let (status, response) = send(&app.router, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json = json_of(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["session_state"], "unauthenticated");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_format() {
        let app = test_app(MockProvider::new());
        let (status, response) = send(&app.router, "GET", "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    #[test]
    fn login_params_split_scope_and_pass_extras() {
        let query = BTreeMap::from([
            ("scope".to_string(), "openid  profile".to_string()),
            ("redirect_uri".to_string(), "http://app/cb".to_string()),
            ("connection".to_string(), "github".to_string()),
        ]);
        let params = login_params(query);
        assert_eq!(params.scopes, vec!["openid", "profile"]);
        assert_eq!(params.redirect_uri.as_deref(), Some("http://app/cb"));
        assert_eq!(
            params.extra.get("connection").map(String::as_str),
            Some("github")
        );
    }
}
