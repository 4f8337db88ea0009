//! HTTP surface over the session manager
//!
//! Thin adapter: every route forwards to one `SessionManager` operation.
//!
//! Endpoints:
//! - GET  /health          process health with the session phase
//! - GET  /metrics         Prometheus exposition
//! - GET  /session/state   observable session state (no bearer)
//! - GET  /session/status  diagnostic snapshot plus the pending login URL
//! - GET  /session/token   bearer token, escalating to login if needed
//! - POST /session/login   start an interactive login, returns the URL to open
//! - POST /session/logout  sign out
//! - POST /session/refresh discard the cached token and fetch a new one
//! - POST /session/clear   wipe all authentication state
//! - GET  /callback        redirect target registered with the authority

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use axum::Router;
use axum::extract::{MatchedPath, RawQuery, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use identity::OAuthProvider;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use session::{AuthResult, Phase, SessionManager};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::user_agent::CallbackBroker;

const SIGNED_IN_PAGE: &str =
    "<!doctype html><title>Signed in</title><p>Sign-in complete. You can close this window.</p>";

type LoginTask = JoinHandle<session::Result<AuthResult>>;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub provider: Arc<OAuthProvider>,
    pub broker: Arc<CallbackBroker>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
    pending_login: Arc<Mutex<Option<LoginTask>>>,
}

impl AppState {
    pub fn new(
        manager: Arc<SessionManager>,
        provider: Arc<OAuthProvider>,
        broker: Arc<CallbackBroker>,
        prometheus: PrometheusHandle,
    ) -> Self {
        Self {
            manager,
            provider,
            broker,
            prometheus,
            started_at: Instant::now(),
            pending_login: Arc::new(Mutex::new(None)),
        }
    }

    fn pending_login(&self) -> MutexGuard<'_, Option<LoginTask>> {
        self.pending_login
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the login still waiting in the background, releasing its
    /// interaction lock. A redirect login never finishes on its own.
    fn abort_pending_login(&self) {
        let task = self.pending_login().take();
        if let Some(task) = task
            && !task.is_finished()
        {
            debug!("aborting pending login task");
            task.abort();
        }
    }
}

/// Build the axum router with all routes and shared state.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/session/state", get(session_state))
        .route("/session/status", get(session_status))
        .route("/session/token", get(token))
        .route("/session/login", post(login))
        .route("/session/logout", post(logout))
        .route("/session/refresh", post(refresh))
        .route("/session/clear", post(clear))
        .route("/callback", get(callback))
        .route_layer(middleware::from_fn(track_requests))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned());
    let response = next.run(request).await;
    if let Some(route) = route {
        crate::metrics::record_request(&route, response.status().as_u16());
    }
    response
}

/// 200 once the session has settled, 503 while it is uninitialized or failed.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let phase = state.manager.phase();
    let settled = !matches!(
        phase,
        Phase::Uninitialized | Phase::Initializing | Phase::Error
    );
    let (status_code, status) = if settled {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        status_code,
        Json(json!({
            "status": status,
            "phase": phase.label(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        })),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn session_state(State(state): State<AppState>) -> Json<Value> {
    Json(state.manager.state().to_json())
}

async fn session_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshot = state.manager.status().await;
    let mut body =
        serde_json::to_value(&snapshot).map_err(|e| ApiError::Internal(e.to_string()))?;
    if let Some(fields) = body.as_object_mut() {
        fields.insert("login_url".into(), json!(state.broker.current_url()));
    }
    Ok(Json(body))
}

fn token_body(token: &common::Secret<String>) -> Json<Value> {
    Json(json!({
        "access_token": token.expose(),
        "token_type": "Bearer",
    }))
}

async fn token(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let token = state.manager.get_access_token().await?;
    Ok(token_body(&token))
}

async fn refresh(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let token = state.manager.force_refresh_token().await?;
    Ok(token_body(&token))
}

/// Start an interactive login in the background and answer with the URL the
/// user has to open. If the login settles before a URL appears (rejected,
/// not initialized) that outcome is returned instead.
async fn login(State(state): State<AppState>) -> Result<Response, ApiError> {
    let mut urls = state.broker.subscribe_urls();
    urls.borrow_and_update();

    let manager = state.manager.clone();
    let mut task = tokio::spawn(async move { manager.login_interactive().await });

    let settled = tokio::select! {
        joined = &mut task => Some(joined),
        _ = urls.changed() => None,
    };

    match settled {
        Some(joined) => {
            let result = joined.map_err(|e| ApiError::Internal(e.to_string()))??;
            Ok(Json(json!({
                "status": "authenticated",
                "account_id": result.account.id,
            }))
            .into_response())
        }
        None => {
            let url = urls.borrow().clone();
            *state.pending_login() = Some(task);
            info!("interactive login started");
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "login_started",
                    "url": url,
                })),
            )
                .into_response())
        }
    }
}

async fn logout(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.abort_pending_login();
    state.manager.logout().await?;
    Ok(Json(json!({ "status": "signed_out" })))
}

async fn clear(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.abort_pending_login();
    state.manager.clear_authentication_state().await?;
    Ok(Json(json!({ "status": "cleared" })))
}

/// Authority redirect target. A callback whose `state` matches a waiting
/// login window completes it; anything else is a redirect login coming back.
async fn callback(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return Ok((StatusCode::BAD_REQUEST, "missing callback parameters").into_response());
    };

    if state.broker.deliver(&query) {
        return Ok(Html(SIGNED_IN_PAGE).into_response());
    }

    state
        .provider
        .deliver_redirect(&query)
        .await
        .map_err(session::Error::from)?;
    state.abort_pending_login();

    if state.manager.resume_redirect().await? {
        Ok(Html(SIGNED_IN_PAGE).into_response())
    } else {
        Ok((
            StatusCode::BAD_REQUEST,
            "no sign-in is waiting for this callback",
        )
            .into_response())
    }
}
