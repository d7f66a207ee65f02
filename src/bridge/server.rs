//! Control-plane HTTP server running inside each sandbox.
//!
//! Every response uses the `{ ok, data?, error? }` envelope. The server is
//! reachable only on the sandbox's internal network; `/config` returns
//! credentials in clear for that reason.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::bridge::command::CommandRunner;
use crate::bridge::reload::{ParentSignaler, ReloadRequest, Reloader};
use crate::bridge::sessions::SessionStore;
use crate::bridge::types::{
    AddAuthRequest, CallbackRequest, CommandRequest, Envelope, LoginCompleted, LoginRequest,
    LoginStarted, SessionHistory, SessionInfo, UpdateResult,
};
use crate::config::BridgeConfig;
use crate::error::{CommandError, MergeError, OAuthError, StoreError};
use crate::merge::{merged_view, plan_update, summarize};
use crate::oauth::{DefaultLoginMatcher, FlowRegistry, PtySpawner, validate_provider};
use crate::store::{ConfigStore, DEFAULT_PROFILE_LABEL, SecretProfileStore, profile_key};

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared state for all control-plane handlers.
pub struct BridgeState {
    pub store: ConfigStore,
    pub sessions: SessionStore,
    pub commands: CommandRunner,
    pub logins: FlowRegistry,
    pub reloader: Reloader,
    pub started_at: Instant,
}

impl BridgeState {
    pub fn new(
        store: ConfigStore,
        sessions: SessionStore,
        commands: CommandRunner,
        logins: FlowRegistry,
        reloader: Reloader,
    ) -> Self {
        Self {
            store,
            sessions,
            commands,
            logins,
            reloader,
            started_at: Instant::now(),
        }
    }

    /// Production wiring: PTY logins and parent-signal restarts.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            ConfigStore::new(config.config_path.clone(), config.auth_profiles_path.clone()),
            SessionStore::new(config.sessions_dir.clone()),
            CommandRunner::new(config.cli_bin.clone()),
            FlowRegistry::new(
                config.cli_bin.clone(),
                Arc::new(PtySpawner::default()),
                Arc::new(DefaultLoginMatcher::new()),
            ),
            Reloader::new(Arc::new(ParentSignaler), config.restart_delay),
        )
    }
}

/// The in-sandbox control-plane API.
pub struct ControlPlaneServer;

impl ControlPlaneServer {
    pub fn router(state: Arc<BridgeState>) -> Router {
        Router::new()
            .route("/status", get(status_handler))
            .route("/config", get(config_handler))
            .route("/config/update", post(config_update_handler))
            .route("/auth/add", post(auth_add_handler))
            .route("/auth/login", post(auth_login_handler))
            .route("/auth/callback", post(auth_callback_handler))
            .route("/command", post(command_handler))
            .route("/sessions", get(sessions_list_handler))
            .route("/sessions/{id}/history", get(session_history_handler))
            .route("/sessions/{id}", delete(session_delete_handler))
            .fallback(not_found_handler)
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `shutdown` resolves, then kill any in-flight logins.
    pub async fn serve(
        listener: tokio::net::TcpListener,
        state: Arc<BridgeState>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let logins = state.logins.clone();
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Control-plane server listening on {}", addr);
        }
        axum::serve(listener, Self::router(state))
            .with_graceful_shutdown(shutdown)
            .await?;
        logins.shutdown().await;
        tracing::info!("Control-plane server stopped");
        Ok(())
    }

    /// Bind and serve in the background.
    ///
    /// Returns the actual bound address (useful when binding to port 0).
    pub async fn start(addr: SocketAddr, state: Arc<BridgeState>) -> std::io::Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = Self::serve(listener, state, std::future::pending()).await {
                tracing::error!("Control-plane server error: {}", e);
            }
        });
        Ok(bound)
    }
}

// -- Errors --

/// Handler error rendered as a `{ ok: false, error }` envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    data: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope = Envelope {
            ok: false,
            data: self.data,
            error: Some(self.message),
        };
        (self.status, Json(envelope)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<MergeError> for ApiError {
    fn from(e: MergeError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidSessionId(_) => Self::bad_request(e.to_string()),
            _ => {
                tracing::error!("Store failure: {}", e);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

impl From<OAuthError> for ApiError {
    fn from(e: OAuthError) -> Self {
        let status = match &e {
            OAuthError::InvalidProvider(_) | OAuthError::InvalidCallback { .. } => {
                StatusCode::BAD_REQUEST
            }
            OAuthError::NoActiveFlow { .. } | OAuthError::Superseded { .. } => {
                StatusCode::CONFLICT
            }
            OAuthError::UrlTimeout { .. } | OAuthError::CallbackTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            OAuthError::ProcessExited { .. } | OAuthError::LoginFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            OAuthError::SpawnFailed { .. } | OAuthError::Io { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

/// Map a CLI failure, scrubbing stored credentials from anything echoed back.
fn command_error(e: CommandError, secrets: &SecretProfileStore) -> ApiError {
    match e {
        CommandError::EmptyArgs => ApiError::bad_request(e.to_string()),
        CommandError::Timeout(_) => ApiError::new(StatusCode::GATEWAY_TIMEOUT, e.to_string()),
        CommandError::SpawnFailed { .. } => {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, secrets.redact(&e.to_string()))
        }
        CommandError::Failed {
            code,
            ref stdout,
            ref stderr,
        } => {
            let stderr = secrets.redact(stderr);
            let message = match stderr.trim() {
                "" => e.to_string(),
                detail => format!("{}: {}", e, detail.lines().next_back().unwrap_or(detail)),
            };
            ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message,
                data: Some(json!({
                    "code": code,
                    "stdout": secrets.redact(stdout),
                    "stderr": stderr,
                })),
            }
        }
    }
}

// -- Config writes --

/// Serialized read → plan → write of both stores, then the requested reload.
async fn apply_update(
    state: &BridgeState,
    update: Value,
    reload: ReloadRequest,
) -> Result<UpdateResult, ApiError> {
    let profiles_changed = {
        let _guard = state.store.lock().await;
        let config = state.store.read_config()?;
        let profiles = state.store.read_profiles()?;
        let plan = plan_update(&config, &profiles, update)?;

        // Secrets first: a crash in between leaves a credential without its
        // sanitized entry, never a sanitized entry pointing at nothing.
        if plan.profiles_changed {
            state.store.write_profiles(&plan.profiles)?;
        }
        state.store.write_config(&plan.config)?;
        plan.profiles_changed
    };

    let outcome = state.reloader.apply(reload);
    tracing::info!(profiles_changed, reload = ?outcome, "Config updated");
    Ok(UpdateResult {
        reload: outcome,
        profiles_changed,
    })
}

fn reload_request(headers: &HeaderMap) -> Result<ReloadRequest, ApiError> {
    ReloadRequest::from_headers(headers).map_err(ApiError::bad_request)
}

// -- Handlers --

async fn not_found_handler() -> ApiError {
    ApiError::not_found("no such endpoint")
}

async fn status_handler(State(state): State<Arc<BridgeState>>) -> Json<Envelope> {
    let mut data = json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "logins": state.logins.active_flows().await,
        "recentCommands": state.commands.history().recent(),
    });

    let stores = state
        .store
        .read_config()
        .and_then(|config| Ok((config, state.store.read_profiles()?)));
    match stores {
        Ok((config, profiles)) => data["config"] = summarize(&config, &profiles),
        Err(e) => {
            tracing::warn!("Status could not read config: {}", e);
            data["configError"] = Value::String(e.to_string());
        }
    }

    Json(Envelope::success(data))
}

async fn config_handler(
    State(state): State<Arc<BridgeState>>,
) -> Result<Json<Envelope>, ApiError> {
    let config = state.store.read_config()?;
    let profiles = state.store.read_profiles()?;
    Ok(Json(Envelope::success(merged_view(&config, &profiles))))
}

async fn config_update_handler(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Envelope<UpdateResult>>, ApiError> {
    let Json(update) = payload?;
    let reload = reload_request(&headers)?;
    let result = apply_update(&state, update, reload).await?;
    Ok(Json(Envelope::success(result)))
}

async fn auth_add_handler(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
    payload: Result<Json<AddAuthRequest>, JsonRejection>,
) -> Result<Json<Envelope<UpdateResult>>, ApiError> {
    let Json(req) = payload?;
    let reload = reload_request(&headers)?;
    validate_provider(&req.provider)?;
    if req.key.trim().is_empty() {
        return Err(ApiError::bad_request("key must not be empty"));
    }
    let mode = req
        .mode
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| "api_key".to_string());

    let key = profile_key(&req.provider, DEFAULT_PROFILE_LABEL);
    tracing::info!(provider = %req.provider, mode = %mode, "Adding auth profile");
    let update = json!({
        "auth": {
            "profiles": {
                key: {
                    "provider": req.provider,
                    "mode": mode,
                    "key": req.key.trim(),
                }
            }
        }
    });

    let result = apply_update(&state, update, reload).await?;
    Ok(Json(Envelope::success(result)))
}

async fn command_handler(
    State(state): State<Arc<BridgeState>>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<Envelope>, ApiError> {
    let Json(req) = payload?;
    match state.commands.run(&req.args).await {
        Ok(data) => Ok(Json(Envelope::success(data))),
        Err(e) => {
            let secrets = state.store.read_profiles().unwrap_or_default();
            Err(command_error(e, &secrets))
        }
    }
}

async fn auth_login_handler(
    State(state): State<Arc<BridgeState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<Envelope<LoginStarted>>, ApiError> {
    let Json(req) = payload?;
    let url = state.logins.start_login(&req.provider).await?;
    Ok(Json(Envelope::success(LoginStarted { url })))
}

async fn auth_callback_handler(
    State(state): State<Arc<BridgeState>>,
    payload: Result<Json<CallbackRequest>, JsonRejection>,
) -> Result<Json<Envelope<LoginCompleted>>, ApiError> {
    let Json(req) = payload?;
    let output = state
        .logins
        .submit_callback(&req.provider, &req.callback_url)
        .await?;
    Ok(Json(Envelope::success(LoginCompleted {
        provider: req.provider,
        output,
    })))
}

async fn sessions_list_handler(
    State(state): State<Arc<BridgeState>>,
) -> Result<Json<Envelope<Vec<SessionInfo>>>, ApiError> {
    Ok(Json(Envelope::success(state.sessions.list()?)))
}

async fn session_history_handler(
    State(state): State<Arc<BridgeState>>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<SessionHistory>>, ApiError> {
    let history = state
        .sessions
        .history(&id)?
        .ok_or_else(|| ApiError::not_found(format!("session {id} not found")))?;
    Ok(Json(Envelope::success(history)))
}

async fn session_delete_handler(
    State(state): State<Arc<BridgeState>>,
    Path(id): Path<String>,
) -> Result<Json<Envelope>, ApiError> {
    if state.sessions.delete(&id)? {
        Ok(Json(Envelope::success(json!({ "deleted": id }))))
    } else {
        Err(ApiError::not_found(format!("session {id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::bridge::reload::tests::RecordingSignaler;

    struct Harness {
        state: Arc<BridgeState>,
        signaler: Arc<RecordingSignaler>,
        dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let signaler = Arc::new(RecordingSignaler::default());
        let state = BridgeState::new(
            ConfigStore::new(
                dir.path().join("openclaw.json"),
                dir.path().join("agents/main/agent/auth-profiles.json"),
            ),
            SessionStore::new(dir.path().join("agents/main/sessions")),
            CommandRunner::new("sh"),
            FlowRegistry::new(
                "openclaw",
                Arc::new(PtySpawner::default()),
                Arc::new(DefaultLoginMatcher::new()),
            ),
            Reloader::new(signaler.clone(), Duration::from_millis(10)),
        );
        Harness {
            state: Arc::new(state),
            signaler,
            dir,
        }
    }

    async fn call(
        state: &Arc<BridgeState>,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let resp = ControlPlaneServer::router(Arc::clone(state))
            .oneshot(req)
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    const NO_RELOAD: &[(&str, &str)] = &[("x-reload", "false")];

    #[tokio::test]
    async fn test_status_is_read_only() {
        let h = harness();
        let (status, body) = call(&h.state, Method::GET, "/status", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["data"]["config"]["channels"], json!([]));

        let (_, again) = call(&h.state, Method::GET, "/status", None, &[]).await;
        assert_eq!(again["data"]["config"], body["data"]["config"]);
        assert!(!h.state.store.config_path().exists());
        assert!(!h.state.store.profiles_path().exists());
    }

    #[tokio::test]
    async fn test_config_update_splits_secrets_and_aliases_tokens() {
        let h = harness();
        let update = json!({
            "channels": {"telegram": {"enabled": true, "accounts": {"default": {"token": "123:abc"}}}},
            "auth": {"profiles": {"anthropic:default": {"provider": "anthropic", "mode": "api_key", "key": "sk-ant-0123456789"}}},
        });
        let (status, body) =
            call(&h.state, Method::POST, "/config/update", Some(update), NO_RELOAD).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["reload"], "skipped");
        assert_eq!(body["data"]["profilesChanged"], true);

        let on_disk = std::fs::read_to_string(h.state.store.config_path()).unwrap();
        assert!(!on_disk.contains("sk-ant-0123456789"));
        let on_disk: Value = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(
            on_disk["channels"]["telegram"]["accounts"]["default"],
            json!({"botToken": "123:abc"})
        );
        assert_eq!(
            on_disk["auth"]["profiles"]["anthropic:default"],
            json!({"provider": "anthropic", "mode": "token"})
        );

        let (_, view) = call(&h.state, Method::GET, "/config", None, &[]).await;
        assert_eq!(
            view["data"]["auth"]["profiles"]["anthropic:default"]["key"],
            "sk-ant-0123456789"
        );
    }

    #[tokio::test]
    async fn test_auth_add_schedules_restart_by_default() {
        let h = harness();
        let (status, body) = call(
            &h.state,
            Method::POST,
            "/auth/add",
            Some(json!({"provider": "openai", "key": "sk-openai-abcdef"})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["reload"], "restart");

        let stored = h.state.store.read_profiles().unwrap();
        assert_eq!(
            stored.profiles["openai:default"].key.as_deref(),
            Some("sk-openai-abcdef")
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.signaler.signals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hot_reload_writes_without_signal() {
        let h = harness();
        let (status, body) = call(
            &h.state,
            Method::POST,
            "/config/update",
            Some(json!({"gateway": {"port": 18789}})),
            &[("x-strategy", "hot-reload")],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["reload"], "hot-reload");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.signaler.signals.load(Ordering::SeqCst), 0);
        assert_eq!(h.state.store.read_config().unwrap()["gateway"]["port"], 18789);
    }

    #[tokio::test]
    async fn test_malformed_requests_are_rejected() {
        let h = harness();

        let req = Request::builder()
            .method(Method::POST)
            .uri("/config/update")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = ControlPlaneServer::router(Arc::clone(&h.state))
            .oneshot(req)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let (status, body) =
            call(&h.state, Method::POST, "/config/update", Some(json!([1, 2])), &[]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);

        let (status, _) = call(
            &h.state,
            Method::POST,
            "/config/update",
            Some(json!({})),
            &[("x-strategy", "reboot")],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &h.state,
            Method::POST,
            "/auth/add",
            Some(json!({"provider": "openai", "key": ""})),
            NO_RELOAD,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!h.state.store.config_path().exists());
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let h = harness();
        let mut tasks = Vec::new();
        for i in 0..10 {
            let state = Arc::clone(&h.state);
            tasks.push(tokio::spawn(async move {
                let update = json!({ "plugins": { format!("p{i}"): {"enabled": true} } });
                call(&state, Method::POST, "/config/update", Some(update), NO_RELOAD).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().0, StatusCode::OK);
        }
        let config = h.state.store.read_config().unwrap();
        assert_eq!(config["plugins"].as_object().unwrap().len(), 10);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_results() {
        let h = harness();
        let (status, body) = call(
            &h.state,
            Method::POST,
            "/command",
            Some(json!({"args": ["-c", "echo '{\"issues\":1}'; exit 1"]})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["issues"], 1);

        let (status, body) = call(
            &h.state,
            Method::POST,
            "/command",
            Some(json!({"args": ["-c", "echo crashed >&2; exit 2"]})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["ok"], false);
        assert_eq!(body["data"]["code"], 2);
        assert_eq!(body["data"]["stderr"].as_str().unwrap().trim(), "crashed");

        let (status, _) =
            call(&h.state, Method::POST, "/command", Some(json!({"args": []})), &[]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, status_body) = call(&h.state, Method::GET, "/status", None, &[]).await;
        assert_eq!(status_body["data"]["recentCommands"].as_array().unwrap().len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_errors_redact_credentials() {
        let h = harness();
        call(
            &h.state,
            Method::POST,
            "/auth/add",
            Some(json!({"provider": "anthropic", "key": "sk-ant-leaky-secret"})),
            NO_RELOAD,
        )
        .await;

        let (status, body) = call(
            &h.state,
            Method::POST,
            "/command",
            Some(json!({"args": ["-c", "echo 'bad key sk-ant-leaky-secret' >&2; exit 1"]})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.to_string().contains("sk-ant-leaky-secret"));
        assert!(body["error"].as_str().unwrap().contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_callback_without_login_conflicts() {
        let h = harness();
        let (status, body) = call(
            &h.state,
            Method::POST,
            "/auth/callback",
            Some(json!({"provider": "openai-codex", "callbackUrl": "http://localhost:1455/cb"})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["ok"], false);

        let (status, _) = call(
            &h.state,
            Method::POST,
            "/auth/login",
            Some(json!({"provider": "../../bin/sh"})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_session_endpoints() {
        let h = harness();
        let sessions_dir = h.dir.path().join("agents/main/sessions");
        std::fs::create_dir_all(&sessions_dir).unwrap();
        std::fs::write(sessions_dir.join("abc.jsonl"), "{\"role\":\"user\"}\n").unwrap();

        let (status, body) = call(&h.state, Method::GET, "/sessions", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["id"], "abc");
        assert_eq!(body["data"][0]["messageCount"], 1);

        let (status, body) =
            call(&h.state, Method::GET, "/sessions/abc/history", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["messages"][0]["role"], "user");

        let (status, _) = call(&h.state, Method::GET, "/sessions/a.b/history", None, &[]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&h.state, Method::DELETE, "/sessions/abc", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&h.state, Method::DELETE, "/sessions/abc", None, &[]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_route_uses_envelope() {
        let h = harness();
        let (status, body) = call(&h.state, Method::GET, "/nope", None, &[]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], false);
    }
}
