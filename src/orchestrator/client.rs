//! HTTP client the orchestrator uses to talk to a sandbox's control plane.
//!
//! Idempotent calls are retried on transient failures (connection errors and
//! 5xx responses). `/command` and the two OAuth steps are sent once: they
//! start processes inside the sandbox and repeating them is not safe.

use std::time::Duration;

use reqwest::RequestBuilder;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bridge::ReloadRequest;
use crate::bridge::types::{
    AddAuthRequest, CallbackRequest, CommandRequest, Envelope, LoginCompleted, LoginRequest,
    LoginStarted, SessionHistory, SessionInfo, UpdateResult,
};
use crate::error::BridgeError;
use crate::orchestrator::runtime::ContainerRuntime;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

// Longer than the server-side waits so the server answers first.
const COMMAND_REQUEST_TIMEOUT: Duration = Duration::from_secs(35);
const LOGIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const CALLBACK_REQUEST_TIMEOUT: Duration = Duration::from_secs(25);

/// How many times to try a request and how long to wait between tries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before attempt `n + 2`; the last entry repeats.
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![Duration::from_secs(1), Duration::from_secs(2)],
        }
    }
}

impl RetryPolicy {
    /// Single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Vec::new(),
        }
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }
}

/// Client for one sandbox's control-plane server.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    timeout: Duration,
}

impl BridgeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a client for a container from its internal network address.
    pub async fn resolve(
        runtime: &dyn ContainerRuntime,
        container_id: &str,
        port: u16,
        network: Option<&str>,
    ) -> Result<Self, BridgeError> {
        let info = runtime
            .inspect(container_id)
            .await
            .map_err(|e| BridgeError::AddressUnresolved {
                container_id: container_id.to_string(),
                reason: e.to_string(),
            })?;
        let ip = info.ip(network).ok_or_else(|| BridgeError::AddressUnresolved {
            container_id: container_id.to_string(),
            reason: match network {
                Some(name) => format!("not attached to network {name}"),
                None => "no network address".to_string(),
            },
        })?;
        Ok(Self::new(format!("http://{ip}:{port}")))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // -- Transport --

    /// Send one request and unwrap the envelope.
    async fn send_once<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        timeout: Duration,
        context: &str,
    ) -> Result<T, BridgeError> {
        let resp = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BridgeError::Unreachable {
                url: self.base_url.clone(),
                reason: format!("{context}: {e}"),
            })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| BridgeError::Unreachable {
            url: self.base_url.clone(),
            reason: format!("{context}: failed to read body: {e}"),
        })?;
        let envelope: Option<Envelope> = serde_json::from_str(&body).ok();

        if !status.is_success() {
            let message = envelope
                .and_then(|env| env.error)
                .unwrap_or_else(|| body.trim().to_string());
            return Err(BridgeError::Rejected {
                status: status.as_u16(),
                message: format!("{context}: {message}"),
            });
        }

        let envelope = envelope.ok_or_else(|| BridgeError::InvalidResponse {
            reason: format!("{context}: body is not an envelope"),
        })?;
        if !envelope.ok {
            return Err(BridgeError::Rejected {
                status: status.as_u16(),
                message: format!(
                    "{context}: {}",
                    envelope.error.unwrap_or_else(|| "request failed".to_string())
                ),
            });
        }

        serde_json::from_value(envelope.data.unwrap_or(Value::Null)).map_err(|e| {
            BridgeError::InvalidResponse {
                reason: format!("{context}: {e}"),
            }
        })
    }

    /// Send with the retry policy. `build` is called once per attempt.
    async fn send_with_retry<T, F>(
        &self,
        build: F,
        policy: &RetryPolicy,
        timeout: Duration,
        context: &str,
    ) -> Result<T, BridgeError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.send_once(build(), timeout, context).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = policy.delay_after(attempt);
                    tracing::warn!(
                        url = %self.base_url,
                        attempt,
                        max_attempts,
                        "{} failed, retrying in {:?}: {}",
                        context,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BridgeError> {
        let context = format!("GET {path}");
        self.send_with_retry(
            || self.http.get(self.url(path)),
            &self.retry,
            self.timeout,
            &context,
        )
        .await
    }

    fn with_reload(request: RequestBuilder, reload: ReloadRequest) -> RequestBuilder {
        reload
            .headers()
            .into_iter()
            .fold(request, |req, (name, value)| req.header(name, value))
    }

    // -- API --

    pub async fn status(&self) -> Result<Value, BridgeError> {
        self.get_json("/status").await
    }

    /// Merged config view. Contains credentials.
    pub async fn config(&self) -> Result<Value, BridgeError> {
        self.get_json("/config").await
    }

    pub async fn update_config(
        &self,
        patch: &Value,
        reload: ReloadRequest,
    ) -> Result<UpdateResult, BridgeError> {
        self.send_with_retry(
            || Self::with_reload(self.http.post(self.url("/config/update")).json(patch), reload),
            &self.retry,
            self.timeout,
            "POST /config/update",
        )
        .await
    }

    pub async fn add_auth(
        &self,
        provider: &str,
        key: &SecretString,
        mode: Option<&str>,
        reload: ReloadRequest,
    ) -> Result<UpdateResult, BridgeError> {
        self.send_with_retry(
            || {
                let body = AddAuthRequest {
                    provider: provider.to_string(),
                    key: key.expose_secret().to_string(),
                    mode: mode.map(str::to_string),
                };
                Self::with_reload(self.http.post(self.url("/auth/add")).json(&body), reload)
            },
            &self.retry,
            self.timeout,
            "POST /auth/add",
        )
        .await
    }

    /// Run the agent CLI inside the sandbox. Never retried.
    pub async fn command(&self, args: &[String]) -> Result<Value, BridgeError> {
        let body = CommandRequest {
            args: args.to_vec(),
        };
        self.send_once(
            self.http.post(self.url("/command")).json(&body),
            COMMAND_REQUEST_TIMEOUT,
            "POST /command",
        )
        .await
    }

    /// Begin an OAuth login and return the authorization URL.
    pub async fn start_login(&self, provider: &str) -> Result<String, BridgeError> {
        let body = LoginRequest {
            provider: provider.to_string(),
        };
        let started: LoginStarted = self
            .send_once(
                self.http.post(self.url("/auth/login")).json(&body),
                LOGIN_REQUEST_TIMEOUT,
                "POST /auth/login",
            )
            .await?;
        Ok(started.url)
    }

    pub async fn submit_callback(
        &self,
        provider: &str,
        callback_url: &str,
    ) -> Result<LoginCompleted, BridgeError> {
        let body = CallbackRequest {
            provider: provider.to_string(),
            callback_url: callback_url.to_string(),
        };
        self.send_once(
            self.http.post(self.url("/auth/callback")).json(&body),
            CALLBACK_REQUEST_TIMEOUT,
            "POST /auth/callback",
        )
        .await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, BridgeError> {
        self.get_json("/sessions").await
    }

    pub async fn session_history(&self, id: &str) -> Result<SessionHistory, BridgeError> {
        self.get_json(&format!("/sessions/{id}/history")).await
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), BridgeError> {
        let path = format!("/sessions/{id}");
        let context = format!("DELETE {path}");
        let _: Value = self
            .send_with_retry(
                || self.http.delete(self.url(&path)),
                &self.retry,
                self.timeout,
                &context,
            )
            .await?;
        Ok(())
    }

    /// Poll `/status` every `interval` until it answers or `ceiling` passes.
    ///
    /// Each probe is a single attempt; the polling itself is the retry.
    pub async fn wait_for_bridge(&self, interval: Duration, ceiling: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + ceiling;
        let probe_timeout = self.timeout.min(interval.max(Duration::from_secs(1)));
        loop {
            let probe: Result<Value, _> = self
                .send_once(self.http.get(self.url("/status")), probe_timeout, "GET /status")
                .await;
            match probe {
                Ok(_) => {
                    tracing::debug!(url = %self.base_url, "Bridge is reachable");
                    return true;
                }
                Err(e) => tracing::debug!(url = %self.base_url, "Bridge not ready: {}", e),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::warn!(url = %self.base_url, "Bridge not reachable after {:?}", ceiling);
                return false;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }
}
