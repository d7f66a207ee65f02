//! Error types for clawbridge.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Errors from the on-disk config and secret-profile stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{} must contain a JSON object at the top level", path.display())]
    NotAnObject { path: PathBuf },

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),
}

/// A partial config update that cannot be applied.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("update must be a JSON object")]
    NotAnObject,

    #[error("auth.profiles must be a JSON object")]
    ProfilesNotAnObject,

    #[error("invalid auth profile {key}: {reason}")]
    InvalidProfile { key: String, reason: String },
}

/// Errors from running the wrapped CLI.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("no command arguments given")]
    EmptyArgs,

    #[error("failed to spawn {bin}: {reason}")]
    SpawnFailed { bin: String, reason: String },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command exited with code {code}")]
    Failed {
        code: i32,
        stdout: String,
        stderr: String,
    },
}

/// Errors from the interactive OAuth login flow.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("invalid provider name: {0:?}")]
    InvalidProvider(String),

    #[error("failed to start login for {provider}: {reason}")]
    SpawnFailed { provider: String, reason: String },

    #[error("timed out waiting for the {provider} auth URL")]
    UrlTimeout { provider: String },

    #[error("timed out waiting for the {provider} login to complete")]
    CallbackTimeout { provider: String },

    #[error("login process for {provider} exited before finishing: {output}")]
    ProcessExited { provider: String, output: String },

    #[error("login for {provider} failed: {output}")]
    LoginFailed { provider: String, output: String },

    #[error("invalid callback URL: {reason}")]
    InvalidCallback { reason: String },

    #[error("no login awaiting a callback for {provider}")]
    NoActiveFlow { provider: String },

    #[error("login for {provider} was replaced by a newer login")]
    Superseded { provider: String },

    #[error("login process IO failed for {provider}: {reason}")]
    Io { provider: String, reason: String },
}

/// Errors from the orchestrator-side bridge client.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge at {url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("bridge returned {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid bridge response: {reason}")]
    InvalidResponse { reason: String },

    #[error("cannot resolve bridge address for container {container_id}: {reason}")]
    AddressUnresolved {
        container_id: String,
        reason: String,
    },
}

impl BridgeError {
    /// Whether this failure belongs to the transient class (connection-level
    /// errors or a 5xx) that the retry policy covers.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable { .. } => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::InvalidResponse { .. } | Self::AddressUnresolved { .. } => false,
        }
    }
}

/// Errors from container lifecycle coordination.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("container runtime error: {reason}")]
    Runtime { reason: String },

    #[error("container {container_id} not found")]
    ContainerNotFound { container_id: String },

    #[error("container {container_id} not running after {waited:?}")]
    NotRunning {
        container_id: String,
        waited: Duration,
    },

    #[error("exec in {container_id} exited with code {code}: {output}")]
    ExecFailed {
        container_id: String,
        code: i64,
        output: String,
    },

    #[error("project {0} not found")]
    ProjectNotFound(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
