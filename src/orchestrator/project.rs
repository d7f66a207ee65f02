//! Project records as the coordinator sees them.
//!
//! Project CRUD lives elsewhere; the coordinator only looks projects up to
//! find the container to provision and the credentials to push into it.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::SandboxSecrets;
use crate::error::LifecycleError;

#[derive(Debug, Clone, Default)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub container_id: Option<String>,
    pub provider: Option<String>,
    pub api_key: Option<SecretString>,
    pub auth_mode: Option<String>,
    pub model: Option<String>,
    /// Bot token per channel name.
    pub channel_tokens: BTreeMap<String, SecretString>,
}

/// A project safe to return from an API: credentials masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskedProject {
    pub id: String,
    pub name: String,
    pub container_id: Option<String>,
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub channel_tokens: BTreeMap<String, String>,
}

impl Project {
    pub fn masked(&self) -> MaskedProject {
        MaskedProject {
            id: self.id.clone(),
            name: self.name.clone(),
            container_id: self.container_id.clone(),
            provider: self.provider.clone(),
            api_key: self
                .api_key
                .as_ref()
                .map(|key| mask_credential(key.expose_secret())),
            model: self.model.clone(),
            channel_tokens: self
                .channel_tokens
                .iter()
                .map(|(name, token)| (name.clone(), mask_credential(token.expose_secret())))
                .collect(),
        }
    }

    /// What the coordinator injects into this project's sandbox.
    pub fn sandbox_secrets(&self) -> SandboxSecrets {
        SandboxSecrets {
            provider: self.provider.clone(),
            api_key: self.api_key.clone(),
            auth_mode: self.auth_mode.clone(),
            model: self.model.clone(),
            channels: self.channel_tokens.clone(),
        }
    }
}

/// Keep the first and last four characters of long credentials.
pub fn mask_credential(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 12 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}****{tail}")
    } else {
        "****".to_string()
    }
}

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Project>, LifecycleError>;
}

/// Map-backed repository for the CLI and tests.
#[derive(Default)]
pub struct InMemoryProjectRepository {
    projects: RwLock<HashMap<String, Project>>,
}

impl InMemoryProjectRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, project: Project) {
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project);
    }
}

#[async_trait]
impl ProjectRepository for InMemoryProjectRepository {
    async fn get(&self, id: &str) -> Result<Option<Project>, LifecycleError> {
        Ok(self.projects.read().await.get(id).cloned())
    }
}
