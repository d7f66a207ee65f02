//! Secret profile store document (`auth-profiles.json`).
//!
//! This is the only document allowed to hold raw credentials. The main
//! config carries a sanitized `{provider, mode}` view of the same profiles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current on-disk schema version.
pub const PROFILE_STORE_VERSION: u32 = 1;

/// Label used when a profile is added without an explicit one.
pub const DEFAULT_PROFILE_LABEL: &str = "default";

fn default_version() -> u32 {
    PROFILE_STORE_VERSION
}

/// `{ version, profiles: { "<provider>:<label>": AuthProfile } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretProfileStore {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub profiles: BTreeMap<String, AuthProfile>,
}

impl Default for SecretProfileStore {
    fn default() -> Self {
        Self {
            version: PROFILE_STORE_VERSION,
            profiles: BTreeMap::new(),
        }
    }
}

/// A single credential entry.
///
/// Fields beyond `type`/`provider`/`key` (OAuth access/refresh tokens,
/// expiry, account ids) are kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthProfile {
    #[serde(rename = "type")]
    pub kind: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AuthProfile {
    pub fn new(kind: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            provider: provider.into(),
            key: None,
            extra: Map::new(),
        }
    }

    /// `true` if the profile carries an API key or an OAuth token.
    pub fn has_credential(&self) -> bool {
        let non_empty = |v: Option<&str>| v.is_some_and(|s| !s.is_empty());
        non_empty(self.key.as_deref())
            || CREDENTIAL_FIELDS
                .iter()
                .any(|field| non_empty(self.extra.get(*field).and_then(Value::as_str)))
    }
}

/// Fields in `extra` that hold OAuth tokens.
const CREDENTIAL_FIELDS: [&str; 3] = ["access", "refresh", "token"];

/// Build a `<provider>:<label>` profile key.
pub fn profile_key(provider: &str, label: &str) -> String {
    format!("{provider}:{label}")
}

/// Provider half of a `<provider>:<label>` key, if present.
pub fn provider_of_key(key: &str) -> Option<&str> {
    key.split_once(':')
        .map(|(provider, _)| provider)
        .filter(|p| !p.is_empty())
}

impl SecretProfileStore {
    /// Replace every stored credential value found in `text` with `[REDACTED]`.
    ///
    /// Used on anything that may echo a credential back to a caller, such as
    /// captured CLI output.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for profile in self.profiles.values() {
            let mut secrets: Vec<&str> = Vec::new();
            if let Some(key) = profile.key.as_deref() {
                secrets.push(key);
            }
            for value in profile.extra.values() {
                if let Some(s) = value.as_str() {
                    secrets.push(s);
                }
            }
            for secret in secrets {
                // Short values would redact ordinary words.
                if secret.len() >= 8 {
                    out = out.replace(secret, "[REDACTED]");
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_key_helpers() {
        assert_eq!(profile_key("anthropic", "default"), "anthropic:default");
        assert_eq!(provider_of_key("anthropic:work"), Some("anthropic"));
        assert_eq!(provider_of_key(":work"), None);
        assert_eq!(provider_of_key("nolabel"), None);
    }

    #[test]
    fn test_store_roundtrip_keeps_unknown_fields() {
        let raw = serde_json::json!({
            "version": 1,
            "profiles": {
                "openai-codex:default": {
                    "type": "oauth",
                    "provider": "openai-codex",
                    "access": "acc-token",
                    "refresh": "ref-token",
                    "expires": 1700000000
                }
            }
        });
        let store: SecretProfileStore = serde_json::from_value(raw.clone()).unwrap();
        let profile = &store.profiles["openai-codex:default"];
        assert_eq!(profile.kind, "oauth");
        assert!(profile.key.is_none());
        assert_eq!(profile.extra["refresh"], "ref-token");
        assert_eq!(serde_json::to_value(&store).unwrap(), raw);
    }

    #[test]
    fn test_has_credential_ignores_plain_metadata() {
        let mut profile = AuthProfile::new("oauth", "openai-codex");
        profile.extra.insert("email".into(), Value::from("me@example.com"));
        profile.extra.insert("legacyField".into(), Value::from("x"));
        profile.extra.insert("expires".into(), Value::from(1700000000));
        assert!(!profile.has_credential());

        profile.extra.insert("refresh".into(), Value::from("ref-token"));
        assert!(profile.has_credential());

        let mut keyed = AuthProfile::new("api_key", "anthropic");
        keyed.key = Some(String::new());
        assert!(!keyed.has_credential());
        keyed.key = Some("sk-ant-1".into());
        assert!(keyed.has_credential());
    }

    #[test]
    fn test_missing_version_defaults() {
        let store: SecretProfileStore = serde_json::from_str(r#"{"profiles":{}}"#).unwrap();
        assert_eq!(store.version, PROFILE_STORE_VERSION);
    }

    #[test]
    fn test_redact_replaces_credentials() {
        let mut store = SecretProfileStore::default();
        let mut profile = AuthProfile::new("api_key", "anthropic");
        profile.key = Some("sk-ant-supersecret".to_string());
        store.profiles.insert("anthropic:default".to_string(), profile);

        let redacted = store.redact("error: key sk-ant-supersecret rejected");
        assert_eq!(redacted, "error: key [REDACTED] rejected");
    }
}
