//! Deep merge and secret splitting for config updates.
//!
//! A partial update is applied in two phases:
//!
//! ```text
//!   update ──┬─ auth.profiles ──► credentials ──► SecretProfileStore
//!            │                  └► {provider, mode} ──────────────┐
//!            │                                                    ▼
//!            └─ everything else ──► merge_deep(current) ──► overwrite auth.profiles
//! ```
//!
//! `auth.profiles` is authoritative: it is replaced with the sanitized copy
//! after the structural merge, never deep-merged. Deep-merging it would keep
//! stale legacy fields (including old credentials) alive in the main config.

use serde_json::{Map, Value, json};

use crate::error::MergeError;
use crate::store::{AuthProfile, SecretProfileStore, provider_of_key};

/// Location of the sanitized profile view inside the main config.
pub const AUTH_PROFILES_PATH: &[&str] = &["auth", "profiles"];

/// Profile fields that carry the credential itself.
const CREDENTIAL_FIELDS: &[&str] = &["key", "apiKey"];

/// Profile fields that describe the profile rather than hold secret material.
const METADATA_FIELDS: &[&str] = &["provider", "mode", "type"];

const DEFAULT_MODE: &str = "api_key";

/// Recursively merge `patch` into `target`.
///
/// Objects merge key by key; any other value (arrays, scalars, `null`)
/// replaces what was there.
pub fn merge_deep(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                let both_objects =
                    value.is_object() && target.get(key).is_some_and(Value::is_object);
                if both_objects {
                    if let Some(existing) = target.get_mut(key) {
                        merge_deep(existing, value);
                    }
                } else {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Deep merge, then overwrite each authoritative path with its given value.
pub fn merge_with_authoritative(
    target: &mut Value,
    patch: &Value,
    authoritative: Vec<(&[&str], Value)>,
) {
    merge_deep(target, patch);
    for (path, value) in authoritative {
        set_path(target, path, value);
    }
}

pub fn get_path<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(doc, |cursor, segment| cursor.get(*segment))
}

/// Set `path` to `value`, creating (or replacing non-object) parents.
pub fn set_path(doc: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *doc = value;
        return;
    };
    let mut cursor = doc;
    for segment in parents {
        cursor = ensure_object(cursor)
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(cursor).insert(last.to_string(), value);
}

fn remove_path(doc: &mut Value, path: &[&str]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut cursor = doc;
    for segment in parents {
        cursor = cursor.get_mut(*segment)?;
    }
    cursor.as_object_mut()?.remove(*last)
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

/// Normalize an auth mode for the main config. `api_key` is spelled `token`
/// there.
pub fn normalize_mode(mode: &str) -> String {
    match mode.trim() {
        "api_key" => "token".to_string(),
        other => other.to_string(),
    }
}

/// Rewrite `channels.<channel>.accounts.<account>.token` to `botToken`.
///
/// An explicit `botToken` next to a `token` wins; the `token` key is always
/// dropped.
pub fn alias_channel_tokens(doc: &mut Value) {
    let Some(channels) = doc.get_mut("channels").and_then(Value::as_object_mut) else {
        return;
    };
    for channel in channels.values_mut() {
        let Some(accounts) = channel.get_mut("accounts").and_then(Value::as_object_mut) else {
            continue;
        };
        for account in accounts.values_mut() {
            let Some(fields) = account.as_object_mut() else {
                continue;
            };
            if let Some(token) = fields.remove("token")
                && !fields.contains_key("botToken")
            {
                fields.insert("botToken".to_string(), token);
            }
        }
    }
}

/// Result of planning an update against the current on-disk state.
#[derive(Debug, Clone)]
pub struct UpdatePlan {
    /// Next main config (sanitized).
    pub config: Value,
    /// Next secret profile store.
    pub profiles: SecretProfileStore,
    /// Whether `profiles` differs from the current secret store.
    pub profiles_changed: bool,
}

/// Compute the next state of both stores for a partial `update`.
///
/// Credentials found under `auth.profiles` (in the update, or left over in the
/// current main config) move to the secret store. A profile set to `null` is
/// removed from both stores. Omitting `key` for an existing profile keeps the
/// stored credential.
pub fn plan_update(
    current: &Value,
    secrets: &SecretProfileStore,
    update: Value,
) -> Result<UpdatePlan, MergeError> {
    let mut update = match update {
        Value::Object(map) => Value::Object(map),
        _ => return Err(MergeError::NotAnObject),
    };
    alias_channel_tokens(&mut update);

    let incoming = match remove_path(&mut update, AUTH_PROFILES_PATH) {
        None => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => return Err(MergeError::ProfilesNotAnObject),
    };

    let mut next_secrets = secrets.clone();
    let mut sanitized = Map::new();

    if let Some(existing) = get_path(current, AUTH_PROFILES_PATH).and_then(Value::as_object) {
        for (key, entry) in existing {
            if let Err(e) = absorb_profile(key, entry, &mut next_secrets, &mut sanitized, false) {
                tracing::warn!("Dropping unreadable profile from main config: {}", e);
            }
        }
    }

    if let Some(incoming) = &incoming {
        for (key, entry) in incoming {
            if entry.is_null() {
                next_secrets.profiles.remove(key);
                sanitized.remove(key);
                continue;
            }
            absorb_profile(key, entry, &mut next_secrets, &mut sanitized, true)?;
        }
    }

    let touch_profiles =
        incoming.is_some() || get_path(current, AUTH_PROFILES_PATH).is_some();
    let authoritative = if touch_profiles {
        vec![(AUTH_PROFILES_PATH, Value::Object(sanitized))]
    } else {
        Vec::new()
    };

    let mut merged = current.clone();
    merge_with_authoritative(&mut merged, &update, authoritative);
    alias_channel_tokens(&mut merged);

    let profiles_changed = next_secrets != *secrets;
    Ok(UpdatePlan {
        config: merged,
        profiles: next_secrets,
        profiles_changed,
    })
}

/// Split one profile entry into its secret-store record and sanitized view.
///
/// `incoming` entries are authoritative for metadata and credentials. Entries
/// already in the main config only fill gaps in the secret store (legacy
/// credentials that were written there before the split existed).
fn absorb_profile(
    key: &str,
    entry: &Value,
    secrets: &mut SecretProfileStore,
    sanitized: &mut Map<String, Value>,
    incoming: bool,
) -> Result<(), MergeError> {
    let invalid = |reason: &str| MergeError::InvalidProfile {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if key.trim().is_empty() {
        return Err(invalid("profile key is empty"));
    }
    let Value::Object(fields) = entry else {
        return Err(invalid("profile must be an object"));
    };

    let str_field = |name: &str| fields.get(name).and_then(Value::as_str);
    let stored = secrets.profiles.get(key);

    let provider = str_field("provider")
        .filter(|p| !p.is_empty())
        .or_else(|| provider_of_key(key))
        .or_else(|| stored.map(|p| p.provider.as_str()))
        .ok_or_else(|| invalid("missing provider"))?
        .to_string();

    let mode = str_field("mode")
        .or_else(|| str_field("type"))
        .filter(|m| !m.is_empty())
        .or_else(|| stored.map(|p| p.kind.as_str()))
        .unwrap_or(DEFAULT_MODE)
        .to_string();

    let credential = CREDENTIAL_FIELDS
        .iter()
        .find_map(|name| str_field(name))
        .filter(|k| !k.is_empty())
        .map(str::to_string);

    let extra: Map<String, Value> = fields
        .iter()
        .filter(|(name, _)| {
            !METADATA_FIELDS.contains(&name.as_str()) && !CREDENTIAL_FIELDS.contains(&name.as_str())
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    if incoming || credential.is_some() || !extra.is_empty() {
        let profile = secrets
            .profiles
            .entry(key.to_string())
            .or_insert_with(|| AuthProfile::new(mode.clone(), provider.clone()));

        if incoming {
            profile.kind = mode.clone();
            profile.provider = provider.clone();
        }
        if let Some(credential) = credential
            && (incoming || profile.key.is_none())
        {
            profile.key = Some(credential);
        }
        for (name, value) in extra {
            if incoming || !profile.extra.contains_key(&name) {
                profile.extra.insert(name, value);
            }
        }
    }

    sanitized.insert(
        key.to_string(),
        json!({
            "provider": provider,
            "mode": normalize_mode(&mode),
        }),
    );
    Ok(())
}

/// Main config with secret-store profiles folded in, credentials included.
///
/// Display-only: the result must never be written back to disk.
pub fn merged_view(config: &Value, secrets: &SecretProfileStore) -> Value {
    let mut view = config.clone();
    let mut profiles = get_path(config, AUTH_PROFILES_PATH)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    for (key, secret) in &secrets.profiles {
        let entry = profiles.entry(key.clone()).or_insert_with(|| {
            json!({
                "provider": secret.provider,
                "mode": normalize_mode(&secret.kind),
            })
        });
        if let Value::Object(fields) = entry {
            if let Some(credential) = &secret.key {
                fields.insert("key".to_string(), Value::String(credential.clone()));
            }
            for (name, value) in &secret.extra {
                fields.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    if !profiles.is_empty() {
        set_path(&mut view, AUTH_PROFILES_PATH, Value::Object(profiles));
    }
    view
}

/// Credential-free summary of the config for status reporting.
pub fn summarize(config: &Value, secrets: &SecretProfileStore) -> Value {
    let channels: Vec<&str> = config
        .get("channels")
        .and_then(Value::as_object)
        .map(|channels| {
            channels
                .iter()
                .filter(|(_, c)| c.get("enabled").and_then(Value::as_bool) != Some(false))
                .map(|(name, _)| name.as_str())
                .collect()
        })
        .unwrap_or_default();

    let model = get_path(config, &["agents", "defaults", "model", "primary"])
        .or_else(|| get_path(config, &["agents", "defaults", "model"]))
        .and_then(Value::as_str);

    let mut profiles = Map::new();
    if let Some(existing) = get_path(config, AUTH_PROFILES_PATH).and_then(Value::as_object) {
        for (key, entry) in existing {
            profiles.insert(
                key.clone(),
                json!({
                    "provider": entry.get("provider").cloned().unwrap_or(Value::Null),
                    "mode": entry.get("mode").cloned().unwrap_or(Value::Null),
                    "hasCredential": false,
                }),
            );
        }
    }
    for (key, secret) in &secrets.profiles {
        let entry = profiles.entry(key.clone()).or_insert_with(|| {
            json!({
                "provider": secret.provider,
                "mode": normalize_mode(&secret.kind),
            })
        });
        entry["hasCredential"] = Value::Bool(secret.has_credential());
    }

    json!({
        "channels": channels,
        "model": model,
        "gatewayPort": get_path(config, &["gateway", "port"]).cloned().unwrap_or(Value::Null),
        "profiles": profiles,
    })
}
