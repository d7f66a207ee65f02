//! On-disk config store.
//!
//! Two JSON documents live side by side in the sandbox state directory:
//!
//! ```text
//! ~/.openclaw/
//! ├── openclaw.json                        MainConfig (sanitized, no credentials)
//! └── agents/main/agent/auth-profiles.json SecretProfileStore (credentials)
//! ```
//!
//! Both are written temp-file-then-rename so a reader never observes a
//! partially written document. Read-modify-write cycles are serialized with
//! [`ConfigStore::lock`]; atomic rename alone does not prevent lost updates.

mod profiles;

pub use profiles::{
    AuthProfile, DEFAULT_PROFILE_LABEL, PROFILE_STORE_VERSION, SecretProfileStore, profile_key,
    provider_of_key,
};

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::StoreError;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Access to the main config and secret profile documents of one sandbox.
pub struct ConfigStore {
    config_path: PathBuf,
    profiles_path: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(config_path: PathBuf, profiles_path: PathBuf) -> Self {
        Self {
            config_path,
            profiles_path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn profiles_path(&self) -> &Path {
        &self.profiles_path
    }

    /// Create both documents if absent. Returns `true` if anything was created.
    pub fn ensure_initialized(&self) -> Result<bool, StoreError> {
        let mut created = false;
        if !self.config_path.exists() {
            write_json_atomic(&self.config_path, &Value::Object(Default::default()), false)?;
            tracing::info!(path = %self.config_path.display(), "Created empty main config");
            created = true;
        }
        if !self.profiles_path.exists() {
            write_json_atomic(&self.profiles_path, &SecretProfileStore::default(), true)?;
            tracing::info!(path = %self.profiles_path.display(), "Created empty auth profile store");
            created = true;
        }
        Ok(created)
    }

    /// Acquire the read-modify-write lock.
    ///
    /// Hold the guard across read → merge → write so two concurrent updates
    /// cannot interleave.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Read the main config. A missing file reads as `{}`.
    pub fn read_config(&self) -> Result<Value, StoreError> {
        let value: Option<Value> = read_json(&self.config_path)?;
        match value {
            None => Ok(Value::Object(Default::default())),
            Some(v @ Value::Object(_)) => Ok(v),
            Some(_) => Err(StoreError::NotAnObject {
                path: self.config_path.clone(),
            }),
        }
    }

    /// Read the secret profile store. A missing file reads as empty.
    pub fn read_profiles(&self) -> Result<SecretProfileStore, StoreError> {
        Ok(read_json(&self.profiles_path)?.unwrap_or_default())
    }

    pub fn write_config(&self, config: &Value) -> Result<(), StoreError> {
        if !config.is_object() {
            return Err(StoreError::NotAnObject {
                path: self.config_path.clone(),
            });
        }
        write_json_atomic(&self.config_path, config, false)
    }

    pub fn write_profiles(&self, profiles: &SecretProfileStore) -> Result<(), StoreError> {
        write_json_atomic(&self.profiles_path, profiles, true)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if data.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&data)
        .map(Some)
        .map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Serialize `value` to `path` via a sibling temp file and rename.
///
/// `private` restricts the file to owner read/write on unix.
pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    private: bool,
) -> Result<(), StoreError> {
    let io_err = |source: std::io::Error| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err)?;

    let json = serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let tmp_path = parent.join(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let result = (|| {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        if private {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        #[cfg(not(unix))]
        let _ = private;

        let mut file = options.open(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(io_err(e));
    }
    Ok(())
}
