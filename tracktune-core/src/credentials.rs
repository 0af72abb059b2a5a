//! Credential storage and API key resolution for tracking services.
//!
//! Keys are resolved in order: explicit config value, key file, environment
//! variable, then a [`CredentialStore`]:
//! - `KeyringCredentialStore`: the OS-native credential store (macOS Keychain,
//!   Windows Credential Manager, Linux Secret Service).
//! - `InMemoryCredentialStore`: in-memory store for testing.

use crate::error::TrackingError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Errors from credential storage operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential not found for {service}:{account}")]
    NotFound { service: String, account: String },

    #[error("Failed to store credential: {message}")]
    StoreFailed { message: String },

    #[error("Failed to delete credential: {message}")]
    DeleteFailed { message: String },

    #[error("Keyring backend not available: {message}")]
    BackendUnavailable { message: String },
}

/// Trait for credential storage backends.
pub trait CredentialStore: Send + Sync {
    /// Store an API key for the given tracker.
    fn store_key(&self, tracker: &str, api_key: &str) -> Result<(), CredentialError>;

    /// Retrieve the API key for the given tracker.
    fn get_key(&self, tracker: &str) -> Result<String, CredentialError>;

    fn delete_key(&self, tracker: &str) -> Result<(), CredentialError>;

    fn has_key(&self, tracker: &str) -> bool {
        self.get_key(tracker).is_ok()
    }
}

const SERVICE: &str = "tracktune";

/// Account name under which a tracker's key is stored.
pub fn account_name(tracker: &str) -> String {
    format!("tracker:{tracker}")
}

/// OS-native credential store using the `keyring` crate.
///
/// Stores credentials under service `"tracktune"` with account names
/// formatted as `"tracker:{name}"`.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE.to_string(),
        }
    }

    fn entry(&self, tracker: &str) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(&self.service, &account_name(tracker)).map_err(|e| {
            CredentialError::BackendUnavailable {
                message: e.to_string(),
            }
        })
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn store_key(&self, tracker: &str, api_key: &str) -> Result<(), CredentialError> {
        self.entry(tracker)?
            .set_password(api_key)
            .map_err(|e| CredentialError::StoreFailed {
                message: e.to_string(),
            })
    }

    fn get_key(&self, tracker: &str) -> Result<String, CredentialError> {
        self.entry(tracker)?.get_password().map_err(|e| match e {
            keyring::Error::NoEntry => CredentialError::NotFound {
                service: self.service.clone(),
                account: account_name(tracker),
            },
            other => CredentialError::StoreFailed {
                message: other.to_string(),
            },
        })
    }

    fn delete_key(&self, tracker: &str) -> Result<(), CredentialError> {
        self.entry(tracker)?
            .delete_credential()
            .map_err(|e| CredentialError::DeleteFailed {
                message: e.to_string(),
            })
    }
}

/// In-memory credential store for testing.
pub struct InMemoryCredentialStore {
    store: Mutex<HashMap<String, String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
        }
    }

    fn poisoned() -> CredentialError {
        CredentialError::BackendUnavailable {
            message: "credential map poisoned".to_string(),
        }
    }
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn store_key(&self, tracker: &str, api_key: &str) -> Result<(), CredentialError> {
        self.store
            .lock()
            .map_err(|_| Self::poisoned())?
            .insert(account_name(tracker), api_key.to_string());
        Ok(())
    }

    fn get_key(&self, tracker: &str) -> Result<String, CredentialError> {
        let account = account_name(tracker);
        self.store
            .lock()
            .map_err(|_| Self::poisoned())?
            .get(&account)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound {
                service: SERVICE.to_string(),
                account,
            })
    }

    fn delete_key(&self, tracker: &str) -> Result<(), CredentialError> {
        self.store
            .lock()
            .map_err(|_| Self::poisoned())?
            .remove(&account_name(tracker));
        Ok(())
    }
}

/// Where to look for a tracker's API key.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeySources<'a> {
    pub explicit: Option<&'a str>,
    /// File whose first non-empty line is the key.
    pub key_file: Option<&'a Path>,
    pub env_var: Option<&'a str>,
}

/// Look up the API key for `tracker`, returning `None` when no source has one.
///
/// A configured key file that cannot be read is an error rather than a
/// fallthrough to the next source.
pub fn find_api_key(
    tracker: &str,
    sources: &KeySources<'_>,
    store: Option<&dyn CredentialStore>,
) -> Result<Option<String>, TrackingError> {
    if let Some(key) = sources.explicit.map(str::trim).filter(|k| !k.is_empty()) {
        return Ok(Some(key.to_string()));
    }

    if let Some(path) = sources.key_file {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrackingError::missing_credential(
                tracker,
                format!("cannot read api key file {}: {e}", path.display()),
            )
        })?;
        let key = content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| {
                TrackingError::missing_credential(
                    tracker,
                    format!("api key file {} is empty", path.display()),
                )
            })?;
        debug!(tracker, path = %path.display(), "Using API key from file");
        return Ok(Some(key.to_string()));
    }

    if let Some(var) = sources.env_var {
        if let Some(key) = std::env::var(var)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
        {
            debug!(tracker, env_var = var, "Using API key from environment");
            return Ok(Some(key));
        }
    }

    if let Some(store) = store {
        if let Ok(key) = store.get_key(tracker) {
            debug!(tracker, "Using API key from credential store");
            return Ok(Some(key));
        }
    }

    Ok(None)
}

/// Resolve the API key for `tracker`, failing when no source has one.
pub fn resolve_api_key(
    tracker: &str,
    sources: &KeySources<'_>,
    store: Option<&dyn CredentialStore>,
) -> Result<String, TrackingError> {
    find_api_key(tracker, sources, store)?.ok_or_else(|| {
        let hint = sources
            .env_var
            .map(|v| format!("api key (set {v} or configure api_key)"))
            .unwrap_or_else(|| "api key".to_string());
        TrackingError::missing_credential(tracker, hint)
    })
}
