//! Database Registry
//!
//! Saved database profiles the UI can refer to by id instead of sending a full
//! connection config with every call.
//!
//! # Storage
//! - `databases.json`: profiles plus an internal `credentialId` per profile
//! - `credentials.json`: passwords keyed by credential id
//!
//! Both files are rewritten atomically on every mutation. The in-memory mode keeps the
//! same semantics without touching disk (tests and `--ephemeral`).
//!
//! # Credentials
//! `credentialId` and passwords never leave this module: list/get return
//! [`DatabaseProfile`], which has neither. A profile may instead name an environment
//! variable (`passwordEnv`) that is read when a connection is resolved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{load_json, save_json, BridgeConfig};
use crate::engine::{ConnectionConfig, DatabaseType};
use crate::error::{BridgeError, Result};

/// Saved database profile as returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseProfile {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub engine: DatabaseType,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Port as sent by the UI: a number or a numeric string
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(i64),
    Text(String),
}

impl PortValue {
    /// Valid, non-zero port
    fn resolve(&self) -> Option<u16> {
        let raw = match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse().ok()?,
        };
        u16::try_from(raw).ok().filter(|p| *p != 0)
    }
}

/// Input for `addDatabase` and patch for `updateDatabase`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabasePayload {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub engine: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<PortValue>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssl: Option<bool>,
    #[serde(default)]
    pub password_env: Option<String>,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredDatabase {
    #[serde(flatten)]
    profile: DatabaseProfile,
    credential_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    databases: Vec<StoredDatabase>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    credentials: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
struct RegistryState {
    registry: RegistryFile,
    credentials: CredentialsFile,
}

impl RegistryState {
    fn position(&self, id: &str) -> Result<usize> {
        self.registry
            .databases
            .iter()
            .position(|d| d.profile.id == id)
            .ok_or_else(|| BridgeError::not_found("Database not found"))
    }
}

#[derive(Debug, Clone)]
enum Storage {
    Memory,
    Files { registry: PathBuf, credentials: PathBuf },
}

/// Database profile registry
pub struct DatabaseRegistry {
    storage: Storage,
    state: Mutex<RegistryState>,
}

fn require_id(id: &str) -> Result<&str> {
    let id = id.trim();
    if id.is_empty() {
        Err(BridgeError::invalid_input("Missing id"))
    } else {
        Ok(id)
    }
}

impl DatabaseRegistry {
    /// Registry that never touches disk
    #[must_use]
    pub fn in_memory() -> Self {
        Self { storage: Storage::Memory, state: Mutex::new(RegistryState::default()) }
    }

    /// Registry backed by the files under `config.data_dir` (or memory when ephemeral)
    pub fn open(config: &BridgeConfig) -> Result<Self> {
        if config.ephemeral {
            return Ok(Self::in_memory());
        }

        let registry_path = config.registry_path();
        let credentials_path = config.credentials_path();
        let state = RegistryState {
            registry: load_json(&registry_path)?,
            credentials: load_json(&credentials_path)?,
        };

        info!(
            path = %registry_path.display(),
            databases = state.registry.databases.len(),
            "database registry loaded"
        );

        Ok(Self {
            storage: Storage::Files { registry: registry_path, credentials: credentials_path },
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `next` to disk; a failed profile write puts the previous credentials back
    fn persist(&self, next: &RegistryState, previous: &RegistryState) -> Result<()> {
        match &self.storage {
            Storage::Memory => Ok(()),
            Storage::Files { registry, credentials } => {
                save_json(credentials, &next.credentials)?;
                if let Err(e) = save_json(registry, &next.registry) {
                    if let Err(restore) = save_json(credentials, &previous.credentials) {
                        error!(error = %restore, "could not restore credentials after a failed save");
                    }
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Apply `mutate` to a copy of the state and keep it only if it was persisted
    fn commit<T>(&self, mutate: impl FnOnce(&mut RegistryState) -> Result<T>) -> Result<T> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = mutate(&mut next)?;
        self.persist(&next, &guard)?;
        *guard = next;
        Ok(out)
    }

    /// Validate and save a new profile
    pub fn add_database(&self, payload: DatabasePayload) -> Result<DatabaseProfile> {
        let engine = payload.engine.as_deref().map(str::parse::<DatabaseType>).transpose();
        let is_sqlite = matches!(engine, Ok(Some(DatabaseType::SQLite)));

        let host = non_empty(payload.host.as_ref());
        if host.is_none() && !is_sqlite {
            return Err(BridgeError::missing_field("host"));
        }
        let user = non_empty(payload.user.as_ref());
        if user.is_none() && !is_sqlite {
            return Err(BridgeError::missing_field("user"));
        }
        let database =
            non_empty(payload.database.as_ref()).ok_or_else(|| BridgeError::missing_field("database"))?;
        let engine = engine?.ok_or_else(|| BridgeError::missing_field("type"))?;
        let name = non_empty(payload.name.as_ref()).ok_or_else(|| BridgeError::missing_field("name"))?;
        let port = match payload.port.as_ref().and_then(PortValue::resolve) {
            Some(port) => port,
            None if is_sqlite => 0,
            None => return Err(BridgeError::missing_field("port")),
        };

        let now = Utc::now();
        let profile = DatabaseProfile {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            engine,
            host: host.unwrap_or_default().to_string(),
            port,
            user: user.unwrap_or_default().to_string(),
            database: database.to_string(),
            ssl: payload.ssl.unwrap_or(false),
            password_env: non_empty(payload.password_env.as_ref()).map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        let credential_id = Uuid::new_v4().to_string();
        let password = payload.password;

        let saved = self.commit(|state| {
            if let Some(password) = password {
                state.credentials.credentials.insert(credential_id.clone(), password);
            }
            state
                .registry
                .databases
                .push(StoredDatabase { profile: profile.clone(), credential_id });
            Ok(profile)
        })?;

        info!(id = %saved.id, name = %saved.name, engine = %saved.engine, "database added");
        Ok(saved)
    }

    /// All profiles, without credentials
    #[must_use]
    pub fn list_databases(&self) -> Vec<DatabaseProfile> {
        self.lock().registry.databases.iter().map(|d| d.profile.clone()).collect()
    }

    pub fn get_database(&self, id: &str) -> Result<DatabaseProfile> {
        let id = require_id(id)?;
        let state = self.lock();
        let idx = state.position(id)?;
        Ok(state.registry.databases[idx].profile.clone())
    }

    /// Resolve a profile into a connection config, including its password
    pub fn get_database_connection(&self, id: &str) -> Result<ConnectionConfig> {
        let id = require_id(id)?;
        let state = self.lock();
        let stored = &state.registry.databases[state.position(id)?];
        let profile = &stored.profile;

        let password = match &profile.password_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                BridgeError::config_error(format!("Environment variable {var} not found for password"))
            })?),
            None => state.credentials.credentials.get(&stored.credential_id).cloned(),
        };

        let mut config = ConnectionConfig {
            engine: profile.engine,
            ssl: profile.ssl,
            password,
            ..ConnectionConfig::default()
        };

        if profile.engine == DatabaseType::SQLite {
            config.file = Some(PathBuf::from(&profile.database));
        } else {
            config.host = Some(profile.host.clone());
            config.port = Some(profile.port);
            config.user = Some(profile.user.clone());
            config.database = Some(profile.database.clone());
        }

        Ok(config)
    }

    /// Apply a patch to a saved profile
    pub fn update_database(&self, id: &str, patch: DatabasePayload) -> Result<DatabaseProfile> {
        let id = require_id(id)?.to_string();

        let engine = patch.engine.as_deref().map(str::parse::<DatabaseType>).transpose()?;
        let port = match &patch.port {
            Some(value) => Some(value.resolve().ok_or_else(|| BridgeError::invalid_input("Invalid port"))?),
            None => None,
        };

        let updated = self.commit(|state| {
            let idx = state.position(&id)?;
            let stored = &mut state.registry.databases[idx];
            let profile = &mut stored.profile;

            if let Some(name) = non_empty(patch.name.as_ref()) {
                profile.name = name.to_string();
            }
            if let Some(engine) = engine {
                profile.engine = engine;
            }
            if let Some(host) = non_empty(patch.host.as_ref()) {
                profile.host = host.to_string();
            }
            if let Some(port) = port {
                profile.port = port;
            }
            if let Some(user) = non_empty(patch.user.as_ref()) {
                profile.user = user.to_string();
            }
            if let Some(database) = non_empty(patch.database.as_ref()) {
                profile.database = database.to_string();
            }
            if let Some(ssl) = patch.ssl {
                profile.ssl = ssl;
            }
            if let Some(var) = &patch.password_env {
                profile.password_env = non_empty(Some(var)).map(str::to_string);
            }
            profile.updated_at = Utc::now();

            let profile = profile.clone();
            if let Some(password) = patch.password {
                let credential_id = stored.credential_id.clone();
                state.credentials.credentials.insert(credential_id, password);
            }
            Ok(profile)
        })?;

        info!(id = %updated.id, "database updated");
        Ok(updated)
    }

    /// Remove a profile and its credential
    pub fn delete_database(&self, id: &str) -> Result<()> {
        let id = require_id(id)?.to_string();

        self.commit(|state| {
            let idx = state.position(&id)?;
            let removed = state.registry.databases.remove(idx);
            state.credentials.credentials.remove(&removed.credential_id);
            Ok(())
        })?;

        info!(id = %id, "database deleted");
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().registry.databases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
