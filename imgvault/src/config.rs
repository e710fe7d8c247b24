use std::env;
use std::fmt;
use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub port: u16,
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub fs_root: Option<PathBuf>,
    /// Namespace blobs per repository; cross-repo mounts degrade to
    /// uploads in this mode.
    #[serde(default)]
    pub split_repositories: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    Memory,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// When false (the default) the registry is open.
    pub enabled: bool,
    /// Token realm advertised in the WWW-Authenticate challenge. Defaults
    /// to the built-in /token endpoint.
    pub realm: Option<String>,
    pub service: String,
    pub issuer: String,
    pub signing_key: String,
    pub token_expiration_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            realm: None,
            service: "imgvault".to_string(),
            issuer: "imgvault-auth".to_string(),
            signing_key: "insecure-dev-key".to_string(),
            token_expiration_secs: 3600,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "dev".into());

        let mut builder = Config::builder()
            // Start with default values
            .set_default("port", 8080)?
            .set_default("storage.backend", "fs")?
            .set_default("storage.fs_root", "./data")?
            .set_default("storage.split_repositories", false)?
            // Add configuration from files
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add environment variables with prefix IMGVAULT_
            .add_source(Environment::with_prefix("IMGVAULT").separator("_"));

        // A bare PORT variable wins, for container platforms that set it.
        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("port", port)?;
        }

        builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            storage: StorageConfig {
                backend: StorageBackend::Fs,
                fs_root: Some(PathBuf::from("./data")),
                split_repositories: false,
            },
            auth: AuthSettings::default(),
        }
    }
}

impl AppConfig {
    /// An in-memory configuration for tests and ephemeral registries.
    pub fn in_memory() -> Self {
        Self {
            port: 0,
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                fs_root: None,
                split_repositories: false,
            },
            auth: AuthSettings::default(),
        }
    }
}
