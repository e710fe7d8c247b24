use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// The credential material an authenticator yields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub identity_token: Option<String>,
    pub registry_token: Option<String>,
}

impl AuthConfig {
    pub fn is_anonymous(&self) -> bool {
        self == &AuthConfig::default()
    }

    /// The Authorization header value for direct (non-token-exchange) use,
    /// if the material supports one.
    pub fn header(&self) -> Option<String> {
        if let Some(token) = &self.registry_token {
            return Some(format!("Bearer {token}"));
        }
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some(format!("Basic {}", BASE64.encode(format!("{u}:{p}")))),
            _ => None,
        }
    }
}

/// Something that can produce credentials for a registry.
pub trait Authenticator: Send + Sync {
    fn authorization(&self) -> Result<AuthConfig>;
}

/// No credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl Authenticator for Anonymous {
    fn authorization(&self) -> Result<AuthConfig> {
        Ok(AuthConfig::default())
    }
}

/// Fixed username/password.
#[derive(Debug, Clone)]
pub struct Basic {
    pub username: String,
    pub password: String,
}

impl Authenticator for Basic {
    fn authorization(&self) -> Result<AuthConfig> {
        Ok(AuthConfig {
            username: Some(self.username.clone()),
            password: Some(self.password.clone()),
            ..Default::default()
        })
    }
}

/// A fixed registry token, used verbatim as `Bearer <token>`.
#[derive(Debug, Clone)]
pub struct Bearer {
    pub token: String,
}

impl Authenticator for Bearer {
    fn authorization(&self) -> Result<AuthConfig> {
        Ok(AuthConfig {
            registry_token: Some(self.token.clone()),
            ..Default::default()
        })
    }
}

/// Wraps an authenticator and re-queries it only after `ttl` has elapsed,
/// so expensive lookups (credential helpers) are not run per request.
pub struct Refreshing {
    inner: Arc<dyn Authenticator>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, AuthConfig)>>,
}

impl Refreshing {
    pub fn new(inner: Arc<dyn Authenticator>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cached: Mutex::new(None),
        }
    }
}

impl Authenticator for Refreshing {
    fn authorization(&self) -> Result<AuthConfig> {
        let mut cached = self.cached.lock().expect("authn cache lock poisoned");
        if let Some((at, cfg)) = cached.as_ref() {
            if at.elapsed() < self.ttl {
                return Ok(cfg.clone());
            }
        }
        let cfg = self.inner.authorization()?;
        *cached = Some((Instant::now(), cfg.clone()));
        Ok(cfg)
    }
}

/// Resolves an authenticator for a registry host.
pub trait Keychain: Send + Sync {
    fn resolve(&self, registry: &str) -> Result<Arc<dyn Authenticator>>;
}

/// A keychain with a fixed answer for every registry.
pub struct StaticKeychain {
    auth: Arc<dyn Authenticator>,
}

impl StaticKeychain {
    pub fn new(auth: Arc<dyn Authenticator>) -> Self {
        Self { auth }
    }
}

impl Keychain for StaticKeychain {
    fn resolve(&self, _registry: &str) -> Result<Arc<dyn Authenticator>> {
        Ok(self.auth.clone())
    }
}

/// Tries keychains in order; the first non-anonymous answer wins.
pub struct MultiKeychain {
    keychains: Vec<Arc<dyn Keychain>>,
}

impl MultiKeychain {
    pub fn new(keychains: Vec<Arc<dyn Keychain>>) -> Self {
        Self { keychains }
    }
}

impl Keychain for MultiKeychain {
    fn resolve(&self, registry: &str) -> Result<Arc<dyn Authenticator>> {
        for kc in &self.keychains {
            let auth = kc.resolve(registry)?;
            if !auth.authorization()?.is_anonymous() {
                return Ok(auth);
            }
        }
        Ok(Arc::new(Anonymous))
    }
}

// Wire shape of ~/.docker/config.json, reduced to the fields we read.
#[derive(Debug, Deserialize, Default)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
    #[serde(rename = "credHelpers", default)]
    cred_helpers: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct DockerAuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
    #[serde(rename = "identitytoken")]
    identity_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelperOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// The keychain the docker CLI uses: `config.json` auth entries plus
/// credential-helper binaries. Lookup misses degrade to anonymous.
#[derive(Debug, Default)]
pub struct DefaultKeychain;

impl DefaultKeychain {
    fn config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        dirs::home_dir().map(|h| h.join(".docker").join("config.json"))
    }

    fn load_config() -> Result<DockerConfig> {
        let Some(path) = Self::config_path() else {
            return Ok(DockerConfig::default());
        };
        match std::fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DockerConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run `docker-credential-<helper> get` with the registry on stdin.
    /// A missing helper binary is a miss, not an error; malformed helper
    /// output is an error.
    fn run_helper(helper: &str, registry: &str) -> Result<Option<AuthConfig>> {
        let binary = format!("docker-credential-{helper}");
        let child = Command::new(&binary)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match child {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(helper = %binary, "credential helper not installed");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(registry.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            // Helpers exit nonzero with "credentials not found" on a miss.
            debug!(helper = %binary, registry, "credential helper returned no credentials");
            return Ok(None);
        }
        let parsed: HelperOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            Error::Auth(format!("malformed output from {binary}: {e}"))
        })?;
        Ok(Some(AuthConfig {
            username: Some(parsed.username),
            password: Some(parsed.secret),
            ..Default::default()
        }))
    }

    fn entry_to_auth(entry: &DockerAuthEntry) -> Result<AuthConfig> {
        if let Some(token) = &entry.identity_token {
            return Ok(AuthConfig {
                identity_token: Some(token.clone()),
                ..Default::default()
            });
        }
        if let (Some(u), Some(p)) = (&entry.username, &entry.password) {
            return Ok(AuthConfig {
                username: Some(u.clone()),
                password: Some(p.clone()),
                ..Default::default()
            });
        }
        if let Some(auth) = &entry.auth {
            let decoded = BASE64
                .decode(auth)
                .map_err(|e| Error::Auth(format!("malformed auth entry: {e}")))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|e| Error::Auth(format!("malformed auth entry: {e}")))?;
            let (u, p) = decoded
                .split_once(':')
                .ok_or_else(|| Error::Auth("auth entry is not user:pass".to_string()))?;
            return Ok(AuthConfig {
                username: Some(u.to_string()),
                password: Some(p.to_string()),
                ..Default::default()
            });
        }
        Ok(AuthConfig::default())
    }
}

impl Keychain for DefaultKeychain {
    fn resolve(&self, registry: &str) -> Result<Arc<dyn Authenticator>> {
        let config = Self::load_config()?;

        // Per-registry helper beats the global store beats inline auths.
        if let Some(helper) = config.cred_helpers.get(registry) {
            if let Some(auth) = Self::run_helper(helper, registry)? {
                return Ok(Arc::new(Static(auth)));
            }
        }
        if let Some(store) = &config.creds_store {
            if let Some(auth) = Self::run_helper(store, registry)? {
                return Ok(Arc::new(Static(auth)));
            }
        }
        // Docker Hub credentials are stored under several aliases.
        let keys: &[&str] = if registry == crate::reference::DEFAULT_REGISTRY {
            &[
                "index.docker.io",
                "https://index.docker.io/v1/",
                "docker.io",
                "registry-1.docker.io",
            ]
        } else {
            &[]
        };
        for key in keys.iter().copied().chain(std::iter::once(registry)) {
            if let Some(entry) = config.auths.get(key) {
                let auth = Self::entry_to_auth(entry)?;
                if !auth.is_anonymous() {
                    return Ok(Arc::new(Static(auth)));
                }
            }
        }
        Ok(Arc::new(Anonymous))
    }
}

/// An authenticator over an already-resolved config.
pub struct Static(pub AuthConfig);

impl Authenticator for Static {
    fn authorization(&self) -> Result<AuthConfig> {
        Ok(self.0.clone())
    }
}
