use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use reqwest::{Method, Response, StatusCode, header};
use serde::Deserialize;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::authn::{AuthConfig, Authenticator};
use crate::error::{Error, Result};
use crate::reference::Repository;

const DEFAULT_USER_AGENT: &str = concat!("ocikit/", env!("CARGO_PKG_VERSION"));
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(1);
// Registries that omit expires_in mean 60 seconds, per the token spec.
const DEFAULT_TOKEN_TTL: u64 = 60;

/// One entry of a distribution-spec error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

/// A structured error response from a registry.
#[derive(Debug)]
pub struct TransportError {
    pub status: u16,
    pub url: String,
    pub errors: Vec<ErrorInfo>,
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        self.status == 404
            || self
                .errors
                .iter()
                .any(|e| e.code.ends_with("_UNKNOWN") || e.code == "NOT_FOUND")
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }

    async fn from_response(resp: Response) -> TransportError {
        let status = resp.status().as_u16();
        let url = resp.url().to_string();
        let body = resp.text().await.unwrap_or_default();
        #[derive(Deserialize)]
        struct Body {
            errors: Vec<ErrorInfo>,
        }
        let errors = serde_json::from_str::<Body>(&body)
            .map(|b| b.errors)
            .unwrap_or_else(|_| {
                if body.is_empty() {
                    Vec::new()
                } else {
                    vec![ErrorInfo {
                        code: String::new(),
                        message: body.chars().take(200).collect(),
                        detail: None,
                    }]
                }
            });
        TransportError { status, url, errors }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unexpected status {} from {}", self.status, self.url)?;
        for e in &self.errors {
            write!(f, "; {}: {}", e.code, e.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransportError {}

/// The authentication scheme a registry advertised on ping.
#[derive(Debug, Clone)]
enum Challenge {
    Open,
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    scopes_key: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
    #[allow(dead_code)]
    issued_at: Option<String>,
}

/// An authenticated HTTP gateway to a single registry.
///
/// Handles the `/v2/` ping and challenge discovery, bearer token exchange
/// (with scope escalation), retries of idempotent requests, and error
/// classification. Safe for concurrent use; the token cache is shared.
pub struct Transport {
    client: reqwest::Client,
    base: String,
    auth: Arc<dyn Authenticator>,
    user_agent: String,
    challenge: OnceCell<Challenge>,
    scopes: RwLock<Vec<String>>,
    token: Mutex<Option<CachedToken>>,
}

impl Transport {
    pub fn new(
        repo: &Repository,
        auth: Arc<dyn Authenticator>,
        scopes: Vec<String>,
        user_agent: Option<String>,
    ) -> Result<Arc<Self>> {
        let scheme = if repo.is_insecure() { "http" } else { "https" };
        let mut builder = reqwest::Client::builder();
        if repo.is_insecure() {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;
        Ok(Arc::new(Self {
            client,
            base: format!("{scheme}://{}", repo.registry()),
            auth,
            user_agent: user_agent.unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            challenge: OnceCell::new(),
            scopes: RwLock::new(scopes),
            token: Mutex::new(None),
        }))
    }

    /// `scheme://host` for this registry.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Resolve a Location header value, which may be absolute or host-relative.
    pub fn resolve_location(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}{}", self.base, location)
        }
    }

    /// Add a scope to the set used for token exchange (e.g. a mount source
    /// repository's pull scope).
    pub fn add_scope(&self, scope: String) {
        let mut scopes = self.scopes.write().expect("scope lock poisoned");
        if !scopes.contains(&scope) {
            scopes.push(scope);
        }
    }

    fn scopes_key(&self) -> String {
        self.scopes.read().expect("scope lock poisoned").join(" ")
    }

    /// Send a request, authenticating and retrying as needed. `accept`
    /// lists the statuses the caller treats as success; anything else is
    /// classified into a `TransportError`.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        build: impl Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
        accept: &[StatusCode],
    ) -> Result<Response> {
        let idempotent = method == Method::GET || method == Method::HEAD;
        let mut escalated = false;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let rb = build(
                self.client
                    .request(method.clone(), url)
                    .header(header::USER_AGENT, &self.user_agent),
            );
            let rb = self.authorize(rb).await?;

            let resp = match rb.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    if idempotent && attempt < MAX_ATTEMPTS {
                        warn!(url, attempt, error = %e, "transient transport error, retrying");
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    return Err(e.into());
                }
            };

            let status = resp.status();
            if accept.contains(&status) {
                return Ok(resp);
            }

            // One scope escalation per request: a 401 carrying a broader
            // scope unions it in and refetches the token.
            if status == StatusCode::UNAUTHORIZED && !escalated {
                if let Some(scope) = challenge_scope(resp.headers()) {
                    debug!(url, scope, "escalating token scope");
                    self.add_scope(scope);
                    self.token.lock().await.take();
                    escalated = true;
                    continue;
                }
                return Err(Error::Auth(format!(
                    "unauthorized after token exchange: {}",
                    TransportError::from_response(resp).await
                )));
            }

            let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            if retryable && idempotent && attempt < MAX_ATTEMPTS {
                let delay = retry_after(resp.headers()).unwrap_or_else(|| backoff(attempt));
                warn!(url, %status, attempt, "retrying after server error");
                tokio::time::sleep(delay).await;
                continue;
            }

            return Err(TransportError::from_response(resp).await.into());
        }
    }

    /// Attach the Authorization header appropriate for this registry's
    /// challenge.
    async fn authorize(&self, rb: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let challenge = self.ping().await?;
        let auth = self.auth.authorization()?;
        match challenge {
            Challenge::Open => Ok(match auth.header() {
                Some(h) => rb.header(header::AUTHORIZATION, h),
                None => rb,
            }),
            Challenge::Basic => match auth.header() {
                Some(h) => Ok(rb.header(header::AUTHORIZATION, h)),
                None => Ok(rb),
            },
            Challenge::Bearer { realm, service } => {
                let token = self.bearer_token(&auth, &realm, service.as_deref()).await?;
                Ok(rb.header(header::AUTHORIZATION, format!("Bearer {token}")))
            }
        }
    }

    /// `GET /v2/` once per transport; the parsed challenge is cached.
    async fn ping(&self) -> Result<Challenge> {
        self.challenge
            .get_or_try_init(|| async {
                let url = format!("{}/v2/", self.base);
                let resp = self
                    .client
                    .get(&url)
                    .header(header::USER_AGENT, &self.user_agent)
                    .send()
                    .await?;
                match resp.status() {
                    StatusCode::OK => Ok(Challenge::Open),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                        let header_value = resp
                            .headers()
                            .get(header::WWW_AUTHENTICATE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        Ok(parse_challenge(&header_value))
                    }
                    _ => Err(Error::from(TransportError::from_response(resp).await)),
                }
            })
            .await
            .cloned()
    }

    /// Fetch (or reuse) a bearer token for the current scope set.
    async fn bearer_token(
        &self,
        auth: &AuthConfig,
        realm: &str,
        service: Option<&str>,
    ) -> Result<String> {
        // A registry token from the authenticator short-circuits exchange.
        if let Some(token) = &auth.registry_token {
            return Ok(token.clone());
        }

        let scopes_key = self.scopes_key();
        let mut cached = self.token.lock().await;
        if let Some(tok) = cached.as_ref() {
            if tok.scopes_key == scopes_key && tok.expires_at > Instant::now() {
                return Ok(tok.token.clone());
            }
        }

        let scopes: Vec<String> = self.scopes.read().expect("scope lock poisoned").clone();
        let resp = if let Some(identity_token) = &auth.identity_token {
            // OAuth-style refresh token exchange.
            let mut form = vec![
                ("grant_type".to_string(), "refresh_token".to_string()),
                ("refresh_token".to_string(), identity_token.clone()),
                ("client_id".to_string(), "ocikit".to_string()),
            ];
            if let Some(service) = service {
                form.push(("service".to_string(), service.to_string()));
            }
            if !scopes.is_empty() {
                form.push(("scope".to_string(), scopes.join(" ")));
            }
            self.client
                .post(realm)
                .header(header::USER_AGENT, &self.user_agent)
                .form(&form)
                .send()
                .await?
        } else {
            let mut url = reqwest::Url::parse(realm)
                .map_err(|e| Error::Auth(format!("invalid token realm {realm:?}: {e}")))?;
            if let Some(service) = service {
                url.query_pairs_mut().append_pair("service", service);
            }
            for scope in &scopes {
                url.query_pairs_mut().append_pair("scope", scope);
            }
            let mut rb = self
                .client
                .get(url)
                .header(header::USER_AGENT, &self.user_agent);
            if let Some(h) = auth.header() {
                rb = rb.header(header::AUTHORIZATION, h);
            }
            rb.send().await?
        };

        if !resp.status().is_success() {
            return Err(Error::Auth(format!(
                "token exchange failed: {}",
                TransportError::from_response(resp).await
            )));
        }
        let body: TokenResponse = resp.json().await?;
        let token = body
            .token
            .or(body.access_token)
            .ok_or_else(|| Error::Auth("token response carried no token".to_string()))?;
        let ttl = body.expires_in.unwrap_or(DEFAULT_TOKEN_TTL).max(DEFAULT_TOKEN_TTL);
        // Refresh a little early rather than racing expiry.
        let expires_at = Instant::now() + Duration::from_secs(ttl.saturating_sub(5));
        *cached = Some(CachedToken {
            token: token.clone(),
            scopes_key,
            expires_at,
        });
        Ok(token)
    }
}

fn backoff(attempt: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(BACKOFF_CAP)
}

fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Parse a `WWW-Authenticate` header into a challenge.
fn parse_challenge(value: &str) -> Challenge {
    let lower = value.to_ascii_lowercase();
    if lower.starts_with("basic") {
        return Challenge::Basic;
    }
    if !lower.starts_with("bearer") {
        return Challenge::Open;
    }
    let params = parse_challenge_params(&value["bearer".len()..]);
    match params.iter().find(|(k, _)| k == "realm") {
        Some((_, realm)) => Challenge::Bearer {
            realm: realm.clone(),
            service: params
                .iter()
                .find(|(k, _)| k == "service")
                .map(|(_, v)| v.clone()),
        },
        // A bearer challenge without a realm cannot be satisfied; treat the
        // registry as open and let it reject us.
        None => Challenge::Open,
    }
}

/// Split `k="v",k2="v2"` pairs, keeping commas inside quoted values intact
/// (scope values contain commas: `repository:foo:pull,push`).
fn parse_challenge_params(s: &str) -> Vec<(String, String)> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in s.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
        .iter()
        .filter_map(|part| {
            let (key, value) = part.trim().split_once('=')?;
            Some((
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect()
}

/// The scope parameter of a 401 response's challenge, used for escalation.
fn challenge_scope(headers: &header::HeaderMap) -> Option<String> {
    let value = headers.get(header::WWW_AUTHENTICATE)?.to_str().ok()?;
    let lower = value.to_ascii_lowercase();
    if !lower.starts_with("bearer") {
        return None;
    }
    parse_challenge_params(&value["bearer".len()..])
        .into_iter()
        .find(|(k, _)| k == "scope")
        .map(|(_, v)| v)
}
