//! Bearer-token gate for protected routes, plus token issuance.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::{AuthConfig, AuthMode};
use crate::error::AppError;
use crate::AppState;

/// The only algorithm the gate accepts or issues.
pub const TOKEN_ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthRejection {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("malformed Authorization header: {0}")]
    MalformedHeader(&'static str),
    #[error("token rejected: {0}")]
    InvalidToken(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Authorized,
    Rejected(AuthRejection),
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token issuance is unavailable while authorization is disabled")]
    GateDisabled,
    #[error("signing failed: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

pub struct AuthGate {
    keys: Option<(EncodingKey, DecodingKey)>,
    validation: Validation,
    config: AuthConfig,
}

impl AuthGate {
    pub fn new(config: AuthConfig) -> Self {
        let keys = match &config.mode {
            AuthMode::Enforced { secret } => Some((
                EncodingKey::from_secret(secret.as_bytes()),
                DecodingKey::from_secret(secret.as_bytes()),
            )),
            AuthMode::Disabled => None,
        };

        let mut validation = Validation::new(TOKEN_ALGORITHM);
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation.leeway = config.clock_skew.as_secs();

        Self {
            keys,
            validation,
            config,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Whether a request with this method and path has to pass the gate.
    pub fn guards(&self, method: &Method, path: &str) -> bool {
        let is_read = matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS);
        if path.starts_with("/api/restaurants") {
            return !is_read || self.config.protect_reads;
        }
        if path == "/api/sync" || path.starts_with("/api/persist") {
            return self.config.protect_sync;
        }
        false
    }

    /// Decides once per request; the caller turns the decision into one response.
    pub fn authorize(&self, header: Option<&HeaderValue>) -> AuthDecision {
        let Some((_, decoding)) = &self.keys else {
            return AuthDecision::Authorized;
        };

        let token = match bearer_token(header) {
            Ok(token) => token,
            Err(rejection) => return AuthDecision::Rejected(rejection),
        };

        match decode::<Claims>(token, decoding, &self.validation) {
            Ok(_) => AuthDecision::Authorized,
            Err(err) => AuthDecision::Rejected(AuthRejection::InvalidToken(err.to_string())),
        }
    }

    pub fn issue_token(&self, subject: &str) -> Result<String, TokenError> {
        self.issue_token_at(subject, Utc::now())
    }

    pub fn issue_token_at(&self, subject: &str, issued_at: DateTime<Utc>) -> Result<String, TokenError> {
        let Some((encoding, _)) = &self.keys else {
            return Err(TokenError::GateDisabled);
        };
        let claims = claims_for(subject, issued_at, self.config.token_ttl);
        Ok(encode(&Header::new(TOKEN_ALGORITHM), &claims, encoding)?)
    }
}

fn claims_for(subject: &str, issued_at: DateTime<Utc>, ttl: Duration) -> Claims {
    let iat = issued_at.timestamp();
    let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    Claims {
        sub: subject.to_string(),
        iat,
        exp: iat.saturating_add(ttl),
    }
}

fn bearer_token(header: Option<&HeaderValue>) -> Result<&str, AuthRejection> {
    let header = header.ok_or(AuthRejection::MissingHeader)?;
    let header = header
        .to_str()
        .map_err(|_| AuthRejection::MalformedHeader("not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or(AuthRejection::MalformedHeader("expected `Bearer <token>`"))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthRejection::MalformedHeader("scheme must be `Bearer`"));
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthRejection::MalformedHeader("empty bearer token"));
    }
    Ok(token)
}

pub(crate) async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.gate.guards(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    match state.gate.authorize(request.headers().get(AUTHORIZATION)) {
        AuthDecision::Authorized => next.run(request).await,
        AuthDecision::Rejected(reason) => {
            warn!(
                method = %request.method(),
                path = request.uri().path(),
                %reason,
                "request rejected by authorization gate"
            );
            AppError::unauthorized(reason.to_string()).into_response()
        }
    }
}
