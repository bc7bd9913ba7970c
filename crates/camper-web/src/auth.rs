use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use camper_storage::{StoreError, UserDirectory};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id as a decimal string.
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// HS256 signing and verification keys for admin bearer tokens.
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(&self, user_id: i64, ttl_secs: i64) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (now + Duration::seconds(ttl_secs)).timestamp(),
            iat: now.timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(AuthError::Signing)
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map_err(AuthError::InvalidToken)?;
        Ok(data.claims)
    }
}

/// The verified caller, available to admin handlers via `Extension`.
#[derive(Debug, Clone)]
pub struct AdminIdentity {
    pub user_id: i64,
    pub email: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),
    #[error("token subject {0} is not a user id")]
    BadSubject(String),
    #[error("user {0} is not an admin")]
    Forbidden(i64),
    #[error("signing token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::MissingToken | AuthError::InvalidToken(_) | AuthError::BadSubject(_) => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthError::Signing(_) | AuthError::Store(_) => {
                error!(error = %self, "admin authentication failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match status {
            StatusCode::UNAUTHORIZED => "unauthorized",
            StatusCode::FORBIDDEN => "forbidden",
            _ => "authentication failed",
        };
        (status, Json(json!({ "error": message, "details": self.to_string() }))).into_response()
    }
}

fn bearer_token(req: &Request) -> Option<&str> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Admits the request only if the bearer token names a user whose stored role is `admin`.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = bearer_token(&req).ok_or(AuthError::MissingToken)?;
    let claims = state.jwt.validate(token)?;
    let user_id: i64 = claims
        .sub
        .parse()
        .map_err(|_| AuthError::BadSubject(claims.sub.clone()))?;

    // Role comes from the database, never from the token.
    let user = {
        let mut store = state.stores.acquire().await?;
        store.find_user(user_id).await?
    };
    let Some(user) = user.filter(|u| u.is_admin()) else {
        warn!(user_id, "non-admin caller rejected");
        return Err(AuthError::Forbidden(user_id));
    };

    debug!(user_id, "admin authenticated");
    req.extensions_mut().insert(AdminIdentity {
        user_id: user.id,
        email: user.email,
    });
    Ok(next.run(req).await)
}
