use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::models::AccountContext;

/// Claims expected inside the JWT for authenticated accounts.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject - the account's UUID as a string.
    pub sub: String,
    pub exp: usize,
}

/// Key material for validating bearer tokens.
#[derive(Clone)]
pub struct AuthKeys {
    decoding: Arc<DecodingKey>,
}

impl AuthKeys {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            decoding: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
        }
    }

    /// Decodes an HS256 token into the account it was issued for.
    pub fn verify(&self, token: &str) -> Option<AccountContext> {
        let claims = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map_err(|e| debug!("Rejected bearer token: {}", e))
            .ok()?
            .claims;
        Uuid::parse_str(&claims.sub).ok().map(AccountContext::new)
    }
}

/// Signs a token for `account_id`, valid for `ttl`.
pub fn issue_token(secret: &str, account_id: Uuid, ttl: Duration) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: account_id.to_string(),
        exp: (Utc::now() + ttl).timestamp().max(0) as usize,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Middleware to validate a Bearer JWT in the `Authorization` header.
///
/// On success the [`AccountContext`] is stored in the request extensions
/// for downstream handlers; on failure a `401` is returned.
pub async fn jwt_middleware(
    State(keys): State<AuthKeys>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let account = keys.verify(token).ok_or(StatusCode::UNAUTHORIZED)?;
    req.extensions_mut().insert(account);

    Ok(next.run(req).await)
}
