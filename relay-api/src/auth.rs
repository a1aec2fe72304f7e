use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, StatusCode},
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use relay_core::RelayContext;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing;

use crate::error::ApiError;

pub const SERVICE_ROLE: &str = "service_role";

/// Paths reachable without a bearer token. A valid token on these is still
/// attached to the request.
const PUBLIC_PATHS: &[&str] = &["/health", "/api/push/resubscribe"];

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub exp: usize,
}

/// Authenticated caller
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub role: Option<String>,
}

impl AuthenticatedUser {
    /// Trusted internal callers; the only ones allowed to broadcast.
    pub fn is_service_role(&self) -> bool {
        self.role.as_deref() == Some(SERVICE_ROLE)
    }

    /// Whether this caller may read or write rows owned by `user_id`.
    pub fn may_act_for(&self, user_id: &str) -> bool {
        self.is_service_role() || self.user_id == user_id
    }
}

/// Extract JWT token from Authorization header
fn extract_token(auth_header: Option<&str>) -> Option<String> {
    auth_header?
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
}

/// Generate a JWT for a user, optionally carrying a role
pub fn generate_token(
    user_id: &str,
    role: Option<&str>,
    secret: &str,
    expires_in_days: u64,
) -> Result<String, StatusCode> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .as_secs() as usize;

    let claims = Claims {
        sub: user_id.to_string(),
        role: role.map(str::to_string),
        exp: now + (expires_in_days * 24 * 60 * 60) as usize,
    };

    let encoding_key = EncodingKey::from_secret(secret.as_ref());

    encode(&Header::default(), &claims, &encoding_key)
        .map_err(|e| {
            tracing::error!("Failed to generate JWT token: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

/// Verify JWT token and extract the caller
pub fn verify_token(token: &str, secret: &str) -> Result<AuthenticatedUser, StatusCode> {
    let decoding_key = DecodingKey::from_secret(secret.as_ref());
    let validation = Validation::default();

    match decode::<Claims>(token, &decoding_key, &validation) {
        Ok(token_data) => Ok(AuthenticatedUser {
            user_id: token_data.claims.sub,
            role: token_data.claims.role,
        }),
        Err(e) => {
            tracing::debug!("JWT verification failed: {}", e);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Axum middleware for JWT authentication
pub async fn auth_middleware(
    mut req: Request,
    next: axum::middleware::Next,
) -> Result<Response, ApiError> {
    let is_public = PUBLIC_PATHS.contains(&req.uri().path());

    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match extract_token(auth_header) {
        Some(t) => t,
        None if is_public => return Ok(next.run(req).await),
        None => {
            tracing::debug!("Missing Authorization header");
            return Err(ApiError::Unauthorized);
        }
    };

    let ctx = req
        .extensions()
        .get::<RelayContext>()
        .ok_or_else(|| ApiError::Internal("Relay context missing".to_string()))?;

    let user = match verify_token(&token, &ctx.config.server.jwt_secret) {
        Ok(user) => user,
        Err(_) if is_public => return Ok(next.run(req).await),
        Err(_) => return Err(ApiError::Unauthorized),
    };

    tracing::debug!("Authenticated user: {}", user.user_id);
    req.extensions_mut().insert(user);

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn test_token_round_trip_keeps_role() {
        let token = generate_token("user-1", Some(SERVICE_ROLE), SECRET, 1).unwrap();
        let user = verify_token(&token, SECRET).unwrap();
        assert_eq!(user.user_id, "user-1");
        assert!(user.is_service_role());
        assert!(user.may_act_for("someone-else"));
    }

    #[test]
    fn test_plain_user_acts_only_for_self() {
        let token = generate_token("user-1", None, SECRET, 1).unwrap();
        let user = verify_token(&token, SECRET).unwrap();
        assert!(!user.is_service_role());
        assert!(user.may_act_for("user-1"));
        assert!(!user.may_act_for("user-2"));
    }

    #[test]
    fn test_wrong_secret_is_unauthorized() {
        let token = generate_token("user-1", None, SECRET, 1).unwrap();
        assert_eq!(verify_token(&token, "other").unwrap_err(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_extract_token_requires_bearer_prefix() {
        assert_eq!(extract_token(Some("Bearer abc")).as_deref(), Some("abc"));
        assert_eq!(extract_token(Some("Basic abc")), None);
        assert_eq!(extract_token(None), None);
    }
}
