//! Request identity
//!
//! Session and credential mechanics live upstream; this API trusts the
//! identity header injected by the session layer and a static admin bearer
//! token for the VIP management endpoints.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use subtle::ConstantTimeEq;

use crate::config::AppConfig;
use crate::error::ApiError;

/// The authenticated end user for customer-facing endpoints.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub id: i64,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or(ApiError::Unauthorized)?;
        Ok(AuthUser { id })
    }
}

/// Admin bearer-token check for the VIP endpoints. Token comparison runs in
/// constant time.
pub fn require_admin(headers: &HeaderMap, config: &AppConfig) -> Result<(), ApiError> {
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if provided
        .as_bytes()
        .ct_eq(config.admin_token.as_bytes())
        .into()
    {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}
