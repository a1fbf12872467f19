//! Caller identity.
//!
//! User authentication happens in the gateway in front of this service; it
//! forwards the authenticated user's id in `X-User-Id`. Admin routes carry a
//! shared key in `X-Admin-Key`.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::errors::LedgerError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// The authenticated user making the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = LedgerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| AuthUser(id.to_string()))
            .ok_or(LedgerError::Unauthenticated)
    }
}

/// Accept the request only if `X-Admin-Key` matches the configured key.
/// With no key configured every request is refused.
pub fn require_admin(headers: &HeaderMap, configured: Option<&str>) -> Result<(), LedgerError> {
    let (Some(expected), Some(given)) = (
        configured,
        headers.get(ADMIN_KEY_HEADER).and_then(|v| v.to_str().ok()),
    ) else {
        return Err(LedgerError::Unauthenticated);
    };

    // Compare digests so the comparison time does not depend on the key.
    if Sha256::digest(expected.as_bytes()) == Sha256::digest(given.as_bytes()) {
        Ok(())
    } else {
        Err(LedgerError::Unauthenticated)
    }
}
