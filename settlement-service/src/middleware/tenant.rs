//! Tenant context for user-facing payment endpoints.
//!
//! The organisation comes from `X-Org-ID` (set by the upstream gateway after
//! authentication); `X-User-ID` is optional and recorded as the initiator.
//! Processor webhooks are not tenant-scoped and do not use this extractor.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

pub const ORG_ID_HEADER: &str = "X-Org-ID";
pub const USER_ID_HEADER: &str = "X-User-ID";

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub org_id: String,
    pub user_id: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let org_id = parts
            .headers
            .get(ORG_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing X-Org-ID header")))?;

        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let span = tracing::Span::current();
        span.record("org_id", org_id);
        if let Some(ref uid) = user_id {
            span.record("user_id", uid.as_str());
        }

        Ok(TenantContext {
            org_id: org_id.to_string(),
            user_id,
        })
    }
}
