use std::sync::Arc;

use axum::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use sqlx::PgPool;

use crate::config;
use crate::error::AppError;
use crate::fast_store::FastStore;
use crate::resolver::{AuthContext, KeyResolver};

/// Customer identity resolved from the `x-api-key` header, for the
/// customer-facing billing and analytics mounts.
pub struct AuthedCustomer(pub AuthContext);

#[async_trait]
impl<S> FromRequestParts<S> for AuthedCustomer
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let secret = parts
            .headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .ok_or(AppError::Unauthorized)?;
        let pool = parts
            .extensions
            .get::<PgPool>()
            .cloned()
            .ok_or_else(|| AppError::Message("database pool not configured".into()))?;
        let store = parts
            .extensions
            .get::<Arc<dyn FastStore>>()
            .cloned()
            .ok_or_else(|| AppError::Message("fast store not configured".into()))?;

        let context = KeyResolver::new(pool, store)
            .resolve(secret)
            .await?
            .ok_or(AppError::Unauthorized)?;
        Ok(AuthedCustomer(context))
    }
}

/// Guard for admin endpoints: `x-admin-key` must match the process-wide
/// shared secret.
pub struct AdminAuth;

#[async_trait]
impl<S> FromRequestParts<S> for AdminAuth
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get("x-admin-key")
            .and_then(|value| value.to_str().ok())
            .ok_or(AppError::Unauthorized)?;
        if presented != config::ADMIN_API_KEY.as_str() {
            return Err(AppError::Unauthorized);
        }
        Ok(AdminAuth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn admin_key_accepted() {
        std::env::set_var("ADMIN_API_KEY", "test-admin");
        let request = Request::builder()
            .header("x-admin-key", "test-admin")
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        assert!(AdminAuth::from_request_parts(&mut parts, &()).await.is_ok());
    }

    #[tokio::test]
    async fn wrong_or_missing_admin_key_rejected() {
        std::env::set_var("ADMIN_API_KEY", "test-admin");
        let request = Request::builder()
            .header("x-admin-key", "nope")
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        assert!(AdminAuth::from_request_parts(&mut parts, &())
            .await
            .is_err());

        let request = Request::builder().body(axum::body::Body::empty()).unwrap();
        let mut parts = request.into_parts().0;
        assert!(AdminAuth::from_request_parts(&mut parts, &())
            .await
            .is_err());
    }
}
