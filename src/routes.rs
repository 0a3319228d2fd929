use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    routing::{any, get},
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::fast_store::FastStore;
use crate::{admin, customer_api, forwarder};

pub fn gateway_routes() -> Router {
    Router::new()
        .route("/api", any(forwarder::proxy_request))
        .route("/api/*path", any(forwarder::proxy_request))
        .route("/healthz", get(healthz))
        .merge(customer_api::routes())
        .merge(admin::routes())
}

/// Readiness: both stores must answer.
pub async fn healthz(
    Extension(pool): Extension<PgPool>,
    Extension(store): Extension<Arc<dyn FastStore>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if let Err(err) = sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&pool).await {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            format!("durable store unavailable: {err}"),
        ));
    }
    if let Err(err) = store.ping().await {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            format!("fast store unavailable: {err}"),
        ));
    }
    Ok(Json(json!({ "status": "ok" })))
}
