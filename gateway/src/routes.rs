use crate::auth;
use crate::db::SqlitePool;
use crate::rate_limit::RateLimiter;
use crate::settings::Settings;
use crate::upstream::UpstreamProvider;
use crate::AppError;
use axum::extract::State;
use axum::middleware;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::task::spawn_blocking;

pub mod invoices;

pub struct AppState {
    pub pool: SqlitePool,
    pub settings: Settings,
    pub rate_limiter: Arc<RateLimiter>,
    pub upstream: Arc<dyn UpstreamProvider>,
}

pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route(
            "/invoices",
            post(invoices::post_invoice).get(invoices::get_invoices),
        )
        .route("/invoices/:invoice_id", get(invoices::get_invoice))
        .route("/invoices/:invoice_id/check", post(invoices::post_check))
        .route("/invoices/:invoice_id/events", get(invoices::get_events))
        .route("/invoices/:invoice_id/refunds", post(invoices::post_refund))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            auth::verify_gateway_request,
        ))
        .with_state(app_state)
}

/// The success half of the response envelope.
pub fn success<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": data,
    }))
}

pub async fn get_health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    spawn_blocking(move || {
        state.pool.get().map_err(|e| {
            AppError::InternalServerError(format!("Failed to get db access: {e:#}"))
        })?;

        Ok(success(json!({ "status": "ok" })))
    })
    .await
    .expect("task to complete")
}
