use crate::auth::AuthedMerchant;
use crate::db;
use crate::db::credentials::Environment;
use crate::db::invoices::Invoice;
use crate::db::invoices::InvoiceStatus;
use crate::invoices;
use crate::invoices::CheckOutcome;
use crate::invoices::CheckState;
use crate::invoices::CreateInvoiceParams;
use crate::routes::success;
use crate::routes::AppState;
use crate::upstream::UpstreamError;
use crate::AppError;
use axum::body::Bytes;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Extension;
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;
use tracing::instrument;

const MAX_LIST_LIMIT: i64 = 200;
const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_EVENT_TAIL: i64 = 100;

/// Parse a request body ourselves so malformed input surfaces through the
/// error envelope instead of an axum rejection.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|e| AppError::MissingParams(format!("Invalid body: {e}")))
}

#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    pub username: String,
    pub token: String,
    pub amount: i64,
    pub qris_static: String,
    pub reference_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub username: String,
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundRequest {
    pub amount: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Invoice shape of the public API. Unix-second timestamps, metadata echoed
/// back as the JSON the caller sent.
#[derive(Debug, Serialize)]
pub struct ApiInvoice {
    pub invoice_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    pub principal: String,
    pub environment: Environment,
    pub base_amount: i64,
    pub unique_suffix: i32,
    pub final_amount: i64,
    pub status: InvoiceStatus,
    pub qris_string: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<i64>,
}

impl From<&Invoice> for ApiInvoice {
    fn from(invoice: &Invoice) -> Self {
        Self {
            invoice_id: invoice.id.clone(),
            reference_id: invoice.reference_id.clone(),
            principal: invoice.principal.clone(),
            environment: invoice.environment,
            base_amount: invoice.base_amount,
            unique_suffix: invoice.unique_suffix,
            final_amount: invoice.final_amount,
            status: invoice.status,
            qris_string: invoice.qris_string.clone(),
            metadata: invoice
                .metadata
                .as_deref()
                .and_then(|metadata| serde_json::from_str(metadata).ok()),
            created_at: invoice.created_at,
            expires_at: invoice.expires_at,
            paid_at: invoice.paid_at,
        }
    }
}

#[instrument(skip_all, err(Debug))]
pub async fn post_invoice(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedMerchant>,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let request: CreateInvoiceRequest = parse_body(&body)?;
    if request.token.trim().is_empty() {
        return Err(AppError::MissingParams("token must not be empty".to_string()));
    }

    let params = CreateInvoiceParams {
        principal: request.username,
        base_amount: request.amount,
        qris_static: request.qris_static,
        reference_id: request.reference_id,
        metadata: request.metadata,
    };

    let pool = state.pool.clone();
    let invoice_ttl_secs = state.settings.invoice_ttl_secs;
    let invoice = spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| {
            AppError::InternalServerError(format!("Failed to get db access: {e:#}"))
        })?;
        let now = OffsetDateTime::now_utc().unix_timestamp();

        invoices::create_invoice(
            &mut conn,
            &authed.merchant_id,
            authed.environment,
            &params,
            invoice_ttl_secs,
            now,
        )
    })
    .await
    .expect("task to complete")?;

    tracing::debug!(
        invoice_id = %invoice.id,
        merchant_id = %invoice.merchant_id,
        final_amount = invoice.final_amount,
        "Created invoice"
    );

    Ok((StatusCode::CREATED, success(ApiInvoice::from(&invoice))))
}

#[instrument(skip_all, err(Debug))]
pub async fn get_invoices(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedMerchant>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let pool = state.pool.clone();
    let invoices = spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| {
            AppError::InternalServerError(format!("Failed to get db access: {e:#}"))
        })?;

        db::invoices::list(&mut conn, &authed.merchant_id, authed.environment, limit, offset)
            .map_err(|e| AppError::InternalServerError(format!("Failed to list invoices: {e:#}")))
    })
    .await
    .expect("task to complete")?;

    let invoices: Vec<ApiInvoice> = invoices.iter().map(ApiInvoice::from).collect();

    Ok(success(invoices))
}

#[instrument(skip_all, err(Debug))]
pub async fn get_invoice(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedMerchant>,
    Path(invoice_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let pool = state.pool.clone();
    let invoice = spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| {
            AppError::InternalServerError(format!("Failed to get db access: {e:#}"))
        })?;

        db::invoices::get_for_merchant(
            &mut conn,
            &invoice_id,
            &authed.merchant_id,
            authed.environment,
        )
        .map_err(|e| AppError::InternalServerError(format!("Failed to load invoice: {e:#}")))?
        .ok_or_else(|| AppError::NotFound("Invoice not found".to_string()))
    })
    .await
    .expect("task to complete")?;

    Ok(success(ApiInvoice::from(&invoice)))
}

#[instrument(skip_all, err(Debug))]
pub async fn post_check(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedMerchant>,
    Path(invoice_id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let request: CheckRequest = parse_body(&body)?;
    if request.username.trim().is_empty() || request.token.trim().is_empty() {
        return Err(AppError::MissingParams(
            "username and token must not be empty".to_string(),
        ));
    }

    let pre_poll = {
        let pool = state.pool.clone();
        let authed = authed.clone();
        let invoice_id = invoice_id.clone();
        spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| {
                AppError::InternalServerError(format!("Failed to get db access: {e:#}"))
            })?;
            let now = OffsetDateTime::now_utc().unix_timestamp();

            invoices::begin_check(
                &mut conn,
                &authed.merchant_id,
                authed.environment,
                &invoice_id,
                now,
            )
        })
        .await
        .expect("task to complete")?
    };

    let (invoice, pending_expires_at) = match pre_poll {
        CheckState::Done(outcome) => return Ok(check_response(outcome)),
        CheckState::Poll {
            invoice,
            pending_expires_at,
        } => (invoice, pending_expires_at),
    };

    // An unavailable upstream leaves the invoice pending; the caller simply
    // retries the check later.
    let credits = state
        .upstream
        .fetch_credits(&request.username, &request.token)
        .await
        .map_err(|UpstreamError::Unavailable(msg)| AppError::UpstreamUnavailable(msg))?;

    let outcome = {
        let pool = state.pool.clone();
        let paid_cache_ttl_secs = state.settings.paid_cache_ttl_secs;
        spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| {
                AppError::InternalServerError(format!("Failed to get db access: {e:#}"))
            })?;
            let now = OffsetDateTime::now_utc().unix_timestamp();

            invoices::settle_check(
                &mut conn,
                &authed.merchant_id,
                &invoice,
                pending_expires_at,
                &credits,
                paid_cache_ttl_secs,
                now,
            )
        })
        .await
        .expect("task to complete")?
    };

    Ok(check_response(outcome))
}

fn check_response(outcome: CheckOutcome) -> Json<serde_json::Value> {
    match outcome {
        CheckOutcome::Paid(invoice) => success(json!({
            "status": InvoiceStatus::Paid,
            "invoice": ApiInvoice::from(&invoice),
        })),
        CheckOutcome::Expired(invoice) => success(json!({
            "status": InvoiceStatus::Expired,
            "invoice": ApiInvoice::from(&invoice),
        })),
        CheckOutcome::Pending {
            invoice,
            expires_in,
        } => success(json!({
            "status": InvoiceStatus::Pending,
            "expires_in": expires_in,
            "invoice": ApiInvoice::from(&invoice),
        })),
    }
}

#[instrument(skip_all, err(Debug))]
pub async fn get_events(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedMerchant>,
    Path(invoice_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let pool = state.pool.clone();
    let events = spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| {
            AppError::InternalServerError(format!("Failed to get db access: {e:#}"))
        })?;

        // Ownership check first; events of foreign invoices must 404.
        db::invoices::get_for_merchant(
            &mut conn,
            &invoice_id,
            &authed.merchant_id,
            authed.environment,
        )
        .map_err(|e| AppError::InternalServerError(format!("Failed to load invoice: {e:#}")))?
        .ok_or_else(|| AppError::NotFound("Invoice not found".to_string()))?;

        db::invoice_events::list(&mut conn, &invoice_id, MAX_EVENT_TAIL)
            .map_err(|e| AppError::InternalServerError(format!("Failed to load events: {e:#}")))
    })
    .await
    .expect("task to complete")?;

    let events: Vec<serde_json::Value> = events
        .iter()
        .map(|event| {
            json!({
                "id": event.id,
                "event_type": event.event_type,
                "payload": serde_json::from_str::<serde_json::Value>(&event.payload)
                    .unwrap_or(serde_json::Value::Null),
                "created_at": event.created_at,
            })
        })
        .collect();

    Ok(success(events))
}

#[instrument(skip_all, err(Debug))]
pub async fn post_refund(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedMerchant>,
    Path(invoice_id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let request: RefundRequest = if body.is_empty() {
        RefundRequest::default()
    } else {
        parse_body(&body)?
    };

    let pool = state.pool.clone();
    let invoice = spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| {
            AppError::InternalServerError(format!("Failed to get db access: {e:#}"))
        })?;
        let now = OffsetDateTime::now_utc().unix_timestamp();

        invoices::request_refund(
            &mut conn,
            &authed.merchant_id,
            authed.environment,
            &invoice_id,
            request.amount,
            request.reason,
            now,
        )
    })
    .await
    .expect("task to complete")?;

    Ok(success(ApiInvoice::from(&invoice)))
}
