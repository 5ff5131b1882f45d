pub mod auth;
pub mod cli;
pub mod db;
pub mod invoices;
pub mod keys;
pub mod logger;
pub mod rate_limit;
pub mod routes;
pub mod scheduler;
pub mod schema;
pub mod settings;
pub mod upstream;
pub mod webhook;

#[cfg(test)]
mod tests;

use axum::http::header;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use diesel::SqliteConnection;
use diesel_migrations::embed_migrations;
use diesel_migrations::EmbeddedMigrations;
use diesel_migrations::MigrationHarness;
use serde_json::json;
use std::time::Duration;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// Idempotent schema installation; every migration that already ran is
/// skipped via the schema version table.
pub fn run_migration(conn: &mut SqliteConnection) {
    conn.run_pending_migrations(MIGRATIONS)
        .expect("migrations to succeed");
}

/// Our app's top level error type. Every variant maps to one of the stable
/// error codes of the response envelope.
#[derive(Debug)]
pub enum AppError {
    MissingApiKey,
    InvalidApiKey,
    NotApproved,
    NoSigningSecret,
    MissingSignatureHeaders,
    InvalidTimestamp,
    RequestExpired,
    ReplayDetected,
    InvalidSignature,
    IpNotAllowed,
    Forbidden,
    MissingParams(String),
    InvalidAmount(String),
    InvalidQris(String),
    NotFound(String),
    Conflict(String),
    NoSuffixAvailable,
    RateLimit { retry_after: Duration },
    UpstreamUnavailable(String),
    InternalServerError(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MissingApiKey => "MissingApiKey",
            AppError::InvalidApiKey => "InvalidApiKey",
            AppError::NotApproved => "NotApproved",
            AppError::NoSigningSecret => "NoSigningSecret",
            AppError::MissingSignatureHeaders => "MissingSignatureHeaders",
            AppError::InvalidTimestamp => "InvalidTimestamp",
            AppError::RequestExpired => "RequestExpired",
            AppError::ReplayDetected => "ReplayDetected",
            AppError::InvalidSignature => "InvalidSignature",
            AppError::IpNotAllowed => "IpNotAllowed",
            AppError::Forbidden => "Forbidden",
            AppError::MissingParams(_) => "MissingParams",
            AppError::InvalidAmount(_) => "InvalidAmount",
            AppError::InvalidQris(_) => "InvalidQris",
            AppError::NotFound(_) => "NotFound",
            AppError::Conflict(_) => "Conflict",
            AppError::NoSuffixAvailable => "NoSuffixAvailable",
            AppError::RateLimit { .. } => "RateLimit",
            AppError::UpstreamUnavailable(_) => "UpstreamUnavailable",
            AppError::InternalServerError(_) => "Internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::MissingApiKey
            | AppError::InvalidApiKey
            | AppError::NoSigningSecret
            | AppError::MissingSignatureHeaders
            | AppError::InvalidTimestamp
            | AppError::RequestExpired
            | AppError::InvalidSignature => StatusCode::UNAUTHORIZED,
            AppError::NotApproved | AppError::IpNotAllowed | AppError::Forbidden => {
                StatusCode::FORBIDDEN
            }
            AppError::MissingParams(_)
            | AppError::InvalidAmount(_)
            | AppError::InvalidQris(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ReplayDetected | AppError::Conflict(_) | AppError::NoSuffixAvailable => {
                StatusCode::CONFLICT
            }
            AppError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::MissingApiKey => "Missing X-Api-Key header".to_string(),
            AppError::InvalidApiKey => "Unknown API key".to_string(),
            AppError::NotApproved => "Merchant is not approved for gateway access".to_string(),
            AppError::NoSigningSecret => "No signing secret configured".to_string(),
            AppError::MissingSignatureHeaders => {
                "Missing X-Timestamp, X-Nonce or X-Signature header".to_string()
            }
            AppError::InvalidTimestamp => "X-Timestamp is not unix seconds".to_string(),
            AppError::RequestExpired => "Request timestamp outside the accepted window".to_string(),
            AppError::ReplayDetected => "Nonce was already used".to_string(),
            AppError::InvalidSignature => "Signature verification failed".to_string(),
            AppError::IpNotAllowed => "Client address is not on the allow-list".to_string(),
            AppError::Forbidden => "Forbidden".to_string(),
            AppError::MissingParams(msg)
            | AppError::InvalidAmount(msg)
            | AppError::InvalidQris(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::UpstreamUnavailable(msg)
            | AppError::InternalServerError(msg) => msg.clone(),
            AppError::NoSuffixAvailable => {
                "No unique amount suffix available for this principal".to_string()
            }
            AppError::RateLimit { .. } => "Rate limit exceeded".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.message(),
            },
        }));

        let mut response = (self.status(), body).into_response();

        if let AppError::RateLimit { retry_after } = self {
            if let Ok(value) = retry_after.as_secs().max(1).to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
