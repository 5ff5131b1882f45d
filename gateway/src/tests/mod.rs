mod invoice_flow_test;
mod pipeline_test;

use crate::auth;
use crate::db;
use crate::db::credentials::Environment;
use crate::db::merchants::Merchant;
use crate::db::merchants::MerchantStatus;
use crate::db::SqlitePool;
use crate::keys;
use crate::rate_limit::RateLimiter;
use crate::routes::router;
use crate::routes::AppState;
use crate::run_migration;
use crate::settings::Settings;
use crate::upstream::Credit;
use crate::upstream::UpstreamError;
use crate::upstream::UpstreamProvider;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::Request;
use axum::Router;
use diesel::SqliteConnection;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;

pub fn setup_db() -> (tempfile::TempDir, SqlitePool) {
    let dir = tempfile::tempdir().expect("to create a temp dir");
    let database = dir.path().join("gateway.sqlite");

    let pool = db::init_pool(database.to_str().expect("utf-8 path")).unwrap();
    let mut conn = pool.get().unwrap();
    run_migration(&mut conn);

    (dir, pool)
}

pub struct TestMerchant {
    pub merchant: Merchant,
    pub api_key: String,
    pub api_secret: String,
    pub webhook_secret: String,
}

/// An active merchant with freshly minted production credentials.
pub fn provision_merchant(conn: &mut SqliteConnection, email: &str) -> TestMerchant {
    let now = OffsetDateTime::now_utc().unix_timestamp();

    let merchant = Merchant::new(email);
    db::merchants::insert(conn, &merchant).unwrap();
    db::merchants::set_status(conn, &merchant.id, MerchantStatus::Active).unwrap();
    let merchant = db::merchants::get(conn, &merchant.id).unwrap().unwrap();

    let issued = keys::issue(conn, &merchant.id, Environment::Production, now).unwrap();

    TestMerchant {
        merchant,
        api_key: issued.api_key,
        api_secret: issued.api_secret,
        webhook_secret: issued.webhook_secret,
    }
}

/// Upstream double returning a scripted credit list.
pub struct MockUpstream {
    credits: Mutex<Vec<Credit>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self {
            credits: Mutex::new(Vec::new()),
        }
    }

    pub fn set_credits(&self, credits: Vec<Credit>) {
        *self.credits.lock() = credits;
    }
}

#[async_trait]
impl UpstreamProvider for MockUpstream {
    async fn fetch_credits(
        &self,
        _principal: &str,
        _token: &str,
    ) -> Result<Vec<Credit>, UpstreamError> {
        Ok(self.credits.lock().clone())
    }
}

pub struct FailingUpstream;

#[async_trait]
impl UpstreamProvider for FailingUpstream {
    async fn fetch_credits(
        &self,
        _principal: &str,
        _token: &str,
    ) -> Result<Vec<Credit>, UpstreamError> {
        Err(UpstreamError::Unavailable("connection refused".to_string()))
    }
}

/// The real router with a mock peer address, as the tests have no TCP
/// connection to take the peer from.
pub fn test_router(
    pool: SqlitePool,
    settings: Settings,
    upstream: Arc<dyn UpstreamProvider>,
) -> Router {
    let rate_limiter = Arc::new(RateLimiter::new(
        settings.rate_limit_per_minute,
        settings.rate_limit_window(),
    ));
    let app_state = Arc::new(AppState {
        pool,
        settings,
        rate_limiter,
        upstream,
    });

    router(app_state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))))
}

/// A fully signed gateway request, timestamped now.
pub fn signed_request(
    method: &str,
    path_and_query: &str,
    credentials: &TestMerchant,
    nonce: &str,
    body: &str,
) -> Request<Body> {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    signed_request_at(method, path_and_query, credentials, nonce, body, timestamp)
}

pub fn signed_request_at(
    method: &str,
    path_and_query: &str,
    credentials: &TestMerchant,
    nonce: &str,
    body: &str,
    timestamp: i64,
) -> Request<Body> {
    let message = auth::canonical_message(
        method,
        path_and_query,
        &timestamp.to_string(),
        nonce,
        body.as_bytes(),
    );
    let signature = auth::sign(&credentials.api_secret, &message);

    Request::builder()
        .method(method)
        .uri(path_and_query)
        .header("X-Api-Key", &credentials.api_key)
        .header("X-Timestamp", timestamp.to_string())
        .header("X-Nonce", nonce)
        .header("X-Signature", signature)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// A plausible static QRIS source, checksum included.
pub fn static_qris() -> String {
    let records = vec![
        qris::Tlv::new("00", "01"),
        qris::Tlv::new("01", "11"),
        qris::Tlv::new("26", "0014ID.CO.QRIS.WWW021512345678901234"),
        qris::Tlv::new("52", "5411"),
        qris::Tlv::new("53", "360"),
        qris::Tlv::new("58", "ID"),
        qris::Tlv::new("59", "TOKO KOPI TIGA"),
        qris::Tlv::new("60", "BANDUNG"),
    ];

    qris::append_checksum(&qris::render(&records).unwrap()).unwrap()
}
