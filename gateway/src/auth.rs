use crate::db;
use crate::db::credentials::Environment;
use crate::db::merchants::MerchantStatus;
use crate::keys;
use crate::routes::AppState;
use crate::AppError;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use hmac::Hmac;
use hmac::Mac;
use ipnet::IpNet;
use sha2::Sha256;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_API_KEY: &str = "x-api-key";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_NONCE: &str = "x-nonce";
pub const HEADER_SIGNATURE: &str = "x-signature";

/// The merchant resolved by the signed-request pipeline, attached to the
/// request as an extension for the duration of one request.
#[derive(Debug, Clone)]
pub struct AuthedMerchant {
    pub merchant_id: String,
    pub environment: Environment,
}

/// The canonical message covered by the request signature. `body` is the
/// exact request bytes, empty for body-less requests.
pub fn canonical_message(
    method: &str,
    path_and_query: &str,
    timestamp: &str,
    nonce: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut message = Vec::with_capacity(
        method.len() + path_and_query.len() + timestamp.len() + nonce.len() + body.len() + 4,
    );
    message.extend_from_slice(method.to_uppercase().as_bytes());
    message.push(b'\n');
    message.extend_from_slice(path_and_query.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(timestamp.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(nonce.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(body);
    message
}

pub fn sign(secret: &str, message: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison via the mac itself; the hex signature is decoded
/// first so casing does not matter.
pub fn verify(secret: &str, message: &[u8], signature_hex: &str) -> bool {
    let signature = match hex::decode(signature_hex) {
        Ok(signature) => signature,
        Err(_) => return false,
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message);
    mac.verify_slice(&signature).is_ok()
}

/// The client address: first `X-Forwarded-For` value when present, else the
/// connection peer. IPv4-mapped IPv6 addresses are unmapped so that v4
/// allow-list entries match them.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer.ip())
        .to_canonical()
}

/// Entries are single addresses or CIDRs. Unparsable entries never match.
/// An empty list rejects everything; enabling the allow-list without entries
/// is an explicit lock-out, not "allow all".
fn ip_allowed(ip: IpAddr, entries: &[String]) -> bool {
    entries.iter().any(|entry| {
        let entry = entry.trim();
        if let Ok(addr) = entry.parse::<IpAddr>() {
            return addr.to_canonical() == ip;
        }
        if let Ok(net) = entry.parse::<IpNet>() {
            return net.contains(&ip);
        }
        false
    })
}

/// The ordered verification chain every gateway call passes through. Cheap
/// checks run first; the HMAC is only computed for requests that already
/// passed replay and expiry checks, and the rate limiter runs last so a 429
/// never shadows an auth failure.
pub async fn verify_gateway_request(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next<Body>,
) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let body = hyper::body::to_bytes(body)
        .await
        .map_err(|e| AppError::InternalServerError(format!("Failed to read body: {e:#}")))?;

    let api_key = parts
        .headers
        .get(HEADER_API_KEY)
        .ok_or(AppError::MissingApiKey)?
        .to_str()
        .map_err(|_| AppError::InvalidApiKey)?
        .to_string();

    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
    };
    let timestamp = header(HEADER_TIMESTAMP);
    let nonce = header(HEADER_NONCE);
    let signature = header(HEADER_SIGNATURE);

    let ip = client_ip(&parts.headers, peer);
    let method = parts.method.as_str().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path())
        .to_string();

    let authed = {
        let pool = state.pool.clone();
        let settings = state.settings.clone();
        let body = body.clone();

        spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| {
                AppError::InternalServerError(format!("Failed to get db access: {e:#}"))
            })?;

            let key_hash = keys::fingerprint(&api_key);
            let (merchant_id, environment) =
                db::credentials::find_by_api_key_hash(&mut conn, &key_hash)
                    .map_err(|e| {
                        AppError::InternalServerError(format!("Failed to look up key: {e:#}"))
                    })?
                    .ok_or(AppError::InvalidApiKey)?;

            let merchant = db::merchants::get(&mut conn, &merchant_id)
                .map_err(|e| {
                    AppError::InternalServerError(format!("Failed to load merchant: {e:#}"))
                })?
                .ok_or(AppError::InvalidApiKey)?;

            if merchant.status != MerchantStatus::Active {
                return Err(AppError::NotApproved);
            }

            if merchant.ip_allowlist_enabled {
                let entries = merchant
                    .allowlist_entries()
                    .map_err(|e| AppError::InternalServerError(format!("{e:#}")))?;
                if !ip_allowed(ip, &entries) {
                    return Err(AppError::IpNotAllowed);
                }
            }

            let (timestamp, nonce, signature) = match (timestamp, nonce, signature) {
                (Some(timestamp), Some(nonce), Some(signature)) if !nonce.is_empty() => {
                    (timestamp, nonce, signature)
                }
                _ => return Err(AppError::MissingSignatureHeaders),
            };

            let request_time: i64 = timestamp.parse().map_err(|_| AppError::InvalidTimestamp)?;
            let now = OffsetDateTime::now_utc().unix_timestamp();
            if (now - request_time).abs() > settings.sign_window_secs {
                return Err(AppError::RequestExpired);
            }

            let fresh = db::nonces::try_mark_used(
                &mut conn,
                &merchant_id,
                &nonce,
                now + settings.nonce_ttl_secs,
                now,
            )
            .map_err(|e| AppError::InternalServerError(format!("Failed to check nonce: {e:#}")))?;
            if !fresh {
                return Err(AppError::ReplayDetected);
            }

            let credentials = db::credentials::get(&mut conn, &merchant_id, environment)
                .map_err(|e| {
                    AppError::InternalServerError(format!("Failed to load credentials: {e:#}"))
                })?
                .ok_or(AppError::NoSigningSecret)?;

            let message = canonical_message(&method, &path_and_query, &timestamp, &nonce, &body);
            if !verify(&credentials.api_secret, &message, &signature) {
                return Err(AppError::InvalidSignature);
            }

            Ok(AuthedMerchant {
                merchant_id,
                environment,
            })
        })
        .await
        .expect("task to complete")?
    };

    if let Err(retry_after) = state.rate_limiter.check(&authed.merchant_id) {
        return Err(AppError::RateLimit { retry_after });
    }

    tracing::trace!(
        merchant_id = %authed.merchant_id,
        environment = %authed.environment,
        "Request authenticated"
    );

    let mut request = Request::from_parts(parts, Body::from(body));
    request.extensions_mut().insert(authed);

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_message_layout() {
        let message = canonical_message("post", "/invoices?limit=5", "1700000000", "n-1", b"{}");
        assert_eq!(
            message,
            b"POST\n/invoices?limit=5\n1700000000\nn-1\n{}".to_vec()
        );
    }

    #[test]
    fn sign_verify_round_trip() {
        let message = canonical_message("GET", "/invoices", "1700000000", "abc", b"");
        let signature = sign("sksec_dummy", &message);

        assert!(verify("sksec_dummy", &message, &signature));
        // Hex casing is irrelevant.
        assert!(verify("sksec_dummy", &message, &signature.to_uppercase()));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let message = canonical_message("GET", "/invoices", "1700000000", "abc", b"");
        let signature = sign("sksec_dummy", &message);

        let tampered = canonical_message("GET", "/invoices", "1700000001", "abc", b"");
        assert!(!verify("sksec_dummy", &tampered, &signature));
        assert!(!verify("other_secret", &message, &signature));
        assert!(!verify("sksec_dummy", &message, "not-hex"));
    }

    #[test]
    fn allowlist_matches_addresses_and_cidrs() {
        let entries = vec!["203.0.113.7".to_string(), "10.1.0.0/16".to_string()];

        assert!(ip_allowed("203.0.113.7".parse().unwrap(), &entries));
        assert!(ip_allowed("10.1.200.3".parse().unwrap(), &entries));
        assert!(!ip_allowed("10.2.0.1".parse().unwrap(), &entries));
        assert!(!ip_allowed("198.51.100.1".parse().unwrap(), &entries));
    }

    #[test]
    fn allowlist_empty_rejects_everything() {
        assert!(!ip_allowed("127.0.0.1".parse().unwrap(), &[]));
    }

    #[test]
    fn allowlist_ignores_garbage_entries() {
        let entries = vec!["not-an-ip".to_string()];
        assert!(!ip_allowed("127.0.0.1".parse().unwrap(), &entries));
    }

    #[test]
    fn client_ip_prefers_forwarded_for_and_unmaps_v6() {
        let peer: SocketAddr = "192.0.2.1:443".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "::ffff:203.0.113.9, 70.41.3.18".parse().unwrap(),
        );
        assert_eq!(
            client_ip(&headers, peer),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );

        let headers = HeaderMap::new();
        assert_eq!(
            client_ip(&headers, peer),
            "192.0.2.1".parse::<IpAddr>().unwrap()
        );
    }
}
