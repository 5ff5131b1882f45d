use crate::db::credentials;
use crate::db::credentials::Environment;
use crate::db::credentials::MerchantCredentials;
use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use diesel::SqliteConnection;
use rand::thread_rng;
use rand::RngCore;
use sha2::Digest;
use sha2::Sha256;

/// Length of the random key material before encoding.
const KEY_BYTES: usize = 24;
/// Characters of the raw key kept around for display purposes.
const DISPLAY_PREFIX_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    /// Bearer key presented in `X-Api-Key`.
    Api,
    /// HMAC secret for inbound request signatures.
    Signing,
    /// HMAC secret for outbound webhook signatures.
    Webhook,
}

/// The prefix carries no authority; verification depends solely on the hash.
fn key_prefix(role: KeyRole, environment: Environment) -> &'static str {
    match (role, environment) {
        (KeyRole::Api, Environment::Production) => "sk_live_",
        (KeyRole::Api, Environment::Sandbox) => "sk_test_",
        (KeyRole::Signing, Environment::Production) => "sksec_",
        (KeyRole::Signing, Environment::Sandbox) => "sksec_test_",
        (KeyRole::Webhook, Environment::Production) => "whsec_",
        (KeyRole::Webhook, Environment::Sandbox) => "whsec_test_",
    }
}

pub fn mint_key(role: KeyRole, environment: Environment) -> String {
    let mut material = [0u8; KEY_BYTES];
    thread_rng().fill_bytes(&mut material);

    format!(
        "{}{}",
        key_prefix(role, environment),
        URL_SAFE_NO_PAD.encode(material)
    )
}

/// SHA-256 of the raw key, lowercase hex. This is the only representation of
/// an API key that is ever persisted.
pub fn fingerprint(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}

/// Freshly minted secrets together with the persisted record. The raw values
/// exist only in this struct; hand them to the merchant once and drop them.
#[derive(Debug)]
pub struct IssuedCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub webhook_secret: String,
    pub record: MerchantCredentials,
}

/// Mint (or rotate) the credential pair of one environment. Rotation
/// overwrites the hash and secrets of the target environment only and keeps
/// the original `created_at`.
pub fn issue(
    conn: &mut SqliteConnection,
    merchant_id: &str,
    environment: Environment,
    now: i64,
) -> Result<IssuedCredentials> {
    let existing = credentials::get(conn, merchant_id, environment)?;

    let api_key = mint_key(KeyRole::Api, environment);
    let api_secret = mint_key(KeyRole::Signing, environment);
    let webhook_secret = mint_key(KeyRole::Webhook, environment);

    let record = MerchantCredentials {
        merchant_id: merchant_id.to_string(),
        environment,
        api_key_hash: fingerprint(&api_key),
        api_key_prefix: api_key.chars().take(DISPLAY_PREFIX_LEN).collect(),
        api_secret: api_secret.clone(),
        webhook_secret: webhook_secret.clone(),
        created_at: existing.as_ref().map(|c| c.created_at).unwrap_or(now),
        rotated_at: existing.is_some().then_some(now),
    };

    credentials::upsert(conn, &record)?;

    Ok(IssuedCredentials {
        api_key,
        api_secret,
        webhook_secret,
        record,
    })
}
