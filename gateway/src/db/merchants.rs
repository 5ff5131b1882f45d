use crate::db::credentials::Environment;
use crate::schema::merchants;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use diesel::prelude::*;
use diesel::AsExpression;
use diesel::FromSqlRow;
use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromSqlRow, AsExpression, Serialize, Deserialize)]
#[diesel(sql_type = diesel::sql_types::Text)]
#[serde(rename_all = "lowercase")]
pub enum MerchantStatus {
    Unverified,
    Submitted,
    Active,
    Rejected,
    Suspended,
}

#[derive(Queryable, Insertable, Identifiable, Debug, Clone)]
#[diesel(primary_key(id))]
pub struct Merchant {
    pub id: String,
    pub email: String,
    pub status: MerchantStatus,
    pub contact_phone: Option<String>,
    pub fee_bps: i32,
    pub fee_fixed: i64,
    pub webhook_url: Option<String>,
    pub webhook_enabled: bool,
    pub sandbox_webhook_url: Option<String>,
    pub sandbox_webhook_enabled: bool,
    pub ip_allowlist_enabled: bool,
    pub ip_allowlist: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Env-scoped view onto the merchant's webhook columns. The production pair
/// doubles as the legacy unscoped config.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub enabled: bool,
}

impl Merchant {
    pub fn new(email: &str) -> Self {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.trim().to_lowercase(),
            status: MerchantStatus::Unverified,
            contact_phone: None,
            fee_bps: 0,
            fee_fixed: 0,
            webhook_url: None,
            webhook_enabled: false,
            sandbox_webhook_url: None,
            sandbox_webhook_enabled: false,
            ip_allowlist_enabled: false,
            ip_allowlist: "[]".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn webhook_config(&self, environment: Environment) -> WebhookConfig {
        match environment {
            Environment::Production => WebhookConfig {
                url: self.webhook_url.clone(),
                enabled: self.webhook_enabled,
            },
            Environment::Sandbox => WebhookConfig {
                url: self.sandbox_webhook_url.clone(),
                enabled: self.sandbox_webhook_enabled,
            },
        }
    }

    /// The configured allow-list entries (plain addresses or CIDRs), stored
    /// as a JSON array.
    pub fn allowlist_entries(&self) -> Result<Vec<String>> {
        serde_json::from_str(&self.ip_allowlist).context("Malformed ip_allowlist column")
    }
}

pub fn insert(conn: &mut SqliteConnection, merchant: &Merchant) -> Result<()> {
    let affected_rows = diesel::insert_into(merchants::table)
        .values(merchant)
        .execute(conn)?;

    ensure!(affected_rows > 0, "Could not insert merchant");

    Ok(())
}

pub fn get(conn: &mut SqliteConnection, merchant_id: &str) -> QueryResult<Option<Merchant>> {
    merchants::table
        .filter(merchants::id.eq(merchant_id))
        .first::<Merchant>(conn)
        .optional()
}

pub fn get_by_email(conn: &mut SqliteConnection, email: &str) -> QueryResult<Option<Merchant>> {
    merchants::table
        .filter(merchants::email.eq(email.trim().to_lowercase()))
        .first::<Merchant>(conn)
        .optional()
}

pub fn set_status(
    conn: &mut SqliteConnection,
    merchant_id: &str,
    status: MerchantStatus,
) -> Result<()> {
    let affected_rows = diesel::update(merchants::table)
        .filter(merchants::id.eq(merchant_id))
        .set((
            merchants::status.eq(status),
            merchants::updated_at.eq(OffsetDateTime::now_utc().unix_timestamp()),
        ))
        .execute(conn)?;

    ensure!(affected_rows > 0, "Could not update merchant status");

    Ok(())
}

pub fn set_webhook_config(
    conn: &mut SqliteConnection,
    merchant_id: &str,
    environment: Environment,
    url: Option<&str>,
    enabled: bool,
) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let affected_rows = match environment {
        Environment::Production => diesel::update(merchants::table)
            .filter(merchants::id.eq(merchant_id))
            .set((
                merchants::webhook_url.eq(url),
                merchants::webhook_enabled.eq(enabled),
                merchants::updated_at.eq(now),
            ))
            .execute(conn)?,
        Environment::Sandbox => diesel::update(merchants::table)
            .filter(merchants::id.eq(merchant_id))
            .set((
                merchants::sandbox_webhook_url.eq(url),
                merchants::sandbox_webhook_enabled.eq(enabled),
                merchants::updated_at.eq(now),
            ))
            .execute(conn)?,
    };

    ensure!(affected_rows > 0, "Could not update webhook config");

    Ok(())
}

pub fn set_ip_allowlist(
    conn: &mut SqliteConnection,
    merchant_id: &str,
    enabled: bool,
    entries: &[String],
) -> Result<()> {
    let affected_rows = diesel::update(merchants::table)
        .filter(merchants::id.eq(merchant_id))
        .set((
            merchants::ip_allowlist_enabled.eq(enabled),
            merchants::ip_allowlist.eq(serde_json::to_string(entries)?),
            merchants::updated_at.eq(OffsetDateTime::now_utc().unix_timestamp()),
        ))
        .execute(conn)?;

    ensure!(affected_rows > 0, "Could not update ip allow-list");

    Ok(())
}
