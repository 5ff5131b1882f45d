use crate::db::credentials::Environment;
use crate::db::invoice_events::EventType;
use crate::schema::webhook_deliveries;
use anyhow::ensure;
use anyhow::Result;
use diesel::prelude::*;
use diesel::AsExpression;
use diesel::FromSqlRow;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromSqlRow, AsExpression, Serialize, Deserialize)]
#[diesel(sql_type = diesel::sql_types::Text)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Queued,
    Delivered,
    Failed,
}

#[derive(Queryable, Insertable, Identifiable, Debug, Clone)]
#[diesel(table_name = webhook_deliveries, primary_key(id))]
pub struct WebhookDelivery {
    pub id: String,
    pub merchant_id: String,
    pub environment: Environment,
    pub invoice_id: Option<String>,
    pub event_type: EventType,
    pub payload: String,
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub next_retry_at: i64,
    pub last_status: Option<i32>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub response_snippet: Option<String>,
}

/// Queue a notification. The payload is serialized once here and the bytes
/// stay stable across every retry.
pub fn enqueue(
    conn: &mut SqliteConnection,
    merchant_id: &str,
    environment: Environment,
    invoice_id: Option<&str>,
    event_type: EventType,
    payload: &serde_json::Value,
    now: i64,
) -> Result<WebhookDelivery> {
    let delivery = WebhookDelivery {
        id: Uuid::new_v4().to_string(),
        merchant_id: merchant_id.to_string(),
        environment,
        invoice_id: invoice_id.map(|id| id.to_string()),
        event_type,
        payload: payload.to_string(),
        status: DeliveryStatus::Queued,
        attempt_count: 0,
        next_retry_at: now,
        last_status: None,
        last_error: None,
        created_at: now,
        updated_at: now,
        response_snippet: None,
    };

    let affected_rows = diesel::insert_into(webhook_deliveries::table)
        .values(&delivery)
        .execute(conn)?;

    ensure!(affected_rows > 0, "Could not enqueue webhook delivery");

    Ok(delivery)
}

pub fn list_due(
    conn: &mut SqliteConnection,
    now: i64,
    limit: i64,
) -> QueryResult<Vec<WebhookDelivery>> {
    webhook_deliveries::table
        .filter(webhook_deliveries::status.eq(DeliveryStatus::Queued))
        .filter(webhook_deliveries::next_retry_at.le(now))
        .order(webhook_deliveries::next_retry_at.asc())
        .limit(limit)
        .load::<WebhookDelivery>(conn)
}

pub fn get(conn: &mut SqliteConnection, id: &str) -> QueryResult<Option<WebhookDelivery>> {
    webhook_deliveries::table
        .filter(webhook_deliveries::id.eq(id))
        .first::<WebhookDelivery>(conn)
        .optional()
}

pub fn mark_delivered(
    conn: &mut SqliteConnection,
    id: &str,
    attempt_count: i32,
    http_status: i32,
    response_snippet: &str,
    now: i64,
) -> Result<()> {
    let affected_rows = diesel::update(webhook_deliveries::table)
        .filter(webhook_deliveries::id.eq(id))
        .set((
            webhook_deliveries::status.eq(DeliveryStatus::Delivered),
            webhook_deliveries::attempt_count.eq(attempt_count),
            webhook_deliveries::last_status.eq(http_status),
            webhook_deliveries::last_error.eq(None::<String>),
            webhook_deliveries::response_snippet.eq(response_snippet),
            webhook_deliveries::updated_at.eq(now),
        ))
        .execute(conn)?;

    ensure!(affected_rows > 0, "Could not mark delivery as delivered");

    Ok(())
}

/// Terminal failure; no further retries.
pub fn mark_failed(
    conn: &mut SqliteConnection,
    id: &str,
    attempt_count: i32,
    http_status: Option<i32>,
    reason: &str,
    now: i64,
) -> Result<()> {
    let affected_rows = diesel::update(webhook_deliveries::table)
        .filter(webhook_deliveries::id.eq(id))
        .set((
            webhook_deliveries::status.eq(DeliveryStatus::Failed),
            webhook_deliveries::attempt_count.eq(attempt_count),
            webhook_deliveries::last_status.eq(http_status),
            webhook_deliveries::last_error.eq(reason),
            webhook_deliveries::updated_at.eq(now),
        ))
        .execute(conn)?;

    ensure!(affected_rows > 0, "Could not mark delivery as failed");

    Ok(())
}

pub fn schedule_retry(
    conn: &mut SqliteConnection,
    id: &str,
    attempt_count: i32,
    next_retry_at: i64,
    http_status: Option<i32>,
    error: &str,
    now: i64,
) -> Result<()> {
    let affected_rows = diesel::update(webhook_deliveries::table)
        .filter(webhook_deliveries::id.eq(id))
        .set((
            webhook_deliveries::attempt_count.eq(attempt_count),
            webhook_deliveries::next_retry_at.eq(next_retry_at),
            webhook_deliveries::last_status.eq(http_status),
            webhook_deliveries::last_error.eq(error),
            webhook_deliveries::updated_at.eq(now),
        ))
        .execute(conn)?;

    ensure!(affected_rows > 0, "Could not schedule delivery retry");

    Ok(())
}
