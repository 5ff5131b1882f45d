use crate::schema::alerts;
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
pub enum AlertType {
    #[serde(rename = "webhook.failed")]
    WebhookFailed,
}

/// Operational alert, e.g. a webhook that exhausted its retries.
#[derive(Queryable, Insertable, Identifiable, Debug, Clone)]
#[diesel(primary_key(id))]
pub struct Alert {
    pub id: String,
    pub merchant_id: Option<String>,
    pub alert_type: AlertType,
    pub message: String,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

pub fn insert(
    conn: &mut SqliteConnection,
    merchant_id: Option<&str>,
    alert_type: AlertType,
    message: &str,
    now: i64,
) -> Result<Alert> {
    let alert = Alert {
        id: Uuid::new_v4().to_string(),
        merchant_id: merchant_id.map(|id| id.to_string()),
        alert_type,
        message: message.to_string(),
        created_at: now,
        resolved_at: None,
    };

    let affected_rows = diesel::insert_into(alerts::table)
        .values(&alert)
        .execute(conn)?;

    ensure!(affected_rows > 0, "Could not insert alert");

    Ok(alert)
}

pub fn list_open(conn: &mut SqliteConnection) -> QueryResult<Vec<Alert>> {
    alerts::table
        .filter(alerts::resolved_at.is_null())
        .order(alerts::created_at.asc())
        .load::<Alert>(conn)
}

pub fn resolve(conn: &mut SqliteConnection, alert_id: &str, now: i64) -> Result<()> {
    let affected_rows = diesel::update(alerts::table)
        .filter(alerts::id.eq(alert_id))
        .filter(alerts::resolved_at.is_null())
        .set(alerts::resolved_at.eq(now))
        .execute(conn)?;

    ensure!(affected_rows > 0, "Could not resolve alert");

    Ok(())
}
