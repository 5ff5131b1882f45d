use crate::schema::invoice_events;
use anyhow::ensure;
use anyhow::Result;
use diesel::prelude::*;
use diesel::AsExpression;
use diesel::FromSqlRow;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromSqlRow, AsExpression, Serialize, Deserialize)]
#[diesel(sql_type = diesel::sql_types::Text)]
pub enum EventType {
    #[serde(rename = "payment.created")]
    PaymentCreated,
    #[serde(rename = "payment.paid")]
    PaymentPaid,
    #[serde(rename = "payment.expired")]
    PaymentExpired,
    #[serde(rename = "refund.requested")]
    RefundRequested,
    #[serde(rename = "refund.processed")]
    RefundProcessed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PaymentCreated => "payment.created",
            EventType::PaymentPaid => "payment.paid",
            EventType::PaymentExpired => "payment.expired",
            EventType::RefundRequested => "refund.requested",
            EventType::RefundProcessed => "refund.processed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record. The event log is the ordering ground truth for
/// a single invoice; `seq` totally orders events that share a timestamp.
#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = invoice_events)]
pub struct InvoiceEvent {
    #[diesel(deserialize_as = i64)]
    pub seq: Option<i64>,
    pub id: String,
    pub invoice_id: String,
    pub event_type: EventType,
    pub payload: String,
    pub created_at: i64,
}

pub fn append(
    conn: &mut SqliteConnection,
    invoice_id: &str,
    event_type: EventType,
    payload: &serde_json::Value,
    now: i64,
) -> Result<InvoiceEvent> {
    let event = InvoiceEvent {
        seq: None,
        id: Uuid::new_v4().to_string(),
        invoice_id: invoice_id.to_string(),
        event_type,
        payload: payload.to_string(),
        created_at: now,
    };

    let affected_rows = diesel::insert_into(invoice_events::table)
        .values(&event)
        .execute(conn)?;

    ensure!(affected_rows > 0, "Could not append invoice event");

    Ok(event)
}

/// The tail of the event log, oldest first.
pub fn list(
    conn: &mut SqliteConnection,
    invoice_id: &str,
    limit: i64,
) -> QueryResult<Vec<InvoiceEvent>> {
    invoice_events::table
        .filter(invoice_events::invoice_id.eq(invoice_id))
        .order(invoice_events::seq.asc())
        .limit(limit)
        .load::<InvoiceEvent>(conn)
}
