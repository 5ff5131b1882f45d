use crate::db::credentials::Environment;
use crate::schema::invoices;
use anyhow::ensure;
use anyhow::Result;
use diesel::prelude::*;
use diesel::AsExpression;
use diesel::FromSqlRow;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromSqlRow, AsExpression, Serialize, Deserialize)]
#[diesel(sql_type = diesel::sql_types::Text)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Created,
    Pending,
    Paid,
    Expired,
    Refunded,
}

#[derive(Queryable, Insertable, Identifiable, Debug, Clone)]
#[diesel(primary_key(id))]
pub struct Invoice {
    pub id: String,
    pub merchant_id: String,
    pub environment: Environment,
    pub principal: String,
    pub reference_id: Option<String>,
    pub base_amount: i64,
    pub unique_suffix: i32,
    pub final_amount: i64,
    pub status: InvoiceStatus,
    pub qris_string: String,
    pub metadata: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub paid_at: Option<i64>,
}

pub fn insert(conn: &mut SqliteConnection, invoice: &Invoice) -> Result<()> {
    let affected_rows = diesel::insert_into(invoices::table)
        .values(invoice)
        .execute(conn)?;

    ensure!(affected_rows > 0, "Could not insert invoice");

    Ok(())
}

pub fn get(conn: &mut SqliteConnection, invoice_id: &str) -> QueryResult<Option<Invoice>> {
    invoices::table
        .filter(invoices::id.eq(invoice_id))
        .first::<Invoice>(conn)
        .optional()
}

/// Fetch an invoice scoped to its owner; other merchants (and the other
/// environment of the same merchant) see nothing.
pub fn get_for_merchant(
    conn: &mut SqliteConnection,
    invoice_id: &str,
    merchant_id: &str,
    environment: Environment,
) -> QueryResult<Option<Invoice>> {
    invoices::table
        .filter(invoices::id.eq(invoice_id))
        .filter(invoices::merchant_id.eq(merchant_id))
        .filter(invoices::environment.eq(environment))
        .first::<Invoice>(conn)
        .optional()
}

pub fn list(
    conn: &mut SqliteConnection,
    merchant_id: &str,
    environment: Environment,
    limit: i64,
    offset: i64,
) -> QueryResult<Vec<Invoice>> {
    invoices::table
        .filter(invoices::merchant_id.eq(merchant_id))
        .filter(invoices::environment.eq(environment))
        .order(invoices::created_at.desc())
        .limit(limit)
        .offset(offset)
        .load::<Invoice>(conn)
}

/// Guarded status transition. Returns false when another writer won the
/// race, i.e. the row was no longer in `from`.
pub fn transition(
    conn: &mut SqliteConnection,
    invoice_id: &str,
    from: InvoiceStatus,
    to: InvoiceStatus,
    paid_at: Option<i64>,
) -> QueryResult<bool> {
    let affected_rows = match paid_at {
        Some(paid_at) => diesel::update(invoices::table)
            .filter(invoices::id.eq(invoice_id))
            .filter(invoices::status.eq(from))
            .set((invoices::status.eq(to), invoices::paid_at.eq(paid_at)))
            .execute(conn)?,
        None => diesel::update(invoices::table)
            .filter(invoices::id.eq(invoice_id))
            .filter(invoices::status.eq(from))
            .set(invoices::status.eq(to))
            .execute(conn)?,
    };

    Ok(affected_rows > 0)
}

/// Pending invoices whose TTL has elapsed, oldest first.
pub fn list_due_expiry(
    conn: &mut SqliteConnection,
    now: i64,
    limit: i64,
) -> QueryResult<Vec<Invoice>> {
    invoices::table
        .filter(invoices::status.eq(InvoiceStatus::Pending))
        .filter(invoices::expires_at.le(now))
        .order(invoices::expires_at.asc())
        .limit(limit)
        .load::<Invoice>(conn)
}
