use crate::schema::paid_transactions;
use anyhow::ensure;
use anyhow::Result;
use diesel::prelude::*;

/// Short-TTL success cache. Lets repeated check calls short-circuit without
/// polling the upstream again.
#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = paid_transactions)]
pub struct PaidTransaction {
    pub invoice_id: String,
    pub principal: String,
    pub final_amount: i64,
    pub paid_at: i64,
    pub expires_at: i64,
}

pub fn insert(conn: &mut SqliteConnection, paid: &PaidTransaction) -> Result<()> {
    let affected_rows = diesel::replace_into(paid_transactions::table)
        .values(paid)
        .execute(conn)?;

    ensure!(affected_rows > 0, "Could not insert paid transaction");

    Ok(())
}

pub fn get(
    conn: &mut SqliteConnection,
    invoice_id: &str,
) -> QueryResult<Option<PaidTransaction>> {
    paid_transactions::table
        .filter(paid_transactions::invoice_id.eq(invoice_id))
        .first::<PaidTransaction>(conn)
        .optional()
}

pub fn delete_expired(conn: &mut SqliteConnection, now: i64) -> QueryResult<usize> {
    diesel::delete(paid_transactions::table.filter(paid_transactions::expires_at.le(now)))
        .execute(conn)
}
