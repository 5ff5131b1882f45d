use crate::schema::pending_transactions;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel::result::Error;

/// An in-flight suffix claim for a principal. Rows disappear on payment,
/// expiry or explicit cancel; suffix recycling is bounded by this table, not
/// by the long-lived invoice history.
#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = pending_transactions)]
pub struct PendingTransaction {
    pub principal: String,
    pub unique_suffix: i32,
    pub invoice_id: String,
    pub final_amount: i64,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Claim a suffix. Returns false when a concurrent creator already holds the
/// `(principal, unique_suffix)` primary key; the caller is expected to pick
/// another suffix and retry.
pub fn try_claim(
    conn: &mut SqliteConnection,
    pending: &PendingTransaction,
) -> QueryResult<bool> {
    match diesel::insert_into(pending_transactions::table)
        .values(pending)
        .execute(conn)
    {
        Ok(_) => Ok(true),
        Err(Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn get_for_invoice(
    conn: &mut SqliteConnection,
    invoice_id: &str,
) -> QueryResult<Option<PendingTransaction>> {
    pending_transactions::table
        .filter(pending_transactions::invoice_id.eq(invoice_id))
        .first::<PendingTransaction>(conn)
        .optional()
}

pub fn claimed_suffixes(conn: &mut SqliteConnection, principal: &str) -> QueryResult<Vec<i32>> {
    pending_transactions::table
        .filter(pending_transactions::principal.eq(principal))
        .select(pending_transactions::unique_suffix)
        .load::<i32>(conn)
}

pub fn delete_for_invoice(conn: &mut SqliteConnection, invoice_id: &str) -> QueryResult<usize> {
    diesel::delete(
        pending_transactions::table.filter(pending_transactions::invoice_id.eq(invoice_id)),
    )
    .execute(conn)
}

/// Free the suffixes of claims that have already lapsed for one principal,
/// so creation can recycle them.
pub fn delete_expired_for_principal(
    conn: &mut SqliteConnection,
    principal: &str,
    now: i64,
) -> QueryResult<usize> {
    diesel::delete(
        pending_transactions::table
            .filter(pending_transactions::principal.eq(principal))
            .filter(pending_transactions::expires_at.le(now)),
    )
    .execute(conn)
}

pub fn delete_expired(conn: &mut SqliteConnection, now: i64) -> QueryResult<usize> {
    diesel::delete(pending_transactions::table.filter(pending_transactions::expires_at.le(now)))
        .execute(conn)
}
