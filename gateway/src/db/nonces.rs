use crate::schema::used_nonces;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel::result::Error;

#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = used_nonces)]
pub struct UsedNonce {
    pub merchant_id: String,
    pub nonce: String,
    pub expires_at: i64,
}

/// Record a nonce as used. Returns false when a live `(merchant_id, nonce)`
/// row already exists, i.e. the request is a replay. Expired rows for the
/// merchant are dropped opportunistically first, so the unique insert below
/// only ever collides with a nonce that is still inside its window.
pub fn try_mark_used(
    conn: &mut SqliteConnection,
    merchant_id: &str,
    nonce: &str,
    expires_at: i64,
    now: i64,
) -> QueryResult<bool> {
    diesel::delete(
        used_nonces::table
            .filter(used_nonces::merchant_id.eq(merchant_id))
            .filter(used_nonces::expires_at.le(now)),
    )
    .execute(conn)?;

    let row = UsedNonce {
        merchant_id: merchant_id.to_string(),
        nonce: nonce.to_string(),
        expires_at,
    };

    match diesel::insert_into(used_nonces::table)
        .values(&row)
        .execute(conn)
    {
        Ok(_) => Ok(true),
        Err(Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn delete_expired(conn: &mut SqliteConnection, now: i64) -> QueryResult<usize> {
    diesel::delete(used_nonces::table.filter(used_nonces::expires_at.le(now))).execute(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::setup_db;

    #[tokio::test]
    async fn live_nonce_cannot_be_reused() {
        let (_dir, pool) = setup_db();
        let mut conn = pool.get().unwrap();

        assert!(try_mark_used(&mut conn, "m1", "nonce-1", 1_000_120, 1_000_000).unwrap());
        assert!(!try_mark_used(&mut conn, "m1", "nonce-1", 1_000_130, 1_000_010).unwrap());

        // Another merchant is unaffected.
        assert!(try_mark_used(&mut conn, "m2", "nonce-1", 1_000_120, 1_000_000).unwrap());
    }

    #[tokio::test]
    async fn expired_nonce_is_recycled() {
        let (_dir, pool) = setup_db();
        let mut conn = pool.get().unwrap();

        assert!(try_mark_used(&mut conn, "m1", "nonce-1", 1_000_120, 1_000_000).unwrap());
        // 121 seconds later the original row has lapsed.
        assert!(try_mark_used(&mut conn, "m1", "nonce-1", 1_000_241, 1_000_121).unwrap());
    }

    #[tokio::test]
    async fn gc_drops_only_expired_rows() {
        let (_dir, pool) = setup_db();
        let mut conn = pool.get().unwrap();

        try_mark_used(&mut conn, "m1", "old", 1_000_100, 1_000_000).unwrap();
        try_mark_used(&mut conn, "m1", "fresh", 1_000_500, 1_000_000).unwrap();

        assert_eq!(delete_expired(&mut conn, 1_000_200).unwrap(), 1);
        assert!(!try_mark_used(&mut conn, "m1", "fresh", 1_000_600, 1_000_200).unwrap());
    }
}
