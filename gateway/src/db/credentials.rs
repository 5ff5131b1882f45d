use crate::schema::merchant_credentials;
use anyhow::ensure;
use anyhow::Result;
use diesel::prelude::*;
use diesel::AsExpression;
use diesel::FromSqlRow;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromSqlRow, AsExpression, Serialize, Deserialize)]
#[diesel(sql_type = diesel::sql_types::Text)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Sandbox,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "production" => Ok(Environment::Production),
            "sandbox" => Ok(Environment::Sandbox),
            other => anyhow::bail!("Unknown environment: {other}"),
        }
    }
}

/// One row per merchant per environment. Raw API keys are never persisted;
/// only the SHA-256 hash and a short display prefix are.
#[derive(Queryable, Insertable, Debug, Clone)]
#[diesel(table_name = merchant_credentials)]
pub struct MerchantCredentials {
    pub merchant_id: String,
    pub environment: Environment,
    pub api_key_hash: String,
    pub api_key_prefix: String,
    pub api_secret: String,
    pub webhook_secret: String,
    pub created_at: i64,
    pub rotated_at: Option<i64>,
}

/// Insert or overwrite the credentials of the target environment only.
pub fn upsert(conn: &mut SqliteConnection, credentials: &MerchantCredentials) -> Result<()> {
    let affected_rows = diesel::replace_into(merchant_credentials::table)
        .values(credentials)
        .execute(conn)?;

    ensure!(affected_rows > 0, "Could not store credentials");

    Ok(())
}

pub fn get(
    conn: &mut SqliteConnection,
    merchant_id: &str,
    environment: Environment,
) -> QueryResult<Option<MerchantCredentials>> {
    merchant_credentials::table
        .filter(merchant_credentials::merchant_id.eq(merchant_id))
        .filter(merchant_credentials::environment.eq(environment))
        .first::<MerchantCredentials>(conn)
        .optional()
}

/// Resolve an API key hash to its owner. One query covers both environments
/// because credentials are stored one row per env.
pub fn find_by_api_key_hash(
    conn: &mut SqliteConnection,
    api_key_hash: &str,
) -> QueryResult<Option<(String, Environment)>> {
    merchant_credentials::table
        .filter(merchant_credentials::api_key_hash.eq(api_key_hash))
        .select((
            merchant_credentials::merchant_id,
            merchant_credentials::environment,
        ))
        .first::<(String, Environment)>(conn)
        .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::merchants::Merchant;
    use crate::keys;
    use crate::tests::setup_db;

    #[tokio::test]
    async fn sandbox_and_production_keys_resolve_independently() {
        let (_dir, pool) = setup_db();
        let mut conn = pool.get().unwrap();

        let merchant = Merchant::new("envs@example.com");
        db::merchants::insert(&mut conn, &merchant).unwrap();

        let production = keys::issue(&mut conn, &merchant.id, Environment::Production, 1).unwrap();
        let sandbox = keys::issue(&mut conn, &merchant.id, Environment::Sandbox, 2).unwrap();

        let hash = keys::fingerprint(&production.api_key);
        assert_eq!(
            find_by_api_key_hash(&mut conn, &hash).unwrap(),
            Some((merchant.id.clone(), Environment::Production))
        );

        let hash = keys::fingerprint(&sandbox.api_key);
        assert_eq!(
            find_by_api_key_hash(&mut conn, &hash).unwrap(),
            Some((merchant.id.clone(), Environment::Sandbox))
        );
    }

    #[tokio::test]
    async fn rotation_replaces_only_the_target_environment() {
        let (_dir, pool) = setup_db();
        let mut conn = pool.get().unwrap();

        let merchant = Merchant::new("rotate@example.com");
        db::merchants::insert(&mut conn, &merchant).unwrap();

        let production = keys::issue(&mut conn, &merchant.id, Environment::Production, 1).unwrap();
        let sandbox = keys::issue(&mut conn, &merchant.id, Environment::Sandbox, 2).unwrap();

        let rotated = keys::issue(&mut conn, &merchant.id, Environment::Production, 50).unwrap();

        // The old production key is dead, the new one resolves.
        let old_hash = keys::fingerprint(&production.api_key);
        assert_eq!(find_by_api_key_hash(&mut conn, &old_hash).unwrap(), None);
        let new_hash = keys::fingerprint(&rotated.api_key);
        assert!(find_by_api_key_hash(&mut conn, &new_hash).unwrap().is_some());

        // Rotation is tracked, creation time survives.
        let record = get(&mut conn, &merchant.id, Environment::Production)
            .unwrap()
            .unwrap();
        assert_eq!(record.created_at, 1);
        assert_eq!(record.rotated_at, Some(50));

        // Sandbox untouched.
        let sandbox_hash = keys::fingerprint(&sandbox.api_key);
        assert!(find_by_api_key_hash(&mut conn, &sandbox_hash)
            .unwrap()
            .is_some());
    }
}
