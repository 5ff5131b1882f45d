use anyhow::Context;
use anyhow::Result;
use diesel::connection::SimpleConnection;
use diesel::r2d2;
use diesel::r2d2::ConnectionManager;
use diesel::r2d2::Pool;
use diesel::SqliteConnection;

pub mod alerts;
pub mod credentials;
pub mod custom_types;
pub mod invoice_events;
pub mod invoices;
pub mod merchants;
pub mod nonces;
pub mod paid_transactions;
pub mod pending_transactions;
pub mod webhook_deliveries;

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

#[derive(Debug, Clone, Copy)]
struct ConnectionOptions;

impl r2d2::CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;",
        )
        .map_err(r2d2::Error::QueryError)
    }
}

/// Build the connection pool for the gateway database file.
pub fn init_pool(database: &str) -> Result<SqlitePool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database);
    let pool = Pool::builder()
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)
        .context("Failed to create database pool")?;

    Ok(pool)
}
