pub mod mem;
pub mod models;
pub mod pg;
pub mod store;

pub use mem::MemStore;
pub use pg::PgStore;
pub use store::{NewEvent, ServerDetail, ServerFilter, Store, StoreError};

use ipnetwork::Ipv4Network;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Pool rows seeded from the configured CIDR, at most.
pub const IP_POOL_CAP: usize = 2048;

/// Create a connection pool to PostgreSQL.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Run embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("invalid CIDR: {0}")]
    Cidr(#[from] ipnetwork::IpNetworkError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Seed the address pool from a CIDR range, skipping the network and
/// broadcast addresses and capping at [`IP_POOL_CAP`] usable entries.
///
/// A non-empty pool is left untouched so restarts do not re-seed. Returns
/// the number of rows inserted.
pub async fn seed_ip_pool(store: &dyn Store, cidr: &str) -> Result<usize, SeedError> {
    let (total, _) = store.count_ips().await?;
    if total > 0 {
        tracing::debug!(total, "IP pool already seeded");
        return Ok(0);
    }

    let net: Ipv4Network = cidr.parse()?;
    let addresses: Vec<String> = net
        .iter()
        .filter(|addr| *addr != net.network() && *addr != net.broadcast())
        .take(IP_POOL_CAP)
        .map(|addr| addr.to_string())
        .collect();

    store.insert_ips(&addresses).await?;
    tracing::info!(cidr, count = addresses.len(), "seeded IP pool");
    Ok(addresses.len())
}
