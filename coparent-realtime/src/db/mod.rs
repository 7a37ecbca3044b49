//! Database connectivity and schema helpers.

pub mod bootstrap;

use shared::config::DatabaseConfig;
use sqlx::{PgPool, postgres::PgPoolOptions};

/// Creates a connection pool for `db`.
///
/// # Errors
/// Returns an error if the database cannot be reached.
pub async fn create_database_pool(db: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .connect(&db.url)
        .await?;
    metrics::gauge!("coparent_db_pool_max_connections").set(f64::from(db.max_connections));
    Ok(pool)
}
