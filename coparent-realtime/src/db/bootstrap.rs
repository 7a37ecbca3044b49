//! Installs the `pg_notify` triggers the realtime transport listens to.

use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, instrument};

use crate::source::ChangeTable;

/// Embedded trigger script.
pub const NOTIFY_TRIGGERS_SQL: &str = include_str!("../../sql/notify_triggers.sql");

/// Failures while installing triggers.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The script failed to execute.
    #[error("failed to install notify triggers: {source}")]
    Sql {
        /// Database error.
        #[source]
        source: sqlx::Error,
    },
    /// Connectivity check failed before running the script.
    #[error("database is not reachable: {source}")]
    Unreachable {
        /// Database error.
        #[source]
        source: sqlx::Error,
    },
}

/// Simple liveness check used before touching the schema.
///
/// # Errors
/// Returns the database error when `SELECT 1` fails.
pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

/// Creates or replaces the notify function and one trigger per observed table.
///
/// # Errors
/// Returns [`BootstrapError`] when the database is unreachable or rejects the script.
#[instrument(name = "db.install_notify_triggers", skip(pool), err)]
pub async fn install_notify_triggers(pool: &PgPool) -> Result<(), BootstrapError> {
    ensure_liveness(pool)
        .await
        .map_err(|source| BootstrapError::Unreachable { source })?;

    sqlx::raw_sql(NOTIFY_TRIGGERS_SQL)
        .execute(pool)
        .await
        .map_err(|source| BootstrapError::Sql { source })?;

    info!(
        tables = ?ChangeTable::ALL.map(ChangeTable::as_str),
        "notify triggers installed"
    );
    Ok(())
}
