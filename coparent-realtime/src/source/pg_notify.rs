//! Postgres `LISTEN/NOTIFY` transport.
//!
//! Each table gets its own [`PgListener`] on the channel named after the
//! table. The notify triggers installed by [`crate::db::bootstrap`] publish
//! `{"op": ..., "record": ...}` envelopes.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use shared::config::RealtimeConfig;
use sqlx::{PgPool, postgres::PgListener};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{ChangeTable, ChangeTransport, RawChange, TransportError, TransportSignal};

/// Exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    /// Delay doubling from `initial` up to `max`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay to wait before attempt `attempt` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl From<&RealtimeConfig> for Backoff {
    fn from(config: &RealtimeConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_backoff_ms),
            Duration::from_millis(config.reconnect_backoff_max_ms),
        )
    }
}

/// [`ChangeTransport`] over Postgres notifications.
#[derive(Clone)]
pub struct PgNotifyTransport {
    pool: PgPool,
    backoff: Backoff,
}

impl std::fmt::Debug for PgNotifyTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNotifyTransport")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl PgNotifyTransport {
    /// Creates a transport listening through connections from `pool`.
    #[must_use]
    pub fn new(pool: PgPool, config: &RealtimeConfig) -> Self {
        Self {
            pool,
            backoff: Backoff::from(config),
        }
    }
}

async fn listen(pool: &PgPool, table: ChangeTable) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(table.as_str()).await?;
    Ok(listener)
}

#[async_trait]
impl ChangeTransport for PgNotifyTransport {
    #[instrument(name = "transport.subscribe", skip(self, table, sink, shutdown), fields(table = %table))]
    async fn subscribe(
        &self,
        table: ChangeTable,
        sink: mpsc::UnboundedSender<TransportSignal>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let listener = listen(&self.pool, table)
            .await
            .map_err(|err| TransportError::Subscribe {
                table,
                reason: err.to_string(),
            })?;

        tokio::spawn(pump(
            self.pool.clone(),
            table,
            listener,
            sink,
            shutdown,
            self.backoff,
        ));
        Ok(())
    }
}

async fn pump(
    pool: PgPool,
    table: ChangeTable,
    mut listener: PgListener,
    sink: mpsc::UnboundedSender<TransportSignal>,
    shutdown: CancellationToken,
    backoff: Backoff,
) {
    loop {
        let received = tokio::select! {
            () = shutdown.cancelled() => break,
            received = listener.try_recv() => received,
        };

        match received {
            Ok(Some(notification)) => {
                let payload = match serde_json::from_str::<Value>(notification.payload()) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(table = %table, error = %err, "notification payload is not JSON");
                        continue;
                    }
                };
                if sink
                    .send(TransportSignal::Change(RawChange { table, payload }))
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                warn!(table = %table, "listener connection lost");
                let Some(fresh) = reconnect(&pool, table, backoff, &shutdown).await else {
                    break;
                };
                listener = fresh;
                if sink.send(TransportSignal::Reconnected).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(table = %table, error = %err, "listener error");
                let Some(fresh) = reconnect(&pool, table, backoff, &shutdown).await else {
                    break;
                };
                listener = fresh;
                if sink.send(TransportSignal::Reconnected).is_err() {
                    break;
                }
            }
        }
    }

    debug!(table = %table, "listener closed");
}

async fn reconnect(
    pool: &PgPool,
    table: ChangeTable,
    backoff: Backoff,
    shutdown: &CancellationToken,
) -> Option<PgListener> {
    let mut attempt = 0;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return None,
            () = tokio::time::sleep(backoff.delay(attempt)) => {}
        }

        match listen(pool, table).await {
            Ok(listener) => {
                info!(table = %table, attempt, "listener reconnected");
                return Some(listener);
            }
            Err(err) => {
                warn!(table = %table, attempt, error = %err, "listener reconnect failed");
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_ceiling() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_millis(1000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_ceiling_never_below_initial() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_millis(10));
        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(5), Duration::from_millis(500));
    }

    #[test]
    fn backoff_follows_config() {
        let config = RealtimeConfig {
            reconnect_backoff_ms: 20,
            reconnect_backoff_max_ms: 50,
            ..RealtimeConfig::default()
        };

        let backoff = Backoff::from(&config);
        assert_eq!(backoff.delay(0), Duration::from_millis(20));
        assert_eq!(backoff.delay(2), Duration::from_millis(50));
    }
}
