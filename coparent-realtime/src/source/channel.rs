//! In-process transport fed by the caller.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ChangeTable, ChangeTransport, RawChange, TransportError, TransportSignal};

/// Transport whose changes are pushed by hand, for tests and embedders
/// that already receive backend changes through another path.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    sinks: Mutex<HashMap<ChangeTable, mpsc::UnboundedSender<TransportSignal>>>,
}

impl ChannelTransport {
    /// Creates a transport with no subscriptions.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delivers `payload` as a change on `table`. Returns `false` when
    /// nobody is subscribed to the table.
    pub fn emit(&self, table: ChangeTable, payload: Value) -> bool {
        self.send(table, TransportSignal::Change(RawChange { table, payload }))
    }

    /// Reports that `table`'s subscription dropped and came back.
    pub fn reconnect(&self, table: ChangeTable) -> bool {
        self.send(table, TransportSignal::Reconnected)
    }

    /// Whether a live subscription exists for `table`.
    #[must_use]
    pub fn is_subscribed(&self, table: ChangeTable) -> bool {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&table)
            .is_some_and(|sink| !sink.is_closed())
    }

    /// Drops every subscription as if the backend went away for good.
    pub fn close_all(&self) {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn send(&self, table: ChangeTable, signal: TransportSignal) -> bool {
        let sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        sinks
            .get(&table)
            .is_some_and(|sink| sink.send(signal).is_ok())
    }
}

#[async_trait]
impl ChangeTransport for ChannelTransport {
    async fn subscribe(
        &self,
        table: ChangeTable,
        sink: mpsc::UnboundedSender<TransportSignal>,
        _shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table, sink);
        Ok(())
    }
}
