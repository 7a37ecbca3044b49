#![cfg_attr(not(test), forbid(unsafe_code))]

//! Realtime change fan-out and unread-count reconciliation.
//!
//! [`RealtimeHub`] subscribes to backend row changes through a
//! [`ChangeTransport`], keeps the viewer's unread counts in an
//! [`UnreadAggregator`] and pushes every change, plus refreshed
//! [`UnreadState`](shared::models::UnreadState) snapshots, to the callbacks
//! held by a [`CallbackRegistry`].

pub mod aggregator;
pub mod consumers;
pub mod db;
pub mod error;
pub mod hub;
pub mod registry;
pub mod source;
pub mod store;
pub mod tracer;

pub use aggregator::UnreadAggregator;
pub use error::{HubError, HubResult};
pub use hub::{HubState, RealtimeHub};
pub use registry::{CallbackRegistry, Channel, DispatchReport, Disposer, SubscriptionId};
pub use source::{
    ChangeEventSource, ChangeTable, ChangeTransport, ChannelTransport, PgNotifyTransport,
    SourceEvent, TransportError,
};
pub use store::{
    PgUnreadCountStore, StoreError, StoreResult, UnreadCountStore, UnreadMessageRef, UnreadSnapshot,
    ViewerScope,
};
