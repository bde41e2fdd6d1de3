//! Message types for the synchronization engine
//!
//! Two flavors, following the command/event split used throughout the
//! actor loop:
//!
//! 1. **Commands**: request/response messages sent to the engine via mpsc,
//!    with oneshot channels for the answers
//! 2. **Events**: broadcast notifications fanned out to every subscriber
//!    (UI layers, the demo binary, tests)
//!
//! Events are cloneable; a slow subscriber may lag and drop events, which is
//! acceptable because the snapshot itself is always queryable.

use tokio::sync::oneshot;

use crate::engine::actions::{ActionKind, PendingAction};
use crate::fetch::Resource;
use crate::store::{Counters, ReadyState, SnapshotDiff};

/// Notifications published by the engine and the backend client
#[derive(Debug, Clone)]
pub enum Event {
    /// A merge changed the snapshot of one resource type
    SnapshotChanged {
        resource: Resource,
        diff: SnapshotDiff,
        counters: Counters,
    },

    /// Connection to the backend was lost. Emitted exactly once per
    /// disconnect episode; polling is suspended until `Reconnected`.
    Disconnected { reason: String },

    /// The reconnect loop logged in again; a full refresh follows
    Reconnected,

    /// A submitted action is now visible in the snapshot
    ActionCompleted(PendingAction),

    /// A submitted action saw no snapshot confirmation within the timeout
    ActionTimedOut(PendingAction),
}

/// Commands that can be sent to the engine
#[derive(Debug)]
pub enum EngineCommand {
    /// Fetch and merge immediately, bypassing the interval timers.
    ///
    /// `None` refreshes every resource in priority order. Used by tests and
    /// manual refresh operations.
    RefreshNow {
        resource: Option<Resource>,
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },

    /// Submit an acknowledge or downtime to the backend
    SubmitAction {
        kind: ActionKind,
        host_id: String,
        service_id: Option<String>,
        comment: Option<String>,
        respond_to: oneshot::Sender<anyhow::Result<PendingAction>>,
    },

    /// Query whether the snapshot is complete enough for a first render
    ReadyState {
        respond_to: oneshot::Sender<ReadyState>,
    },

    /// Gracefully shut down the engine
    Shutdown,
}
