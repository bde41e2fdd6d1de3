//! SyncEngine - drives polling, merging and reconnection
//!
//! One actor owns the write side of the snapshot and the action tracker, so
//! merges are naturally serialized. Fetch I/O runs on spawned tasks; their
//! results come back over an internal channel and are merged on the actor
//! task.
//!
//! ## Message Flow
//!
//! ```text
//! Ticker tasks ──ticks──▶ SyncEngine ──spawn──▶ fetch task ──▶ backend
//!                             ▲                      │
//!                             └──────outcomes────────┘
//!                             │
//!                       merge + diff ──▶ broadcast Event ──▶ [UI, ActionTracker, ...]
//! ```
//!
//! ## Scheduling rules
//!
//! - at most one in-flight fetch per resource type; a tick while a fetch is
//!   running is dropped, never queued
//! - on first connect, every resource is fetched once in priority order
//!   before the periodic tickers take over
//! - while disconnected, ticks are ignored and a fixed-interval reconnect
//!   timer re-runs login; success triggers a full refresh

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, instrument, trace, warn};

use crate::client::BackendClient;
use crate::config::Config;
use crate::engine::actions::{ActionKind, ActionTracker, PendingAction};
use crate::engine::messages::{EngineCommand, Event};
use crate::error::BackendError;
use crate::fetch::{Decoded, Resource, decode_page};
use crate::store::{ReadyState, StoreHandle};

/// Result of one spawned fetch task
struct FetchOutcome {
    resource: Resource,
    result: Result<Decoded, BackendError>,
}

/// Fetch one resource and decode the page. Used both by the spawned fetch
/// tasks and by the inline startup/refresh path.
async fn fetch_resource(
    client: &BackendClient,
    resource: Resource,
) -> Result<Decoded, BackendError> {
    let token = client.session().await.token;
    let page = client
        .get(
            resource.endpoint(),
            resource.where_filter(&token).as_ref(),
            resource.projection(),
        )
        .await?;

    Ok(decode_page(resource, &page))
}

/// Actor that owns the snapshot and drives all polling
pub struct SyncEngine {
    client: BackendClient,

    store: StoreHandle,

    /// Pending user actions, reconciled after every merge
    actions: ActionTracker,

    /// Command receiver for control messages
    command_rx: mpsc::Receiver<EngineCommand>,

    /// Broadcast sender for publishing events
    event_tx: broadcast::Sender<Event>,

    /// Ticks from the per-resource ticker tasks
    tick_rx: mpsc::Receiver<Resource>,

    outcome_tx: mpsc::Sender<FetchOutcome>,
    outcome_rx: mpsc::Receiver<FetchOutcome>,

    /// Resources with a fetch currently running
    in_flight: HashSet<Resource>,

    reconnect_interval: Duration,
}

impl SyncEngine {
    /// Run the actor's main loop
    ///
    /// This is the entry point for the engine. It runs until:
    /// - a Shutdown command is received
    /// - the command channel is closed
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting sync engine");

        match self.client.login().await {
            Ok(()) => self.full_refresh().await,
            Err(e) => {
                error!("initial login failed: {e}");
                let _ = self.event_tx.send(Event::Disconnected {
                    reason: e.to_string(),
                });
            }
        }

        let mut reconnect = interval(self.reconnect_interval);
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Action timeouts must fire even when no snapshot changes arrive
        let mut housekeeping = interval(Duration::from_secs(1));
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(resource) = self.tick_rx.recv() => {
                    self.handle_tick(resource).await;
                }

                Some(outcome) = self.outcome_rx.recv() => {
                    self.handle_outcome(outcome).await;
                }

                _ = reconnect.tick() => {
                    if !self.client.is_connected().await {
                        match self.client.reconnect().await {
                            Ok(()) => self.full_refresh().await,
                            Err(e) => trace!("reconnect attempt failed: {e}"),
                        }
                    }
                }

                _ = housekeeping.tick() => {
                    self.actions.expire();
                }

                Some(cmd) = self.command_rx.recv() => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("sync engine stopped");
    }

    /// Periodic tick for one resource. Ignored while disconnected (timers
    /// are effectively paused) or while a fetch for the same resource is
    /// still running.
    async fn handle_tick(&mut self, resource: Resource) {
        if !self.client.is_connected().await {
            trace!("disconnected, dropping tick for {resource}");
            return;
        }

        if self.in_flight.contains(&resource) {
            trace!("fetch for {resource} still in flight, dropping tick");
            return;
        }

        self.spawn_fetch(resource);
    }

    fn spawn_fetch(&mut self, resource: Resource) {
        self.in_flight.insert(resource);

        let client = self.client.clone();
        let outcome_tx = self.outcome_tx.clone();

        tokio::spawn(async move {
            let result = fetch_resource(&client, resource).await;
            let _ = outcome_tx.send(FetchOutcome { resource, result }).await;
        });
    }

    async fn handle_outcome(&mut self, outcome: FetchOutcome) {
        self.in_flight.remove(&outcome.resource);

        match outcome.result {
            Ok(decoded) => self.merge_and_publish(outcome.resource, decoded).await,
            Err(e) => {
                // Disconnect signaling already happened in the client; the
                // previous snapshot rows stay as they are.
                warn!(
                    "fetch for {} failed, keeping previous data: {e}",
                    outcome.resource
                );
            }
        }
    }

    async fn merge_and_publish(&mut self, resource: Resource, decoded: Decoded) {
        if decoded.skipped > 0 {
            warn!("{resource}: skipped {} undecodable records", decoded.skipped);
        }

        let Some(change) = self.store.merge(resource, decoded).await else {
            trace!("merge of {resource} changed nothing");
            return;
        };

        let _ = self.event_tx.send(Event::SnapshotChanged {
            resource: change.resource,
            diff: change.diff,
            counters: change.counters,
        });

        self.actions.reconcile().await;
    }

    /// Fetch every resource once, in priority order, each merge completing
    /// before the next fetch starts. Runs after first login and after every
    /// reconnect.
    #[instrument(skip(self))]
    async fn full_refresh(&mut self) {
        for resource in Resource::PRIORITY_ORDER {
            if self.in_flight.contains(&resource) {
                trace!("{resource} already being fetched, skipping in refresh");
                continue;
            }

            match fetch_resource(&self.client, resource).await {
                Ok(decoded) => self.merge_and_publish(resource, decoded).await,
                Err(BackendError::Disconnected) => {
                    warn!("connection lost during full refresh, aborting");
                    return;
                }
                Err(e) => warn!("refresh of {resource} failed: {e}"),
            }

            if !self.client.is_connected().await {
                warn!("connection lost during full refresh, aborting");
                return;
            }
        }
    }

    /// Returns true when the engine should shut down
    async fn handle_command(&mut self, cmd: EngineCommand) -> bool {
        match cmd {
            EngineCommand::RefreshNow {
                resource,
                respond_to,
            } => {
                debug!("received RefreshNow command for {resource:?}");
                let result = match resource {
                    Some(resource) => self.refresh_one(resource).await,
                    None => {
                        self.full_refresh().await;
                        Ok(())
                    }
                };
                let _ = respond_to.send(result);
            }

            EngineCommand::SubmitAction {
                kind,
                host_id,
                service_id,
                comment,
                respond_to,
            } => {
                let result = self.actions.submit(kind, host_id, service_id, comment).await;
                let _ = respond_to.send(result);
            }

            EngineCommand::ReadyState { respond_to } => {
                let _ = respond_to.send(self.store.ready_state().await);
            }

            EngineCommand::Shutdown => {
                debug!("received shutdown command");
                return true;
            }
        }

        false
    }

    async fn refresh_one(&mut self, resource: Resource) -> anyhow::Result<()> {
        if self.in_flight.contains(&resource) {
            // Same guard as for ticks: never two fetches of one type at once
            anyhow::bail!("a fetch for {resource} is already in flight");
        }

        let decoded = fetch_resource(&self.client, resource).await?;
        self.merge_and_publish(resource, decoded).await;
        Ok(())
    }
}

/// Handle for controlling a running [`SyncEngine`]
///
/// Cheap to clone and shareable across tasks; all communication goes over
/// the engine's command channel.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
    event_tx: broadcast::Sender<Event>,
    store: StoreHandle,
}

impl EngineHandle {
    /// Spawn the engine and its ticker tasks, returning a handle.
    ///
    /// The engine logs in with the configured credentials and performs the
    /// initial full refresh on its own; use [`EngineHandle::wait_ready`] to
    /// block until the snapshot is complete enough for a first render.
    pub fn spawn(config: Config) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (tick_tx, tick_rx) = mpsc::channel(32);
        let (outcome_tx, outcome_rx) = mpsc::channel(32);

        let store = StoreHandle::new();
        let client = BackendClient::new(&config, event_tx.clone());
        let actions = ActionTracker::new(
            client.clone(),
            store.clone(),
            event_tx.clone(),
            config.action_timeout(),
        );

        for resource in Resource::PRIORITY_ORDER {
            let tick_tx = tick_tx.clone();
            let cadence = config.intervals.cadence(resource);

            tokio::spawn(async move {
                let mut ticker = interval(cadence);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The immediate first tick is covered by the startup refresh
                ticker.tick().await;

                loop {
                    ticker.tick().await;
                    if tick_tx.send(resource).await.is_err() {
                        break;
                    }
                }
            });
        }

        let engine = SyncEngine {
            client,
            store: store.clone(),
            actions,
            command_rx: cmd_rx,
            event_tx: event_tx.clone(),
            tick_rx,
            outcome_tx,
            outcome_rx,
            in_flight: HashSet::new(),
            reconnect_interval: config.reconnect_interval(),
        };

        tokio::spawn(engine.run());

        Self {
            sender: cmd_tx,
            event_tx,
            store,
        }
    }

    /// Subscribe to the engine's event stream
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Read-only view over the snapshot
    pub fn store(&self) -> StoreHandle {
        self.store.clone()
    }

    /// Fetch and merge immediately, bypassing the interval timers.
    ///
    /// `None` refreshes every resource in priority order.
    pub async fn refresh_now(&self, resource: Option<Resource>) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::RefreshNow {
                resource,
                respond_to: tx,
            })
            .await
            .context("failed to send RefreshNow command")?;

        rx.await.context("failed to receive response")?
    }

    /// Submit an acknowledge or downtime for a host (or one of its
    /// services). Failures surface here immediately; only a successfully
    /// posted action becomes pending.
    pub async fn submit_action(
        &self,
        kind: ActionKind,
        host_id: impl Into<String>,
        service_id: Option<String>,
        comment: Option<String>,
    ) -> anyhow::Result<PendingAction> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::SubmitAction {
                kind,
                host_id: host_id.into(),
                service_id,
                comment,
                respond_to: tx,
            })
            .await
            .context("failed to send SubmitAction command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn ready_state(&self) -> anyhow::Result<ReadyState> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::ReadyState { respond_to: tx })
            .await
            .context("failed to send ReadyState command")?;

        rx.await.context("failed to receive response")
    }

    /// Block until every resource required for a first render has merged at
    /// least once, or fail after `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> anyhow::Result<()> {
        let mut events = self.subscribe();

        tokio::time::timeout(timeout, async {
            loop {
                if self.store.ready_state().await == ReadyState::Ready {
                    return;
                }
                // Wake on the next event, or after a short pause in case
                // events were dropped
                let _ = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("snapshot not ready within {timeout:?}"))
    }

    /// Gracefully shut down the engine
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.sender
            .send(EngineCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
