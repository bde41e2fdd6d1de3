//! Tracking of user-submitted actions until the backend confirms them
//!
//! An acknowledge or downtime POST succeeds long before the monitoring
//! framework actually processes it; the flag only shows up in a later
//! snapshot. The tracker keeps each submitted action pending until the
//! target entity's flag flips (reported exactly once as `ActionCompleted`)
//! or the timeout passes (`ActionTimedOut`, also exactly once).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::client::BackendClient;
use crate::engine::messages::Event;
use crate::entities::EntityKind;
use crate::store::StoreHandle;

/// Kind of action a user can submit against a host or service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Acknowledge,
    Downtime,
}

impl ActionKind {
    pub fn endpoint(&self) -> &'static str {
        match self {
            ActionKind::Acknowledge => "actionacknowledge",
            ActionKind::Downtime => "actiondowntime",
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            ActionKind::Acknowledge => "acknowledged",
            ActionKind::Downtime => "scheduled for downtime",
        }
    }
}

/// A submitted action awaiting confirmation in a later snapshot
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub kind: ActionKind,
    pub host_id: String,
    /// When set, the action targets this service; otherwise the host itself
    pub service_id: Option<String>,
    pub comment: String,
    pub submitted_at: DateTime<Utc>,
}

impl PendingAction {
    /// Whether the target entity in the snapshot confirms this action
    fn confirmed_by(&self, store: &crate::store::Store) -> bool {
        let entity = match &self.service_id {
            Some(service_id) => store.get(EntityKind::Service, service_id),
            None => store.get(EntityKind::Host, &self.host_id),
        };

        let Some(entity) = entity else {
            return false;
        };

        match self.kind {
            ActionKind::Acknowledge => entity.acknowledged,
            ActionKind::Downtime => entity.downtimed,
        }
    }
}

pub struct ActionTracker {
    client: BackendClient,
    store: StoreHandle,
    event_tx: broadcast::Sender<Event>,
    pending: Vec<PendingAction>,
    timeout: Duration,
}

impl ActionTracker {
    pub fn new(
        client: BackendClient,
        store: StoreHandle,
        event_tx: broadcast::Sender<Event>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            store,
            event_tx,
            pending: Vec::new(),
            timeout,
        }
    }

    pub fn pending(&self) -> &[PendingAction] {
        &self.pending
    }

    /// Submit an action to the backend.
    ///
    /// The POST happens immediately; a failure (backend unreachable, user
    /// not allowed to submit commands) is returned to the caller right away
    /// and nothing is tracked.
    #[instrument(skip(self, comment))]
    pub async fn submit(
        &mut self,
        kind: ActionKind,
        host_id: String,
        service_id: Option<String>,
        comment: Option<String>,
    ) -> anyhow::Result<PendingAction> {
        let user = self
            .store
            .get_all(EntityKind::User)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no user in snapshot yet, cannot submit"))?;

        let can_submit = user
            .raw
            .get("can_submit_commands")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !can_submit {
            anyhow::bail!("user {} is not allowed to submit commands", user.name);
        }

        let comment = comment
            .unwrap_or_else(|| format!("{} by {}, from the notifier", kind.verb(), user.name));

        let mut data = json!({
            "action": "add",
            "host": host_id,
            "service": service_id,
            "user": user.id,
            "comment": comment,
        });

        if kind == ActionKind::Downtime {
            let start = Utc::now();
            let end = start + chrono::Duration::days(1);
            data["start_time"] = json!(start.timestamp());
            data["end_time"] = json!(end.timestamp());
            data["fixed"] = json!(true);
        }

        self.client.post(kind.endpoint(), &data).await?;

        let action = PendingAction {
            kind,
            host_id,
            service_id,
            comment,
            submitted_at: Utc::now(),
        };

        debug!(
            "submitted {:?} for host {} (service {:?})",
            action.kind, action.host_id, action.service_id
        );
        self.pending.push(action.clone());

        Ok(action)
    }

    /// Check every pending action against the current snapshot. Called
    /// after each merge that changed the snapshot.
    pub async fn reconcile(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let confirmed = {
            let store = self.store.read().await;
            self.pending
                .iter()
                .map(|action| action.confirmed_by(&store))
                .collect::<Vec<_>>()
        };

        let mut index = 0;
        self.pending.retain(|action| {
            let done = confirmed[index];
            index += 1;
            if done {
                debug!("action confirmed by snapshot: {action:?}");
                let _ = self.event_tx.send(Event::ActionCompleted(action.clone()));
            }
            !done
        });

        self.expire();
    }

    /// Drop pending actions older than the timeout, reporting each once.
    /// Also driven by a coarse ticker so timeouts fire even when no
    /// snapshot changes arrive.
    pub fn expire(&mut self) {
        let deadline = Utc::now()
            - chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::seconds(300));

        self.pending.retain(|action| {
            let expired = action.submitted_at < deadline;
            if expired {
                warn!("action saw no backend confirmation in time: {action:?}");
                let _ = self.event_tx.send(Event::ActionTimedOut(action.clone()));
            }
            !expired
        });
    }
}
