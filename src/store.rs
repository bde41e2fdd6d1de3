//! In-memory snapshot of the latest-known entities
//!
//! The [`Store`] is the single authoritative mapping from `(kind, id)` to
//! entity. Merges replace all entities of a resource type wholesale (daemons
//! upsert by identity, since a daemon role absent from a poll simply
//! reported nothing this cycle). Every merge recomputes the aggregate
//! counters and yields the diff against the previous snapshot of that type;
//! an idempotent merge yields nothing.
//!
//! Reads hand out point-in-time copies, so consumers never observe a merge
//! in progress and never hold iterators into live data.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::entities::{Entity, EntityKind, EntityState, HostState, ServiceState};
use crate::fetch::{Decoded, Resource, SynthesisCounters};

/// Host state counts derived from the snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostCounters {
    pub up: usize,
    pub down: usize,
    pub unreachable: usize,
    pub acknowledged: usize,
    pub downtimed: usize,
}

/// Service state counts derived from the snapshot (orphans excluded)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceCounters {
    pub ok: usize,
    pub warning: usize,
    pub critical: usize,
    pub unknown: usize,
    pub unreachable: usize,
    pub acknowledged: usize,
    pub downtimed: usize,
}

/// Aggregate counters, recomputed on every merge. Never stored apart from
/// the snapshot they were derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub hosts: HostCounters,
    pub services: ServiceCounters,
    /// Hosts and services in a bad state, neither acknowledged nor downtimed
    pub problems: usize,
}

/// Symmetric difference between the old and new snapshot of one resource
/// type. `changed` holds the new version of entities whose `state`,
/// `acknowledged` or `downtimed` flag moved.
#[derive(Debug, Clone, Default)]
pub struct SnapshotDiff {
    pub added: Vec<Entity>,
    pub removed: Vec<Entity>,
    pub changed: Vec<Entity>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Outcome of a merge that actually changed something
#[derive(Debug, Clone)]
pub struct SnapshotChange {
    pub resource: Resource,
    pub diff: SnapshotDiff,
    pub counters: Counters,
}

/// Whether enough resources have merged for a first render
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyState {
    NotReady,
    /// Resources still missing their first successful merge
    Partial(Vec<Resource>),
    Ready,
}

/// Resources that must merge at least once before the snapshot counts as
/// ready. History is informational and not required for a first render.
const REQUIRED_FOR_READY: [Resource; 5] = [
    Resource::User,
    Resource::Hosts,
    Resource::Services,
    Resource::Daemons,
    Resource::LiveSynthesis,
];

#[derive(Debug, Default)]
pub struct Store {
    entities: HashMap<(EntityKind, String), Entity>,
    counters: Counters,
    /// Counters as reported by the backend itself, kept separate from the
    /// locally derived ones
    synthesis: Option<SynthesisCounters>,
    merged: HashSet<Resource>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one decoded poll result.
    ///
    /// Returns `Some` with the diff and fresh counters when the snapshot
    /// actually changed, `None` for an idempotent merge. Either way the
    /// resource counts as merged for readiness.
    pub fn merge(&mut self, resource: Resource, decoded: Decoded) -> Option<SnapshotChange> {
        self.merged.insert(resource);

        if resource == Resource::LiveSynthesis {
            return self.merge_synthesis(decoded.synthesis.unwrap_or_default());
        }

        let kind = resource
            .kind()
            .expect("every resource except livesynthesis has an entity kind");

        let diff = self.apply_entities(kind, decoded.entities, resource != Resource::Daemons);

        let old_counters = self.counters;
        self.counters = self.compute_counters();

        if diff.is_empty() && self.counters == old_counters {
            return None;
        }

        debug!(
            "merged {resource}: +{} -{} ~{}",
            diff.added.len(),
            diff.removed.len(),
            diff.changed.len()
        );

        Some(SnapshotChange {
            resource,
            diff,
            counters: self.counters,
        })
    }

    fn merge_synthesis(&mut self, synthesis: SynthesisCounters) -> Option<SnapshotChange> {
        if self.synthesis == Some(synthesis) {
            return None;
        }
        self.synthesis = Some(synthesis);

        Some(SnapshotChange {
            resource: Resource::LiveSynthesis,
            diff: SnapshotDiff::default(),
            counters: self.counters,
        })
    }

    /// Replace (or for daemons, upsert) all entities of a kind and compute
    /// the diff against what was there before.
    fn apply_entities(
        &mut self,
        kind: EntityKind,
        new_entities: Vec<Entity>,
        remove_missing: bool,
    ) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        let mut seen: HashSet<String> = HashSet::with_capacity(new_entities.len());

        for entity in new_entities {
            seen.insert(entity.id.clone());
            let key = (kind, entity.id.clone());

            match self.entities.get(&key) {
                None => diff.added.push(entity.clone()),
                Some(old) => {
                    if old.state != entity.state
                        || old.acknowledged != entity.acknowledged
                        || old.downtimed != entity.downtimed
                    {
                        diff.changed.push(entity.clone());
                    }
                }
            }

            self.entities.insert(key, entity);
        }

        if remove_missing {
            let stale: Vec<(EntityKind, String)> = self
                .entities
                .keys()
                .filter(|(k, id)| *k == kind && !seen.contains(id))
                .cloned()
                .collect();

            for key in stale {
                if let Some(old) = self.entities.remove(&key) {
                    diff.removed.push(old);
                }
            }
        }

        diff
    }

    fn compute_counters(&self) -> Counters {
        let mut counters = Counters::default();

        for entity in self.entities.values() {
            match entity.state {
                EntityState::Host(state) => {
                    match state {
                        HostState::Up => counters.hosts.up += 1,
                        HostState::Down => counters.hosts.down += 1,
                        HostState::Unreachable | HostState::Unknown => {
                            counters.hosts.unreachable += 1
                        }
                    }
                    if entity.acknowledged {
                        counters.hosts.acknowledged += 1;
                    }
                    if entity.downtimed {
                        counters.hosts.downtimed += 1;
                    }
                    if entity.is_problem() {
                        counters.problems += 1;
                    }
                }
                EntityState::Service(state) => {
                    if self.is_orphan(entity) {
                        continue;
                    }
                    match state {
                        ServiceState::Ok => counters.services.ok += 1,
                        ServiceState::Warning => counters.services.warning += 1,
                        ServiceState::Critical => counters.services.critical += 1,
                        ServiceState::Unknown => counters.services.unknown += 1,
                        ServiceState::Unreachable => counters.services.unreachable += 1,
                    }
                    if entity.acknowledged {
                        counters.services.acknowledged += 1;
                    }
                    if entity.downtimed {
                        counters.services.downtimed += 1;
                    }
                    if entity.is_problem() {
                        counters.problems += 1;
                    }
                }
                EntityState::Daemon(_) | EntityState::None => {}
            }
        }

        counters
    }

    /// A service whose owning host is not in the snapshot. Still queryable,
    /// but excluded from counters and the problem list.
    fn is_orphan(&self, entity: &Entity) -> bool {
        match (&entity.kind, &entity.host_id) {
            (EntityKind::Service, Some(host_id)) => !self
                .entities
                .contains_key(&(EntityKind::Host, host_id.clone())),
            (EntityKind::Service, None) => true,
            _ => false,
        }
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&Entity> {
        self.entities.get(&(kind, id.to_string()))
    }

    pub fn get_all(&self, kind: EntityKind) -> Vec<Entity> {
        self.entities
            .values()
            .filter(|entity| entity.kind == kind)
            .cloned()
            .collect()
    }

    /// First entity of `kind` whose field equals `value`.
    ///
    /// Field values are not guaranteed unique (host aliases, for example);
    /// when several entities match, which one is returned is unspecified.
    /// Matches `name` and any raw backend field.
    pub fn find_by(&self, kind: EntityKind, field: &str, value: &str) -> Option<&Entity> {
        self.entities.values().find(|entity| {
            entity.kind == kind
                && (field == "name" && entity.name == value
                    || entity.raw.get(field).and_then(Value::as_str) == Some(value))
        })
    }

    /// Hosts and services currently in a bad state, neither acknowledged
    /// nor downtimed. Recomputed on every call; the flags can change
    /// between merges.
    pub fn problems(&self) -> Vec<Entity> {
        self.entities
            .values()
            .filter(|entity| {
                matches!(entity.kind, EntityKind::Host | EntityKind::Service)
                    && entity.is_problem()
                    && !self.is_orphan(entity)
            })
            .cloned()
            .collect()
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn synthesis(&self) -> Option<SynthesisCounters> {
        self.synthesis
    }

    pub fn ready_state(&self) -> ReadyState {
        let missing: Vec<Resource> = REQUIRED_FOR_READY
            .into_iter()
            .filter(|resource| !self.merged.contains(resource))
            .collect();

        if missing.is_empty() {
            ReadyState::Ready
        } else if missing.len() == REQUIRED_FOR_READY.len() {
            ReadyState::NotReady
        } else {
            ReadyState::Partial(missing)
        }
    }
}

/// Cloneable, read-only view over the shared store.
///
/// The engine holds the same `Arc` and serializes all merges on its own
/// task; consumers get point-in-time copies and never block a merge for
/// long.
#[derive(Clone, Default)]
pub struct StoreHandle {
    inner: Arc<RwLock<Store>>,
}

impl StoreHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, Store> {
        self.inner.read().await
    }

    pub(crate) async fn merge(
        &self,
        resource: Resource,
        decoded: Decoded,
    ) -> Option<SnapshotChange> {
        self.inner.write().await.merge(resource, decoded)
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        self.inner.read().await.get(kind, id).cloned()
    }

    pub async fn get_all(&self, kind: EntityKind) -> Vec<Entity> {
        self.inner.read().await.get_all(kind)
    }

    pub async fn find_by(&self, kind: EntityKind, field: &str, value: &str) -> Option<Entity> {
        self.inner.read().await.find_by(kind, field, value).cloned()
    }

    pub async fn problems(&self) -> Vec<Entity> {
        self.inner.read().await.problems()
    }

    pub async fn counters(&self) -> Counters {
        self.inner.read().await.counters()
    }

    pub async fn synthesis(&self) -> Option<SynthesisCounters> {
        self.inner.read().await.synthesis()
    }

    pub async fn ready_state(&self) -> ReadyState {
        self.inner.read().await.ready_state()
    }
}
