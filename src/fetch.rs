//! Per-resource query models and response decoders
//!
//! Each [`Resource`] declares the endpoint it polls, the projection (field
//! allow-list) it requests and how raw backend records map to [`Entity`]
//! values. Decoding is total: a malformed record is logged and skipped,
//! never aborting the whole batch.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::client::ItemsPage;
use crate::entities::{
    DaemonState, Entity, EntityKind, EntityState, HostState, ServiceState,
};
use crate::error::DecodeError;

/// The resource types the engine polls, each on its own cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    User,
    Hosts,
    Services,
    Daemons,
    LiveSynthesis,
    History,
}

impl Resource {
    /// Fixed fetch order for the initial full refresh, chosen so the user
    /// (needed for action submission) and host/service status land before
    /// the slower informational resources.
    pub const PRIORITY_ORDER: [Resource; 6] = [
        Resource::User,
        Resource::Hosts,
        Resource::Services,
        Resource::Daemons,
        Resource::LiveSynthesis,
        Resource::History,
    ];

    pub fn endpoint(&self) -> &'static str {
        match self {
            Resource::User => "user",
            Resource::Hosts => "host",
            Resource::Services => "service",
            Resource::Daemons => "alignakdaemon",
            Resource::LiveSynthesis => "livesynthesis",
            Resource::History => "history",
        }
    }

    /// Field allow-list sent as the `projection` query parameter
    pub fn projection(&self) -> &'static [&'static str] {
        match self {
            Resource::User => &["name", "alias", "token", "can_submit_commands"],
            Resource::Hosts => &[
                "name",
                "alias",
                "ls_state",
                "ls_acknowledged",
                "ls_downtimed",
                "ls_last_check",
                "ls_output",
                "address",
                "business_impact",
                "_overall_state_id",
            ],
            Resource::Services => &[
                "name",
                "alias",
                "display_name",
                "host",
                "ls_state",
                "ls_acknowledged",
                "ls_downtimed",
                "ls_last_check",
                "ls_output",
                "business_impact",
                "aggregation",
            ],
            Resource::Daemons => &[
                "name", "type", "alive", "reachable", "spare", "address", "port", "passive",
                "last_check",
            ],
            Resource::LiveSynthesis => &[],
            Resource::History => &["host", "service_name", "message", "type"],
        }
    }

    /// `where` filter for the GET, if the resource needs one. The user
    /// resource is looked up by the session token.
    pub fn where_filter(&self, token: &str) -> Option<Value> {
        match self {
            Resource::User => Some(json!({ "token": token })),
            Resource::Hosts | Resource::Services => Some(json!({ "_is_template": false })),
            Resource::Daemons | Resource::LiveSynthesis | Resource::History => None,
        }
    }

    /// Entity kind produced by this resource; `LiveSynthesis` produces only
    /// counters, no entities.
    pub fn kind(&self) -> Option<EntityKind> {
        match self {
            Resource::User => Some(EntityKind::User),
            Resource::Hosts => Some(EntityKind::Host),
            Resource::Services => Some(EntityKind::Service),
            Resource::Daemons => Some(EntityKind::Daemon),
            Resource::LiveSynthesis => None,
            Resource::History => Some(EntityKind::History),
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

/// Host and service state counts as reported by the backend itself, summed
/// over all realms. Kept separate from the locally derived [`crate::store::Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SynthesisCounters {
    pub hosts_up: u64,
    pub hosts_down: u64,
    pub hosts_unreachable: u64,
    pub hosts_acknowledged: u64,
    pub hosts_in_downtime: u64,
    pub services_ok: u64,
    pub services_warning: u64,
    pub services_critical: u64,
    pub services_unknown: u64,
    pub services_unreachable: u64,
    pub services_acknowledged: u64,
    pub services_in_downtime: u64,
}

/// Result of decoding one fetched page
#[derive(Debug, Clone, Default)]
pub struct Decoded {
    pub entities: Vec<Entity>,
    pub synthesis: Option<SynthesisCounters>,
    /// Records skipped because they could not be decoded
    pub skipped: usize,
}

/// Decode a fetched page into entities (or synthesis counters).
///
/// Individual record failures are logged at `warn!` and counted in
/// `skipped`; they never fail the batch.
pub fn decode_page(resource: Resource, page: &ItemsPage) -> Decoded {
    if resource == Resource::LiveSynthesis {
        return Decoded {
            synthesis: Some(decode_synthesis(&page.items)),
            ..Decoded::default()
        };
    }

    let mut decoded = Decoded::default();
    for item in &page.items {
        let result = match resource {
            Resource::User => decode_user(item),
            Resource::Hosts => decode_host(item),
            Resource::Services => decode_service(item),
            Resource::Daemons => decode_daemon(item),
            Resource::History => decode_history(item),
            Resource::LiveSynthesis => unreachable!("handled above"),
        };

        match result {
            Ok(entity) => decoded.entities.push(entity),
            Err(e) => {
                warn!("skipping record from {resource}: {e}");
                decoded.skipped += 1;
            }
        }
    }

    decoded
}

fn str_field<'a>(
    item: &'a Value,
    field: &str,
    kind: &'static str,
) -> Result<&'a str, DecodeError> {
    item.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::new(kind, format!("missing or non-string `{field}`")))
}

fn bool_field(item: &Value, field: &str) -> bool {
    item.get(field).and_then(Value::as_bool).unwrap_or(false)
}

fn opt_string(item: &Value, field: &str) -> Option<String> {
    item.get(field)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

/// Backend timestamps are unix seconds; 0 means "never checked"
fn timestamp_field(item: &Value, field: &str) -> Option<DateTime<Utc>> {
    let secs = item.get(field).and_then(Value::as_i64)?;
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}

fn raw_fields(item: &Value) -> Map<String, Value> {
    item.as_object().cloned().unwrap_or_default()
}

fn decode_host(item: &Value) -> Result<Entity, DecodeError> {
    let id = str_field(item, "_id", "host")?.to_string();
    let name = str_field(item, "name", "host")?.to_string();
    let state = item
        .get("ls_state")
        .and_then(Value::as_str)
        .map(HostState::parse)
        .unwrap_or(HostState::Unknown);

    Ok(Entity {
        id,
        kind: EntityKind::Host,
        name,
        alias: opt_string(item, "alias"),
        state: EntityState::Host(state),
        acknowledged: bool_field(item, "ls_acknowledged"),
        downtimed: bool_field(item, "ls_downtimed"),
        last_check: timestamp_field(item, "ls_last_check"),
        host_id: None,
        raw: raw_fields(item),
    })
}

fn decode_service(item: &Value) -> Result<Entity, DecodeError> {
    let id = str_field(item, "_id", "service")?.to_string();
    let name = str_field(item, "name", "service")?.to_string();
    let host_id = str_field(item, "host", "service")?.to_string();
    let state = item
        .get("ls_state")
        .and_then(Value::as_str)
        .map(ServiceState::parse)
        .unwrap_or(ServiceState::Unknown);

    Ok(Entity {
        id,
        kind: EntityKind::Service,
        name,
        alias: opt_string(item, "alias"),
        state: EntityState::Service(state),
        acknowledged: bool_field(item, "ls_acknowledged"),
        downtimed: bool_field(item, "ls_downtimed"),
        last_check: timestamp_field(item, "ls_last_check"),
        host_id: Some(host_id),
        raw: raw_fields(item),
    })
}

fn decode_user(item: &Value) -> Result<Entity, DecodeError> {
    let id = str_field(item, "_id", "user")?.to_string();
    let name = str_field(item, "name", "user")?.to_string();

    Ok(Entity {
        id,
        kind: EntityKind::User,
        name,
        alias: opt_string(item, "alias"),
        state: EntityState::None,
        acknowledged: false,
        downtimed: false,
        last_check: None,
        host_id: None,
        raw: raw_fields(item),
    })
}

fn decode_daemon(item: &Value) -> Result<Entity, DecodeError> {
    let name = str_field(item, "name", "daemon")?.to_string();
    // Daemon records may not carry an `_id` with the fixed projection; the
    // daemon name is unique within a backend and serves as identity.
    let id = opt_string(item, "_id").unwrap_or_else(|| name.clone());
    let alive = bool_field(item, "alive");
    let reachable = bool_field(item, "reachable");

    let role = opt_string(item, "type");
    if let Some(role) = &role
        && !crate::entities::DAEMON_ROLES.contains(&role.as_str())
    {
        warn!("daemon {name} reports unknown role `{role}`");
    }

    Ok(Entity {
        id,
        kind: EntityKind::Daemon,
        name,
        alias: role,
        state: EntityState::Daemon(DaemonState::from_flags(alive, reachable)),
        acknowledged: false,
        downtimed: false,
        last_check: timestamp_field(item, "last_check"),
        host_id: None,
        raw: raw_fields(item),
    })
}

fn decode_history(item: &Value) -> Result<Entity, DecodeError> {
    let id = str_field(item, "_id", "history")?.to_string();
    let event_type = str_field(item, "type", "history")?.to_string();

    Ok(Entity {
        id,
        kind: EntityKind::History,
        name: event_type,
        alias: None,
        state: EntityState::None,
        acknowledged: false,
        downtimed: false,
        last_check: None,
        host_id: opt_string(item, "host"),
        raw: raw_fields(item),
    })
}

fn synthesis_pair(realm: &Value, field: &str) -> u64 {
    // The backend splits every state counter into soft and hard
    let soft = realm
        .get(format!("{field}_soft"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let hard = realm
        .get(format!("{field}_hard"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    soft + hard
}

fn synthesis_plain(realm: &Value, field: &str) -> u64 {
    realm.get(field).and_then(Value::as_u64).unwrap_or(0)
}

fn decode_synthesis(realms: &[Value]) -> SynthesisCounters {
    let mut counters = SynthesisCounters::default();

    for realm in realms {
        counters.hosts_up += synthesis_pair(realm, "hosts_up");
        counters.hosts_down += synthesis_pair(realm, "hosts_down");
        counters.hosts_unreachable += synthesis_pair(realm, "hosts_unreachable");
        counters.hosts_acknowledged += synthesis_plain(realm, "hosts_acknowledged");
        counters.hosts_in_downtime += synthesis_plain(realm, "hosts_in_downtime");

        counters.services_ok += synthesis_pair(realm, "services_ok");
        counters.services_warning += synthesis_pair(realm, "services_warning");
        counters.services_critical += synthesis_pair(realm, "services_critical");
        counters.services_unknown += synthesis_pair(realm, "services_unknown");
        counters.services_unreachable += synthesis_pair(realm, "services_unreachable");
        counters.services_acknowledged += synthesis_plain(realm, "services_acknowledged");
        counters.services_in_downtime += synthesis_plain(realm, "services_in_downtime");
    }

    counters
}
