//! Monitored entity model
//!
//! Everything the backend reports is normalized into an [`Entity`]: a stable
//! id, a kind, a per-kind state and the acknowledge/downtime flags. Entities
//! are replaced wholesale on each poll of their resource type, never patched
//! field by field.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of a monitored entity. Identity of an entity is `(kind, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Host,
    Service,
    User,
    Daemon,
    History,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Host => "host",
            EntityKind::Service => "service",
            EntityKind::User => "user",
            EntityKind::Daemon => "daemon",
            EntityKind::History => "history",
        };
        write!(f, "{s}")
    }
}

/// Live state of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostState {
    Up,
    Down,
    Unreachable,
    Unknown,
}

impl HostState {
    /// Parse a backend `ls_state` string. Anything unrecognized maps to
    /// `Unknown` so a new backend state never breaks decoding.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "UP" => HostState::Up,
            "DOWN" => HostState::Down,
            "UNREACHABLE" => HostState::Unreachable,
            _ => HostState::Unknown,
        }
    }
}

/// Live state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceState {
    Ok,
    Warning,
    Critical,
    Unknown,
    Unreachable,
}

impl ServiceState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "OK" => ServiceState::Ok,
            "WARNING" => ServiceState::Warning,
            "CRITICAL" => ServiceState::Critical,
            "UNREACHABLE" => ServiceState::Unreachable,
            _ => ServiceState::Unknown,
        }
    }
}

/// State of a backend daemon, derived from its `alive`/`reachable` flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DaemonState {
    Alive,
    Unreachable,
    Dead,
}

impl DaemonState {
    pub fn from_flags(alive: bool, reachable: bool) -> Self {
        match (alive, reachable) {
            (true, true) => DaemonState::Alive,
            (true, false) => DaemonState::Unreachable,
            (false, _) => DaemonState::Dead,
        }
    }
}

/// The six fixed daemon roles of the backend framework
pub const DAEMON_ROLES: [&str; 6] = [
    "poller",
    "receiver",
    "reactionner",
    "arbiter",
    "scheduler",
    "broker",
];

/// Per-kind entity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Host(HostState),
    Service(ServiceState),
    Daemon(DaemonState),
    /// Users and history rows have no live state
    None,
}

/// A monitored object as last reported by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Backend `_id`, stable and unique within the kind
    pub id: String,
    pub kind: EntityKind,
    /// Backend `name`
    pub name: String,
    /// Backend `alias`, preferred for display when present
    pub alias: Option<String>,
    pub state: EntityState,
    pub acknowledged: bool,
    pub downtimed: bool,
    pub last_check: Option<DateTime<Utc>>,
    /// Owning host, set for services and history rows
    pub host_id: Option<String>,
    /// Fields carried through verbatim for consumers that need more than the
    /// normalized view (`ls_output`, `address`, `business_impact`, ...)
    pub raw: Map<String, Value>,
}

impl Entity {
    /// Alias if the backend provided one, else the name.
    pub fn display_name(&self) -> &str {
        match &self.alias {
            Some(alias) if !alias.is_empty() => alias,
            _ => &self.name,
        }
    }

    /// An entity is a problem iff its state is in its kind's bad-state set
    /// and it is neither acknowledged nor downtimed.
    ///
    /// Computed per call: the flags can change between snapshot merges, so
    /// the result is never cached.
    pub fn is_problem(&self) -> bool {
        if self.acknowledged || self.downtimed {
            return false;
        }

        match self.state {
            EntityState::Host(state) => {
                matches!(state, HostState::Down | HostState::Unreachable)
            }
            EntityState::Service(state) => matches!(
                state,
                ServiceState::Warning | ServiceState::Critical | ServiceState::Unknown
            ),
            EntityState::Daemon(state) => {
                matches!(state, DaemonState::Dead | DaemonState::Unreachable)
            }
            EntityState::None => false,
        }
    }
}
