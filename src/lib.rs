pub mod client;
pub mod config;
pub mod engine;
pub mod entities;
pub mod error;
pub mod fetch;
pub mod store;

pub use client::BackendClient;
pub use engine::actions::{ActionKind, PendingAction};
pub use engine::messages::Event;
pub use engine::scheduler::EngineHandle;
pub use entities::{Entity, EntityKind, EntityState, HostState, ServiceState};
pub use fetch::Resource;
pub use store::{Counters, ReadyState, SnapshotDiff, StoreHandle};
