//! The synchronization engine
//!
//! The engine runs as an independent async task communicating via Tokio
//! channels, decoupled from any rendering loop.
//!
//! ## Architecture Overview
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │   EngineHandle   │  (clone per consumer)
//!                  └────────┬─────────┘
//!                           │ commands (mpsc)
//!                  ┌────────▼─────────┐     ticks      ┌───────────────┐
//!                  │    SyncEngine    │◀───────────────│ ticker tasks  │
//!                  │  (owns Store +   │                │ (per resource)│
//!                  │   ActionTracker) │                └───────────────┘
//!                  └────────┬─────────┘
//!                           │ spawns fetch tasks ──▶ BackendClient ──▶ REST API
//!                           │
//!                  ┌────────▼─────────┐
//!                  │ Broadcast (MPMC) │  SnapshotChanged / Disconnected /
//!                  └────────┬─────────┘  Reconnected / ActionCompleted / ...
//!                           │ subscribe
//!              ┌────────────┼────────────┐
//!              ▼            ▼            ▼
//!          UI layer    demo binary     tests
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: the engine has an mpsc command channel for control
//!    messages, answered over oneshot channels
//! 2. **Events**: published to a broadcast channel for fan-out
//! 3. **Outcomes**: fetch tasks report back over an internal mpsc so the
//!    actor task performs every merge itself

pub mod actions;
pub mod messages;
pub mod scheduler;
