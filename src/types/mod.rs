//! Core domain types shared across the engine.

pub mod event;
pub mod ids;

pub use event::{Event, EventType};
pub use ids::{ActorId, EventId, Fingerprint, HookName, RouteName, SourceId};
