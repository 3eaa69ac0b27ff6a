//! Controller Runtime
//!
//! Versioned resource store, the controller contract and the engine that
//! schedules controllers on store events.

pub mod controller;
pub mod engine;
pub mod state;
pub mod trigger;

pub use controller::{
    restart_backoff, Controller, ControllerRuntime, Input, InputKind, Output, OutputKind,
};
pub use engine::{Engine, RuntimeConfig};
pub use state::{EventKind, Metadata, Phase, Resource, ResourceKey, State, StateEvent};
pub use trigger::{EventTrigger, RateLimitedTrigger, DEFAULT_WATCH_WINDOW};
