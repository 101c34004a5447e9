// crates/stepcore/src/events/mod.rs

mod base;

pub use base::{EngineEvent, EventBus, EventEmitter, EventMessage, ExecutionId, NodeEvent};
