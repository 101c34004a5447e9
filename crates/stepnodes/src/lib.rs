//! Standard node library
//!
//! Executors for the built-in node kinds plus the action handlers that
//! `action` nodes dispatch to.

mod action;
mod branch;
mod control;
mod debug;
mod http;
mod looping;
mod time;
mod transform;

pub use action::{render_params, ActionExecutor, ActionHandler, FnAction};
pub use branch::{ConditionExecutor, DecisionExecutor};
pub use control::{EndExecutor, MergeExecutor, ParallelExecutor, StartExecutor};
pub use debug::DebugLog;
pub use http::HttpRequest;
pub use looping::LoopExecutor;
pub use time::DelayExecutor;
pub use transform::{JsonParse, JsonStringify, SetVariables};

use std::sync::Arc;
use stepruntime::ExecutorRegistry;

/// Register all built-in executors, with the built-in actions
pub fn register_all(registry: &mut ExecutorRegistry) {
    register_with_actions(registry, ActionExecutor::with_builtins());
}

/// Register all built-in executors, using `actions` for `action` nodes
pub fn register_with_actions(registry: &mut ExecutorRegistry, actions: ActionExecutor) {
    registry.register(Arc::new(StartExecutor));
    registry.register(Arc::new(EndExecutor));
    registry.register(Arc::new(actions));
    registry.register(Arc::new(DecisionExecutor));
    registry.register(Arc::new(ConditionExecutor));
    registry.register(Arc::new(LoopExecutor));
    registry.register(Arc::new(ParallelExecutor));
    registry.register(Arc::new(MergeExecutor));
    registry.register(Arc::new(DelayExecutor));
}

/// A registry holding every built-in executor
pub fn standard_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    register_all(&mut registry);
    registry
}
