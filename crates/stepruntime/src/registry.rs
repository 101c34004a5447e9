use stepcore::{NodeError, NodeExecutor, NodeSchema};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available node kinds
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor under its kind, replacing any previous one
    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        let kind = executor.kind().to_string();
        if self.executors.insert(kind.clone(), executor).is_some() {
            tracing::debug!("Replaced executor for node kind: {}", kind);
        } else {
            tracing::info!("Registering node kind: {}", kind);
        }
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn NodeExecutor>, NodeError> {
        self.executors
            .get(kind)
            .cloned()
            .ok_or_else(|| NodeError::UnknownKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.executors.contains_key(kind)
    }

    /// All registered kinds, sorted
    pub fn list_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.executors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn schema(&self, kind: &str) -> Option<NodeSchema> {
        self.executors.get(kind).map(|e| e.schema())
    }
}
