use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use stepcore::{
    resolve_path, NodeConfig, NodeContext, NodeError, NodeExecutor, NodeOutput, NodeSchema,
    NodeValidation, Value, Variables, WorkflowNode,
};

/// A named operation run by `action` nodes
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Run with the node's parameters, templates already rendered
    async fn call(&self, params: &Variables, ctx: &NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Adapts an async closure into an [`ActionHandler`]
pub struct FnAction<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnAction<F>
where
    F: Fn(Variables, NodeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutput, NodeError>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> ActionHandler for FnAction<F>
where
    F: Fn(Variables, NodeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutput, NodeError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, params: &Variables, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        (self.f)(params.clone(), ctx.clone()).await
    }
}

/// Executor for `action` nodes: dispatches to a handler by name
#[derive(Clone, Default)]
pub struct ActionExecutor {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor preloaded with the built-in actions
    pub fn with_builtins() -> Self {
        Self::new()
            .with_handler(crate::debug::DebugLog)
            .with_handler(crate::http::HttpRequest::new())
            .with_handler(crate::transform::JsonParse)
            .with_handler(crate::transform::JsonStringify)
            .with_handler(crate::transform::SetVariables)
    }

    pub fn with_handler(mut self, handler: impl ActionHandler + 'static) -> Self {
        self.register(Arc::new(handler));
        self
    }

    /// Add a handler, replacing any with the same name
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        let name = handler.name().to_string();
        tracing::debug!("Registering action: {}", name);
        self.handlers.insert(name, handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered action names, sorted
    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl NodeExecutor for ActionExecutor {
    fn kind(&self) -> &str {
        "action"
    }

    async fn execute(&self, node: &WorkflowNode, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Action { action, params } = &node.config else {
            return Err(NodeError::Configuration(format!(
                "node {} is not an action node",
                node.id
            )));
        };
        let handler = self.handlers.get(action).ok_or_else(|| {
            NodeError::Configuration(format!("no handler registered for action '{}'", action))
        })?;

        let params = render_params(params, &ctx.variables);
        tracing::debug!("Running action {} for node {}", action, node.id);
        handler.call(&params, &ctx).await
    }

    fn validate(&self, node: &WorkflowNode) -> NodeValidation {
        let mut report = NodeValidation::default();
        if let NodeConfig::Action { action, .. } = &node.config {
            if action.trim().is_empty() {
                report.error("action name is required");
            } else if !self.contains(action) {
                report.warn(format!("no handler registered for action '{}'", action));
            }
        }
        report
    }

    fn schema(&self) -> NodeSchema {
        let mut schema = NodeSchema::new("action")
            .with_description("Run a named action with parameters")
            .with_category("action")
            .with_field("action", "name of the action handler", true)
            .with_field("params", "parameters; {{path}} templates read the context", false);
        for name in self.actions() {
            let description = self
                .handlers
                .get(&name)
                .map(|h| h.description().to_string())
                .unwrap_or_default();
            schema = schema.with_field(format!("action:{}", name), description, false);
        }
        schema
    }
}

fn template() -> Option<&'static Regex> {
    static TEMPLATE: OnceLock<Option<Regex>> = OnceLock::new();
    TEMPLATE
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").ok())
        .as_ref()
}

/// Substitute `{{path}}` templates in parameter strings.
///
/// A string that is exactly one template takes the referenced value as is;
/// templates embedded in longer text are replaced by the value's text. Missing
/// paths render as `null` and the empty string respectively.
pub fn render_params(params: &Variables, variables: &Variables) -> Variables {
    params
        .iter()
        .map(|(key, value)| (key.clone(), render_value(value, variables)))
        .collect()
}

fn render_value(value: &Value, variables: &Variables) -> Value {
    match value {
        Value::String(text) => render_text(text, variables),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, variables)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_text(text: &str, variables: &Variables) -> Value {
    let Some(pattern) = template() else {
        return Value::String(text.to_string());
    };
    if let Some(caps) = pattern.captures(text) {
        if caps.get(0).is_some_and(|m| m.as_str() == text.trim()) {
            return resolve_path(variables, &caps[1]).cloned().unwrap_or_default();
        }
    } else {
        return Value::String(text.to_string());
    }

    let rendered = pattern.replace_all(text, |caps: &regex::Captures| {
        resolve_path(variables, &caps[1])
            .map(|v| v.to_string())
            .unwrap_or_default()
    });
    Value::String(rendered.into_owned())
}
