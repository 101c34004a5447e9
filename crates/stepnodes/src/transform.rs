use crate::action::ActionHandler;
use async_trait::async_trait;
use stepcore::{NodeContext, NodeError, NodeOutput, Value, Variables};

fn string_param<'a>(params: &'a Variables, field: &str) -> Result<&'a str, NodeError> {
    params
        .get(field)
        .ok_or_else(|| NodeError::MissingVariable(field.to_string()))?
        .as_str()
        .ok_or_else(|| NodeError::InvalidInputType {
            field: field.to_string(),
            expected: "string".to_string(),
            actual: "other".to_string(),
        })
}

/// Optional `into` parameter: also store the result under this variable
fn store_into(params: &Variables, output: NodeOutput, value: Value) -> NodeOutput {
    match params.get("into").and_then(|v| v.as_str()) {
        Some(name) if !name.is_empty() => output.with_variable(name, value),
        _ => output,
    }
}

/// `json.parse`: parse the `json` string parameter
pub struct JsonParse;

#[async_trait]
impl ActionHandler for JsonParse {
    fn name(&self) -> &str {
        "json.parse"
    }

    fn description(&self) -> &str {
        "Parse JSON string"
    }

    async fn call(&self, params: &Variables, _ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        let input = string_param(params, "json")?;
        let parsed: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;
        let parsed = Value::from(parsed);

        Ok(store_into(
            params,
            NodeOutput::new().with_output(parsed.clone()),
            parsed,
        ))
    }
}

/// `json.stringify`: serialize the `value` parameter
pub struct JsonStringify;

#[async_trait]
impl ActionHandler for JsonStringify {
    fn name(&self) -> &str {
        "json.stringify"
    }

    fn description(&self) -> &str {
        "Convert value to JSON string"
    }

    async fn call(&self, params: &Variables, _ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        let value = params
            .get("value")
            .ok_or_else(|| NodeError::MissingVariable("value".to_string()))?;
        let pretty = params.get("pretty").and_then(|v| v.as_bool()).unwrap_or(false);

        let json = if pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(store_into(
            params,
            NodeOutput::new().with_output(json.clone()),
            Value::String(json),
        ))
    }
}

/// `variables.set`: merge the `values` object into the context
pub struct SetVariables;

#[async_trait]
impl ActionHandler for SetVariables {
    fn name(&self) -> &str {
        "variables.set"
    }

    fn description(&self) -> &str {
        "Set workflow variables"
    }

    async fn call(&self, params: &Variables, _ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        let values = match params.get("values") {
            Some(Value::Object(values)) => values,
            Some(_) => {
                return Err(NodeError::InvalidInputType {
                    field: "values".to_string(),
                    expected: "object".to_string(),
                    actual: "other".to_string(),
                })
            }
            None => return Err(NodeError::MissingVariable("values".to_string())),
        };

        let mut output = NodeOutput::new().with_output(Value::Object(values.clone()));
        for (key, value) in values {
            output = output.with_variable(key.clone(), value.clone());
        }
        Ok(output)
    }
}
