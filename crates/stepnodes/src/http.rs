use crate::action::ActionHandler;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use stepcore::{NodeContext, NodeError, NodeOutput, Value, Variables};

/// `http.request`: performs an HTTP call.
///
/// Parameters: `url` (required), `method` (GET), `headers` (object), `body`
/// (object/array sent as JSON, anything else as text), `timeout_ms`, and
/// `error_for_status` to fail on 4xx/5xx responses.
pub struct HttpRequest {
    client: reqwest::Client,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for HttpRequest {
    fn name(&self) -> &str {
        "http.request"
    }

    fn description(&self) -> &str {
        "Make HTTP requests"
    }

    async fn call(&self, params: &Variables, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        let url = params
            .get("url")
            .ok_or_else(|| NodeError::MissingVariable("url".to_string()))?
            .as_str()
            .ok_or_else(|| NodeError::InvalidInputType {
                field: "url".to_string(),
                expected: "string".to_string(),
                actual: "other".to_string(),
            })?;
        let method = params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();

        ctx.events.info(format!("{} {}", method, url));

        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "PATCH" => self.client.patch(url),
            "DELETE" => self.client.delete(url),
            _ => return Err(NodeError::Configuration(format!("Unsupported method: {}", method))),
        };

        if let Some(Value::Object(headers)) = params.get("headers") {
            for (key, value) in headers {
                request = request.header(key, value.to_string());
            }
        }

        match params.get("body") {
            None | Some(Value::Null) => {}
            Some(body @ (Value::Object(_) | Value::Array(_))) => {
                request = request.json(&serde_json::Value::from(body.clone()));
            }
            Some(other) => {
                request = request.body(other.to_string());
            }
        }

        if let Some(ms) = params.get("timeout_ms").and_then(|v| v.to_number()) {
            request = request.timeout(Duration::from_millis(ms as u64));
        }

        let response = request
            .send()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let headers: HashMap<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        ctx.events.info(format!("Response status: {}", status.as_u16()));

        let error_for_status = params
            .get("error_for_status")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if error_for_status && (status.is_client_error() || status.is_server_error()) {
            return Err(NodeError::ExecutionFailed(format!(
                "{} {} returned {}",
                method, url, status
            )));
        }

        // JSON bodies come back structured
        let body = serde_json::from_str::<serde_json::Value>(&text)
            .map(Value::from)
            .unwrap_or(Value::String(text));

        let mut output = HashMap::new();
        output.insert("status".to_string(), Value::from(status.as_u16() as u64));
        output.insert("body".to_string(), body);
        output.insert("headers".to_string(), Value::Object(headers));
        Ok(NodeOutput::new().with_output(Value::Object(output)))
    }
}
