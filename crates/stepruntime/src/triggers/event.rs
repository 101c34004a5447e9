use super::TriggerTask;
use stepcore::{Condition, EventFilter, EventMessage, EventTrigger, Variables};
use tokio::sync::broadcast::{self, error::RecvError};

/// Whether `payload` passes the trigger's optional equality filter
pub fn matches_filter(filter: Option<&EventFilter>, payload: &Variables) -> bool {
    match filter {
        None => true,
        Some(filter) => Condition::equals(filter.field.clone(), filter.equals.clone())
            .evaluate(payload)
            .unwrap_or(false),
    }
}

pub(crate) async fn run(task: TriggerTask, spec: EventTrigger, mut messages: broadcast::Receiver<EventMessage>) {
    loop {
        let received = tokio::select! {
            received = messages.recv() => received,
            _ = task.cancel.cancelled() => return,
        };

        match received {
            Ok(message) => {
                if message.channel != spec.channel {
                    continue;
                }
                if !matches_filter(spec.filter.as_ref(), &message.payload) {
                    tracing::debug!("Trigger {} filtered out event on {}", task.trigger.id, message.channel);
                    continue;
                }
                task.fire(message.payload).await;
            }
            Err(RecvError::Lagged(missed)) => {
                task.report(format!("subscriber lagged, {} events dropped", missed));
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepcore::Value;

    #[test]
    fn filter_compares_payload_field() {
        let filter = EventFilter {
            field: "order.region".into(),
            equals: Value::from("eu"),
        };
        let mut order = std::collections::HashMap::new();
        order.insert("region".to_string(), Value::from("eu"));
        let mut payload = Variables::new();
        payload.insert("order".into(), Value::Object(order));

        assert!(matches_filter(Some(&filter), &payload));
        assert!(!matches_filter(Some(&filter), &Variables::new()));
        assert!(matches_filter(None, &Variables::new()));
    }
}
