use super::TriggerTask;
use async_trait::async_trait;
use std::sync::Arc;
use stepcore::{ConditionTrigger, MatchMode, Value, Variables};
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Where condition triggers read the state they poll
#[async_trait]
pub trait ConditionSource: Send + Sync {
    async fn snapshot(&self) -> Variables;
}

/// In-memory fact store polled by condition triggers
#[derive(Clone, Default)]
pub struct FactStore {
    facts: Arc<RwLock<Variables>>,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.facts.write().await.insert(key.into(), value.into());
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.facts.write().await.remove(key)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.facts.read().await.get(key).cloned()
    }

    pub async fn clear(&self) {
        self.facts.write().await.clear();
    }
}

#[async_trait]
impl ConditionSource for FactStore {
    async fn snapshot(&self) -> Variables {
        self.facts.read().await.clone()
    }
}

/// Counts consecutive matching polls; fires once the run is long enough
#[derive(Debug, Clone)]
pub struct ConditionTracker {
    required: u32,
    consecutive: u32,
}

impl ConditionTracker {
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            consecutive: 0,
        }
    }

    /// Record one poll. Returns `true` when the trigger should fire, after
    /// which the count starts over.
    pub fn observe(&mut self, matched: bool) -> bool {
        if !matched {
            self.consecutive = 0;
            return false;
        }
        self.consecutive += 1;
        if self.consecutive >= self.required {
            self.consecutive = 0;
            true
        } else {
            false
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

pub(crate) async fn run(task: TriggerTask, spec: ConditionTrigger, source: Arc<dyn ConditionSource>) {
    let mut tracker = ConditionTracker::new(spec.consecutive_matches);
    let mut ticker = interval(Duration::from_millis(spec.poll_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = task.cancel.cancelled() => return,
        }

        let snapshot = source.snapshot().await;
        let matched = match MatchMode::All.evaluate(&spec.conditions, &snapshot) {
            Ok(matched) => matched,
            Err(e) => {
                task.report(format!("condition evaluation failed: {}", e));
                false
            }
        };

        if tracker.observe(matched) {
            task.fire(snapshot).await;
        } else if matched {
            tracing::debug!(
                "Trigger {} matched {}/{} polls",
                task.trigger.id,
                tracker.consecutive(),
                spec.consecutive_matches
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_on_third_consecutive_match() {
        let mut tracker = ConditionTracker::new(3);
        assert!(!tracker.observe(true));
        assert!(!tracker.observe(true));
        assert!(tracker.observe(true));
        // counter starts over after firing
        assert!(!tracker.observe(true));
    }

    #[test]
    fn a_miss_resets_the_run() {
        let mut tracker = ConditionTracker::new(2);
        assert!(!tracker.observe(true));
        assert!(!tracker.observe(false));
        assert!(!tracker.observe(true));
        assert!(tracker.observe(true));
    }

    #[test]
    fn zero_required_behaves_like_one() {
        let mut tracker = ConditionTracker::new(0);
        assert!(tracker.observe(true));
    }

    #[tokio::test]
    async fn fact_store_snapshot_reflects_writes() {
        let facts = FactStore::new();
        facts.set("temperature", 72i64).await;
        facts.set("door", "open").await;
        facts.remove("door").await;

        let snapshot = facts.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(facts.get("temperature").await, Some(Value::Number(72.0)));
    }
}
