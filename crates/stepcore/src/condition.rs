use crate::value::{resolve_path, Value, Variables};
use crate::NodeError;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Comparison applied between a context field and a literal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    /// Substring for strings, membership for arrays, key presence for objects
    Contains,
    /// Regular expression match against the field's text form
    Matches,
}

/// `field <operator> value`, evaluated against the live execution context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::Equals, value)
    }

    pub fn greater_than(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::GreaterThan, value)
    }

    pub fn less_than(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, ConditionOperator::LessThan, value)
    }

    /// Static checks that do not depend on the context.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.field.trim().is_empty() {
            return Err(NodeError::Configuration("condition field is empty".into()));
        }
        if self.operator == ConditionOperator::Matches {
            self.pattern()?;
        }
        Ok(())
    }

    /// Evaluate against `variables`. A missing field compares as `null`.
    pub fn evaluate(&self, variables: &Variables) -> Result<bool, NodeError> {
        let null = Value::Null;
        let left = resolve_path(variables, &self.field).unwrap_or(&null);
        let right = &self.value;

        let result = match self.operator {
            ConditionOperator::Equals => loosely_equal(left, right),
            ConditionOperator::NotEquals => !loosely_equal(left, right),
            ConditionOperator::GreaterThan => compare(left, right, |l, r| l > r),
            ConditionOperator::LessThan => compare(left, right, |l, r| l < r),
            ConditionOperator::Contains => contains(left, right),
            ConditionOperator::Matches => {
                !left.is_null() && self.pattern()?.is_match(&left.to_string())
            }
        };
        Ok(result)
    }

    fn pattern(&self) -> Result<Regex, NodeError> {
        let source = self.value.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: self.field.clone(),
            expected: "pattern string".to_string(),
            actual: self.value.to_string(),
        })?;
        Regex::new(source)
            .map_err(|e| NodeError::Configuration(format!("invalid pattern '{}': {}", source, e)))
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            matches!((left.to_number(), right.to_number()), (Some(l), Some(r)) if l == r)
        }
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (left.to_number(), right.to_number()) {
        (Some(l), Some(r)) => op(l, r),
        _ => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => op(l.cmp(r) as i8 as f64, 0.0),
            _ => false,
        },
    }
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::String(s) => s.contains(&right.to_string()),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, right)),
        Value::Object(map) => right.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

/// How a list of conditions combines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

impl MatchMode {
    pub fn evaluate(&self, conditions: &[Condition], variables: &Variables) -> Result<bool, NodeError> {
        match self {
            MatchMode::All => {
                for condition in conditions {
                    if !condition.evaluate(variables)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            MatchMode::Any => {
                for condition in conditions {
                    if condition.evaluate(variables)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn numeric_comparisons() {
        let ctx = vars(&[("x", Value::Number(15.0))]);
        assert!(Condition::greater_than("x", 10.0).evaluate(&ctx).unwrap());
        assert!(!Condition::less_than("x", 10.0).evaluate(&ctx).unwrap());
        assert!(Condition::equals("x", 15i64).evaluate(&ctx).unwrap());
        assert!(Condition::equals("x", "15").evaluate(&ctx).unwrap());
    }

    #[test]
    fn missing_field_is_null() {
        let ctx = Variables::new();
        assert!(Condition::equals("ghost", Value::Null).evaluate(&ctx).unwrap());
        assert!(!Condition::greater_than("ghost", 1.0).evaluate(&ctx).unwrap());
        assert!(Condition::new("ghost", ConditionOperator::NotEquals, "x")
            .evaluate(&ctx)
            .unwrap());
    }

    #[test]
    fn contains_and_matches() {
        let ctx = vars(&[
            ("name", Value::from("release-2024")),
            ("tags", Value::Array(vec!["prod".into(), "eu".into()])),
        ]);
        let contains = |field: &str, v: &str| {
            Condition::new(field, ConditionOperator::Contains, v).evaluate(&ctx).unwrap()
        };
        assert!(contains("name", "2024"));
        assert!(contains("tags", "eu"));
        assert!(!contains("tags", "us"));

        let matches = Condition::new("name", ConditionOperator::Matches, r"^release-\d{4}$");
        assert!(matches.evaluate(&ctx).unwrap());
    }

    #[test]
    fn bad_pattern_fails_validation() {
        let cond = Condition::new("name", ConditionOperator::Matches, "([");
        assert!(matches!(cond.validate(), Err(NodeError::Configuration(_))));
        assert!(Condition::equals("", 1i64).validate().is_err());
    }

    #[test]
    fn match_modes() {
        let ctx = vars(&[("a", Value::Number(1.0)), ("b", Value::Number(2.0))]);
        let conds = vec![Condition::equals("a", 1i64), Condition::equals("b", 3i64)];
        assert!(!MatchMode::All.evaluate(&conds, &ctx).unwrap());
        assert!(MatchMode::Any.evaluate(&conds, &ctx).unwrap());
    }
}
