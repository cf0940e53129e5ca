//! Step completion estimates
//!
//! Pure functions over a step payload and the required field paths the
//! schema declares for it. No storage access.

use crate::flow::paths::lookup;
use crate::flow::{EstimationFlow, StepSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionCategory {
    Empty,
    Partial,
    Complete,
}

/// How much of a step's required input is filled in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCompletion {
    pub step_id: String,
    /// Filled required fields / all required fields, in `[0, 1]`
    pub ratio: f64,
    pub category: CompletionCategory,
}

/// Estimate completion of one step
///
/// `required_fields` are paths relative to the payload. A step with no
/// required fields counts as complete.
pub fn estimate(step_id: &str, payload: Option<&Value>, required_fields: &[String]) -> StepCompletion {
    if required_fields.is_empty() {
        return StepCompletion {
            step_id: step_id.to_string(),
            ratio: 1.0,
            category: CompletionCategory::Complete,
        };
    }

    let filled = required_fields
        .iter()
        .filter(|field| {
            let segments: Vec<&str> = field.split('.').collect();
            payload
                .and_then(|root| lookup(root, &segments))
                .is_some_and(is_filled)
        })
        .count();

    let ratio = filled as f64 / required_fields.len() as f64;
    let category = if filled == 0 {
        CompletionCategory::Empty
    } else if filled == required_fields.len() {
        CompletionCategory::Complete
    } else {
        CompletionCategory::Partial
    };

    StepCompletion {
        step_id: step_id.to_string(),
        ratio,
        category,
    }
}

/// Completion of every step of a flow, in schema order
pub fn estimate_flow(schema: &StepSchema, flow: &EstimationFlow) -> Vec<StepCompletion> {
    schema
        .steps
        .iter()
        .map(|step| estimate(&step.id, flow.step_data.get(&step.id), &step.required))
        .collect()
}

fn is_filled(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn required(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn one_of_three_is_partial() {
        let payload = json!({ "materials": 500, "labor": "", "equipment": null });
        let result = estimate("expenses", Some(&payload), &required(&["materials", "labor", "equipment"]));
        assert!((result.ratio - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.category, CompletionCategory::Partial);
    }

    #[test]
    fn missing_payload_is_empty() {
        let result = estimate("expenses", None, &required(&["materials"]));
        assert_eq!(result.ratio, 0.0);
        assert_eq!(result.category, CompletionCategory::Empty);
    }

    #[test]
    fn nested_required_fields_and_zero_values_count() {
        let payload = json!({ "labor": { "hours": 0, "rate": 45 }, "notes": [] });
        let result = estimate("expenses", Some(&payload), &required(&["labor.hours", "labor.rate"]));
        assert_eq!(result.category, CompletionCategory::Complete);

        let result = estimate("expenses", Some(&payload), &required(&["notes"]));
        assert_eq!(result.category, CompletionCategory::Empty);
    }

    #[test]
    fn no_required_fields_is_complete() {
        let result = estimate("review", None, &[]);
        assert_eq!(result.ratio, 1.0);
        assert_eq!(result.category, CompletionCategory::Complete);
    }
}
