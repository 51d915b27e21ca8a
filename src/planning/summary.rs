//! Size-bounded JSON summaries of execution results

use super::ExecutionResult;
use crate::utils::text::truncate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Bounds applied when summarizing results for a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryLimits {
    pub max_depth: usize,
    pub max_string_len: usize,
    pub max_array_items: usize,
    pub max_object_keys: usize,
    /// Upper bound for the whole rendered summary
    pub max_total_chars: usize,
}

impl Default for SummaryLimits {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_string_len: 2000,
            max_array_items: 20,
            max_object_keys: 40,
            max_total_chars: 24_000,
        }
    }
}

impl SummaryLimits {
    const FLOOR: SummaryLimits = SummaryLimits {
        max_depth: 1,
        max_string_len: 64,
        max_array_items: 1,
        max_object_keys: 4,
        max_total_chars: 0,
    };

    /// Halve every bound, never going below the floor
    fn tightened(&self) -> Self {
        Self {
            max_depth: (self.max_depth.saturating_sub(1)).max(Self::FLOOR.max_depth),
            max_string_len: (self.max_string_len / 2).max(Self::FLOOR.max_string_len),
            max_array_items: (self.max_array_items / 2).max(Self::FLOOR.max_array_items),
            max_object_keys: (self.max_object_keys / 2).max(Self::FLOOR.max_object_keys),
            max_total_chars: self.max_total_chars,
        }
    }

    fn at_floor(&self) -> bool {
        self.max_depth == Self::FLOOR.max_depth
            && self.max_string_len == Self::FLOOR.max_string_len
            && self.max_array_items == Self::FLOOR.max_array_items
            && self.max_object_keys == Self::FLOOR.max_object_keys
    }
}

/// Copy of `value` with depth, string, array and object bounds applied.
/// Anything cut off is replaced by a descriptive marker string.
pub fn bound_value(value: &Value, limits: &SummaryLimits) -> Value {
    bound_at(value, limits, 0)
}

fn bound_at(value: &Value, limits: &SummaryLimits, depth: usize) -> Value {
    match value {
        Value::String(s) => {
            let len = s.chars().count();
            if len > limits.max_string_len {
                let kept: String = s.chars().take(limits.max_string_len).collect();
                Value::String(format!("{}... [truncated {} chars]", kept, len - limits.max_string_len))
            } else {
                value.clone()
            }
        }
        Value::Array(items) if depth >= limits.max_depth => {
            Value::String(format!("[array with {} items]", items.len()))
        }
        Value::Object(map) if depth >= limits.max_depth => {
            Value::String(format!("[object with {} keys]", map.len()))
        }
        Value::Array(items) => {
            let mut bounded: Vec<Value> = items
                .iter()
                .take(limits.max_array_items)
                .map(|item| bound_at(item, limits, depth + 1))
                .collect();
            if items.len() > limits.max_array_items {
                bounded.push(Value::String(format!(
                    "[... {} more items]",
                    items.len() - limits.max_array_items
                )));
            }
            Value::Array(bounded)
        }
        Value::Object(map) => {
            let mut bounded = Map::new();
            for (key, child) in map.iter().take(limits.max_object_keys) {
                bounded.insert(key.clone(), bound_at(child, limits, depth + 1));
            }
            if map.len() > limits.max_object_keys {
                bounded.insert(
                    "__truncated__".to_string(),
                    Value::String(format!("{} more keys", map.len() - limits.max_object_keys)),
                );
            }
            Value::Object(bounded)
        }
        other => other.clone(),
    }
}

fn result_entry(result: &ExecutionResult, limits: &SummaryLimits) -> Value {
    let mut entry = json!({
        "step": result.step_index + 1,
        "step_id": result.step_id,
        "tool": result.tool_name,
        "reason": result.step_reason,
        "success": result.success,
        "input": bound_value(&result.tool_args, limits),
    });

    if let Some(output) = &result.tool_result {
        entry["result"] = bound_value(output, limits);
    }
    if let Some(error) = &result.tool_error {
        entry["error"] = Value::String(truncate(error, limits.max_string_len));
    }
    entry
}

/// Render results as pretty JSON no longer than `limits.max_total_chars`.
///
/// Bounds are tightened step by step until the rendering fits; at the floor
/// the text itself is cut.
pub fn summarize_results(results: &[ExecutionResult], limits: &SummaryLimits) -> String {
    let mut current = limits.clone();

    loop {
        let entries: Vec<Value> = results.iter().map(|r| result_entry(r, &current)).collect();
        let rendered = serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string());

        if rendered.chars().count() <= limits.max_total_chars {
            return rendered;
        }
        if current.at_floor() {
            debug!("Result summary still too large at floor limits, cutting text");
            return truncate(&rendered, limits.max_total_chars);
        }

        current = current.tightened();
        debug!("Tightening result summary limits to {:?}", current);
    }
}

/// Short human-readable rendering of a tool result
pub fn observation(value: &Value, max_chars: usize) -> String {
    match value {
        Value::String(s) => truncate(s, max_chars),
        other => truncate(&other.to_string(), max_chars),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::PlanStep;

    fn result_with(value: Value) -> ExecutionResult {
        let step = PlanStep::new("step1", "search", json!("q"), "look it up");
        ExecutionResult::succeeded(&step, 0, json!("q"), value, String::new())
    }

    #[test]
    fn test_bound_value_applies_every_limit() {
        let limits = SummaryLimits {
            max_depth: 2,
            max_string_len: 5,
            max_array_items: 2,
            max_object_keys: 1,
            max_total_chars: 1000,
        };
        let value = json!({"a": {"deep": {"x": 1}}, "b": 2});
        let bounded = bound_value(&value, &limits);
        assert_eq!(bounded["a"]["deep"], json!("[object with 1 keys]"));
        assert_eq!(bounded["__truncated__"], json!("1 more keys"));

        let bounded = bound_value(&json!(["abcdefgh", 2, 3]), &limits);
        assert_eq!(bounded, json!(["abcde... [truncated 3 chars]", 2, "[... 1 more items]"]));
    }

    #[test]
    fn test_summary_includes_step_metadata() {
        let summary = summarize_results(&[result_with(json!({"text": "hello"}))], &SummaryLimits::default());
        let parsed: Value = serde_json::from_str(&summary).unwrap();
        assert_eq!(parsed[0]["step"], 1);
        assert_eq!(parsed[0]["tool"], "search");
        assert_eq!(parsed[0]["result"]["text"], "hello");
        assert!(parsed[0].get("error").is_none());
    }

    #[test]
    fn test_summary_tightens_until_it_fits() {
        let big: Vec<String> = (0..200).map(|i| format!("row {} {}", i, "x".repeat(100))).collect();
        let limits = SummaryLimits {
            max_total_chars: 1500,
            ..SummaryLimits::default()
        };
        let summary = summarize_results(&[result_with(json!({"rows": big}))], &limits);
        assert!(summary.chars().count() <= 1500);
        assert!(serde_json::from_str::<Value>(&summary).is_ok());
    }

    #[test]
    fn test_summary_is_cut_at_floor() {
        let results: Vec<ExecutionResult> = (0..50).map(|_| result_with(json!("x".repeat(500)))).collect();
        let limits = SummaryLimits {
            max_total_chars: 300,
            ..SummaryLimits::default()
        };
        let summary = summarize_results(&results, &limits);
        assert_eq!(summary.chars().count(), 300);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn test_observation() {
        assert_eq!(observation(&json!("plain"), 100), "plain");
        assert_eq!(observation(&json!({"a": 1}), 100), "{\"a\":1}");
        assert_eq!(observation(&json!("abcdefghij"), 6), "abc...");
    }
}
