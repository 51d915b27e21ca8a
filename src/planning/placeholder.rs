//! Resolution of `{{stepN.output.path}}` references against earlier results

use super::{ExecutionLog, ExecutionResult, PlanStep};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

lazy_static! {
    /// `{{step2.output.items[0]["file name"].path}}`
    static ref PLACEHOLDER: Regex = Regex::new(
        r#"\{\{\s*step(\d+)\.(output|result|observation|args|input|error)((?:\.[\w-]+|\[\d+\]|\["[^"\]]*"\]|\['[^'\]]*'\])*)\s*\}\}"#
    )
    .unwrap();
    static ref SEGMENT: Regex =
        Regex::new(r#"\.([\w-]+)|\[(\d+)\]|\["([^"\]]*)"\]|\['([^'\]]*)'\]"#).unwrap();
    /// Anything that looks like a step reference, well-formed or not
    static ref LOOSE_PLACEHOLDER: Regex = Regex::new(r"\{\{\s*step\d+[^}]*\}\}").unwrap();
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][\w-]*$").unwrap();
}

const MAX_FIELD_DEPTH: usize = 4;
const MAX_FIELDS: usize = 64;
const MAX_ARRAY_FIELDS: usize = 3;

/// Why a placeholder could not be resolved.
///
/// `available_fields` lists the field paths that do exist on the referenced
/// value and feeds parameter regeneration.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("Cannot resolve placeholder {placeholder} in step {step_id} ({tool_name}): {reason}")]
pub struct PlaceholderError {
    pub placeholder: String,
    pub available_fields: Vec<String>,
    pub tool_name: String,
    pub step_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Resolves placeholders in step inputs against an execution log
pub struct PlaceholderResolver<'a> {
    log: &'a ExecutionLog,
}

impl<'a> PlaceholderResolver<'a> {
    pub fn new(log: &'a ExecutionLog) -> Self {
        Self { log }
    }

    /// Whether a value contains any step reference
    pub fn contains_placeholders(value: &Value) -> bool {
        match value {
            Value::String(s) => LOOSE_PLACEHOLDER.is_match(s),
            Value::Array(items) => items.iter().any(Self::contains_placeholders),
            Value::Object(map) => map.values().any(Self::contains_placeholders),
            _ => false,
        }
    }

    /// Resolve every placeholder in a step's input
    pub fn resolve_step(&self, step: &PlanStep) -> Result<Value, PlaceholderError> {
        self.resolve_value(&step.input, &step.tool, &step.step_id)
    }

    /// Resolve placeholders in an arbitrary value, walking structures recursively
    pub fn resolve_value(&self, input: &Value, tool_name: &str, step_id: &str) -> Result<Value, PlaceholderError> {
        match input {
            Value::String(text) => self.resolve_text(text, tool_name, step_id),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item, tool_name, step_id))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    resolved.insert(key.clone(), self.resolve_value(value, tool_name, step_id)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_text(&self, text: &str, tool_name: &str, step_id: &str) -> Result<Value, PlaceholderError> {
        if !LOOSE_PLACEHOLDER.is_match(text) {
            return Ok(Value::String(text.to_string()));
        }

        for loose in LOOSE_PLACEHOLDER.find_iter(text) {
            let well_formed = PLACEHOLDER
                .find(loose.as_str())
                .map_or(false, |m| m.as_str() == loose.as_str());
            if !well_formed {
                return Err(PlaceholderError {
                    placeholder: loose.as_str().to_string(),
                    available_fields: Vec::new(),
                    tool_name: tool_name.to_string(),
                    step_id: step_id.to_string(),
                    reason: "unsupported placeholder syntax; expected {{stepN.output.path}}".to_string(),
                });
            }
        }

        // A value that is exactly one placeholder keeps its JSON type
        if let Some(caps) = PLACEHOLDER.captures(text.trim()) {
            if caps.get(0).map_or(false, |m| m.as_str() == text.trim()) {
                let value = self.lookup(&caps, tool_name, step_id)?;
                debug!("Resolved {} for step {}", text.trim(), step_id);
                return Ok(value);
            }
        }

        let mut output = String::with_capacity(text.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            let value = self.lookup(&caps, tool_name, step_id)?;
            output.push_str(&text[last..whole.start()]);
            match value {
                Value::String(s) => output.push_str(&s),
                other => output.push_str(&other.to_string()),
            }
            last = whole.end();
            debug!("Spliced {} into step {}", whole.as_str(), step_id);
        }
        output.push_str(&text[last..]);

        Ok(Value::String(output))
    }

    fn lookup(&self, caps: &Captures, tool_name: &str, step_id: &str) -> Result<Value, PlaceholderError> {
        let placeholder = caps[0].to_string();
        let error = |reason: String, available_fields: Vec<String>| PlaceholderError {
            placeholder: placeholder.clone(),
            available_fields,
            tool_name: tool_name.to_string(),
            step_id: step_id.to_string(),
            reason,
        };

        let number: usize = caps[1].parse().unwrap_or(0);
        if number == 0 {
            return Err(error("step numbers start at 1".to_string(), Vec::new()));
        }

        let record = self.log.by_index(number - 1).ok_or_else(|| {
            error(
                format!("step{} has no recorded result yet", number),
                Vec::new(),
            )
        })?;

        let root = field_value(record, &caps[2])
            .ok_or_else(|| error(format!("step{} has no {}", number, &caps[2]), Vec::new()))?;

        let segments = parse_segments(&caps[3]);
        let found = walk(&root, &segments).or_else(|| {
            // Skipped steps expose their fallback to downstream references
            if record.is_skipped() {
                root.get("previousResult").and_then(|prev| walk(prev, &segments))
            } else {
                None
            }
        });

        match found {
            Some(Value::Null) => Err(error(
                format!("value at {} is null", path_display(&caps[2], &segments)),
                available_fields(&root),
            )),
            Some(value) => Ok(value),
            None => Err(error(
                format!(
                    "field {} does not exist on step{}",
                    path_display(&caps[2], &segments),
                    number
                ),
                available_fields(&root),
            )),
        }
    }
}

fn field_value(record: &ExecutionResult, field: &str) -> Option<Value> {
    match field {
        "output" | "result" => record.tool_result.clone(),
        "observation" => Some(Value::String(record.observation.clone())),
        "args" | "input" => Some(record.tool_args.clone()),
        "error" => record.tool_error.clone().map(Value::String),
        _ => None,
    }
}

fn parse_segments(path: &str) -> Vec<Segment> {
    SEGMENT
        .captures_iter(path)
        .filter_map(|caps| {
            if let Some(key) = caps.get(1) {
                Some(Segment::Key(key.as_str().to_string()))
            } else if let Some(index) = caps.get(2) {
                index.as_str().parse().ok().map(Segment::Index)
            } else {
                caps.get(3)
                    .or_else(|| caps.get(4))
                    .map(|key| Segment::Key(key.as_str().to_string()))
            }
        })
        .collect()
}

fn walk(root: &Value, segments: &[Segment]) -> Option<Value> {
    let mut current = root.clone();

    for segment in segments {
        // Tools often return JSON as text
        if let Value::String(text) = &current {
            match serde_json::from_str::<Value>(text) {
                Ok(parsed @ (Value::Object(_) | Value::Array(_))) => current = parsed,
                _ => return None,
            }
        }

        current = match (segment, &current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key)?.clone(),
            (Segment::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?.clone(),
            (Segment::Index(i), Value::Array(items)) => items.get(*i)?.clone(),
            _ => return None,
        };
    }

    Some(current)
}

fn path_display(field: &str, segments: &[Segment]) -> String {
    let mut path = field.to_string();
    for segment in segments {
        match segment {
            Segment::Key(key) if IDENTIFIER.is_match(key) => {
                path.push('.');
                path.push_str(key);
            }
            Segment::Key(key) => path.push_str(&format!("[\"{}\"]", key)),
            Segment::Index(i) => path.push_str(&format!("[{}]", i)),
        }
    }
    path
}

/// Enumerate the field paths of a value (bounded in depth and count)
pub fn available_fields(value: &Value) -> Vec<String> {
    let mut fields = Vec::new();
    collect_fields(value, "", 0, &mut fields);
    fields
}

fn collect_fields(value: &Value, prefix: &str, depth: usize, out: &mut Vec<String>) {
    if depth >= MAX_FIELD_DEPTH || out.len() >= MAX_FIELDS {
        return;
    }

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if out.len() >= MAX_FIELDS {
                    return;
                }
                let path = if IDENTIFIER.is_match(key) {
                    if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    }
                } else {
                    format!("{}[\"{}\"]", prefix, key)
                };
                out.push(path.clone());
                collect_fields(child, &path, depth + 1, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().take(MAX_ARRAY_FIELDS).enumerate() {
                if out.len() >= MAX_FIELDS {
                    return;
                }
                let path = format!("{}[{}]", prefix, i);
                out.push(path.clone());
                collect_fields(child, &path, depth + 1, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log_with(results: Vec<(&str, Value)>) -> ExecutionLog {
        let mut log = ExecutionLog::new();
        for (i, (id, result)) in results.into_iter().enumerate() {
            let step = PlanStep::new(id, "tool", json!({"q": i}), "");
            log.append(ExecutionResult::succeeded(&step, i, json!({"q": i}), result, format!("obs {}", i)));
        }
        log
    }

    fn resolve(log: &ExecutionLog, input: Value) -> Result<Value, PlaceholderError> {
        PlaceholderResolver::new(log).resolve_value(&input, "create", "step9")
    }

    #[test]
    fn test_embedded_placeholder_is_spliced_as_text() {
        let log = log_with(vec![("step1", json!({"path": "/a.md"}))]);
        let resolved = resolve(&log, json!("open {{step1.output.path}}")).unwrap();
        assert_eq!(resolved, json!("open /a.md"));
    }

    #[test]
    fn test_whole_placeholder_keeps_json_type() {
        let log = log_with(vec![("step1", json!({"items": [{"n": 1}, {"n": 2}], "text": "hello"}))]);
        assert_eq!(resolve(&log, json!("{{step1.output.items}}")).unwrap(), json!([{"n": 1}, {"n": 2}]));
        assert_eq!(resolve(&log, json!(" {{ step1.output.items[1].n }} ")).unwrap(), json!(2));
        assert_eq!(resolve(&log, json!("{{step1.output.text}}")).unwrap(), json!("hello"));
        assert_eq!(
            resolve(&log, json!("n={{step1.output.items[0]}}")).unwrap(),
            json!("n={\"n\":1}")
        );
    }

    #[test]
    fn test_structured_input_is_walked() {
        let log = log_with(vec![("step1", json!({"text": "hello", "file name": "x.txt"}))]);
        let input = json!({
            "content": "{{step1.output.text}}",
            "meta": {"files": ["{{step1.output[\"file name\"]}}", 3]},
            "flag": true
        });
        let resolved = resolve(&log, input).unwrap();
        assert_eq!(resolved, json!({"content": "hello", "meta": {"files": ["x.txt", 3]}, "flag": true}));
    }

    #[test]
    fn test_missing_field_lists_available_fields() {
        let log = log_with(vec![("step1", json!({"path": "/a.md"}))]);
        let err = resolve(&log, json!("{{step1.output.missing}}")).unwrap_err();
        assert_eq!(err.available_fields, vec!["path".to_string()]);
        assert_eq!(err.placeholder, "{{step1.output.missing}}");
        assert_eq!(err.tool_name, "create");
        assert_eq!(err.step_id, "step9");
    }

    #[test]
    fn test_null_and_unknown_step_are_errors() {
        let log = log_with(vec![("step1", json!({"path": null}))]);
        let err = resolve(&log, json!("{{step1.output.path}}")).unwrap_err();
        assert!(err.reason.contains("null"));

        let err = resolve(&log, json!("{{step3.output}}")).unwrap_err();
        assert!(err.reason.contains("step3"));

        let err = resolve(&log, json!("{{step0.output}}")).unwrap_err();
        assert!(err.available_fields.is_empty());
    }

    #[test]
    fn test_malformed_reference_is_rejected() {
        let log = log_with(vec![("step1", json!({"path": "/a"}))]);
        let err = resolve(&log, json!("{{step1.outputs.path}}")).unwrap_err();
        assert!(err.reason.contains("unsupported"));
        // Non-step mustache text passes through untouched
        assert_eq!(resolve(&log, json!("{{name}}")).unwrap(), json!("{{name}}"));
    }

    #[test]
    fn test_other_declared_fields() {
        let log = log_with(vec![("step1", json!({"path": "/a"}))]);
        assert_eq!(resolve(&log, json!("{{step1.observation}}")).unwrap(), json!("obs 0"));
        assert_eq!(resolve(&log, json!("{{step1.input.q}}")).unwrap(), json!(0));
        assert!(resolve(&log, json!("{{step1.error}}")).is_err());
    }

    #[test]
    fn test_json_text_results_are_traversed() {
        let log = log_with(vec![("step1", json!("{\"rows\": [{\"id\": 7}]}"))]);
        assert_eq!(resolve(&log, json!("{{step1.output.rows[0].id}}")).unwrap(), json!(7));
    }

    #[test]
    fn test_skipped_step_falls_back_to_previous_result() {
        let mut log = log_with(vec![("step1", json!({"text": "hello"}))]);
        let step2 = PlanStep::new("step2", "create", json!("x"), "");
        log.append(ExecutionResult::skipped(&step2, 1, json!("x"), "boom".into(), Some(json!({"text": "hello"}))));

        assert_eq!(resolve(&log, json!("{{step2.output.text}}")).unwrap(), json!("hello"));
        assert_eq!(resolve(&log, json!("{{step2.output.skipped}}")).unwrap(), json!(true));
    }

    #[test]
    fn test_available_fields_are_nested_and_bounded() {
        let fields = available_fields(&json!({"a": {"b": 1}, "items": [1, 2, 3, 4, 5]}));
        assert_eq!(fields, vec!["a", "a.b", "items", "items[0]", "items[1]", "items[2]"]);
        assert!(PlaceholderResolver::contains_placeholders(&json!({"x": ["{{step1.output}}"]})));
        assert!(!PlaceholderResolver::contains_placeholders(&json!({"x": "plain"})));
    }
}
