//! Plan data model and the plan-execute lifecycle

pub mod manager;
pub mod placeholder;
pub mod prompt;
pub mod session;
pub mod summary;

use crate::utils::errors::PlanexError;
use crate::utils::text::{extract_json_object, strip_code_fence};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

pub use manager::{DriverState, PlanExecuteDriver, RunReport};
pub use placeholder::{PlaceholderError, PlaceholderResolver};
pub use session::StructuredPromptSession;
pub use summary::SummaryLimits;

/// One tool call of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: String,
    pub tool: String,
    /// String or structured payload, may contain `{{stepN...}}` placeholders
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub reason: String,
}

impl PlanStep {
    pub fn new<S1, S2, S3>(step_id: S1, tool: S2, input: Value, reason: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self {
            step_id: step_id.into(),
            tool: tool.into(),
            input,
            reason: reason.into(),
        }
    }

    /// Parse a single step from model output (used by regeneration)
    pub fn from_model_output(text: &str) -> Result<Self, PlanexError> {
        let body = strip_code_fence(text);
        let json = extract_json_object(body).ok_or_else(|| {
            PlanexError::planning("Regenerated step does not contain a JSON object")
        })?;
        let raw: RawStep = serde_json::from_str(json)?;
        raw.into_step(None)
    }
}

/// Step as written by the model; ids may be missing
#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default, alias = "id")]
    step_id: Option<String>,
    #[serde(alias = "tool_name")]
    tool: Option<String>,
    #[serde(default, alias = "args", alias = "arguments")]
    input: Value,
    #[serde(default)]
    reason: String,
}

impl RawStep {
    fn into_step(self, index: Option<usize>) -> Result<PlanStep, PlanexError> {
        let tool = self
            .tool
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| PlanexError::validation("tool", "Step is missing a tool name"))?;
        let step_id = match (self.step_id, index) {
            (Some(id), _) if !id.trim().is_empty() => id,
            (_, Some(i)) => format!("step{}", i + 1),
            _ => String::new(),
        };

        Ok(PlanStep {
            step_id,
            tool: tool.trim().to_string(),
            input: self.input,
            reason: self.reason,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPlan {
    Wrapped { steps: Vec<RawStep> },
    Bare(Vec<RawStep>),
}

/// Ordered list of steps materialized from a `plan` phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    /// Parse the JSON payload of a `plan` phase.
    ///
    /// Accepts `{"steps": [...]}` or a bare array, optionally fenced.
    /// Missing step ids become `stepN` by position; duplicate ids are rejected.
    pub fn from_phase_content(content: &str) -> Result<Self, PlanexError> {
        let body = strip_code_fence(content);
        let raw: RawPlan = match serde_json::from_str(body) {
            Ok(raw) => raw,
            Err(first) => {
                let object = extract_json_object(body).ok_or_else(|| {
                    PlanexError::planning(format!("Plan is not valid JSON: {}", first))
                })?;
                serde_json::from_str(object)
                    .map_err(|e| PlanexError::planning(format!("Plan is not valid JSON: {}", e)))?
            }
        };

        let raw_steps = match raw {
            RawPlan::Wrapped { steps } | RawPlan::Bare(steps) => steps,
        };

        let steps = raw_steps
            .into_iter()
            .enumerate()
            .map(|(i, raw)| raw.into_step(Some(i)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.step_id.as_str()) {
                return Err(PlanexError::planning(format!(
                    "Duplicate step_id in plan: {}",
                    step.step_id
                )));
            }
        }

        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PlanStep> {
        self.steps.get(index)
    }

    /// Swap the step at `index` for a regenerated one, keeping the original id
    pub fn replace_step(&mut self, index: usize, mut step: PlanStep) -> Result<&PlanStep, PlanexError> {
        let slot = self
            .steps
            .get_mut(index)
            .ok_or_else(|| PlanexError::not_found(format!("plan step #{}", index + 1)))?;
        step.step_id = slot.step_id.clone();
        *slot = step;
        Ok(slot)
    }
}

/// Durable record of one step's terminal outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub step_id: String,
    pub step_index: usize,
    pub tool_name: String,
    /// Arguments as actually sent (after placeholder resolution when it succeeded)
    pub tool_args: Value,
    pub tool_result: Option<Value>,
    pub tool_error: Option<String>,
    pub observation: String,
    pub step_reason: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn succeeded(step: &PlanStep, step_index: usize, args: Value, result: Value, observation: String) -> Self {
        Self {
            step_id: step.step_id.clone(),
            step_index,
            tool_name: step.tool.clone(),
            tool_args: args,
            tool_result: Some(result),
            tool_error: None,
            observation,
            step_reason: step.reason.clone(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Failed-and-skipped record carrying the last successful prior result
    pub fn skipped(
        step: &PlanStep,
        step_index: usize,
        args: Value,
        error: String,
        previous_result: Option<Value>,
    ) -> Self {
        let tool_result = serde_json::json!({
            "skipped": true,
            "error": error,
            "previousResult": previous_result.unwrap_or(Value::Null),
        });

        Self {
            step_id: step.step_id.clone(),
            step_index,
            tool_name: step.tool.clone(),
            tool_args: args,
            tool_result: Some(tool_result),
            tool_error: Some(error.clone()),
            observation: format!("Skipped after failure: {}", error),
            step_reason: step.reason.clone(),
            success: false,
            timestamp: Utc::now(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.tool_result
            .as_ref()
            .and_then(|r| r.get("skipped"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Append-only log of execution results for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionLog {
    records: Vec<ExecutionResult>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Records are never mutated after insertion.
    pub fn append(&mut self, result: ExecutionResult) {
        self.records.push(result);
    }

    pub fn records(&self) -> &[ExecutionResult] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.records.iter()
    }

    /// Record for the step at a zero-based plan index
    pub fn by_index(&self, step_index: usize) -> Option<&ExecutionResult> {
        self.records.iter().rev().find(|r| r.step_index == step_index)
    }

    /// Most recent successful result recorded before `step_index`
    pub fn last_successful_before(&self, step_index: usize) -> Option<&Value> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.success && r.step_index < step_index)
            .find_map(|r| r.tool_result.as_ref())
    }

    pub fn success_count(&self) -> usize {
        self.records.iter().filter(|r| r.success).count()
    }

    pub fn into_records(self) -> Vec<ExecutionResult> {
        self.records
    }
}
