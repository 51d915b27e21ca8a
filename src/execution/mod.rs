//! Step execution: tool seams, the step executor and failure recovery

use crate::planning::PlanStep;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod executor;
pub mod gate;
pub mod recovery;
pub mod toolbox;

pub use executor::{ExecutorConfig, StepExecutor};
pub use gate::ToolGate;
pub use recovery::{
    DecisionHandle, FailureKind, FailureRecoveryCoordinator, PendingFailure, RecoveryDecision,
    RegenerationStrategy, StepRegenerator,
};
pub use toolbox::{LocalToolbox, ModelContentProducer};

/// Errors raised by tool invocation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {name}")]
    NotFound { name: String },

    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Tool {tool} failed: {message}")]
    ExecutionFailed { tool: String, message: String },

    #[error("Tool {tool} is unavailable: {message}")]
    Unavailable { tool: String, message: String },

    #[error("Tool {tool} timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("Tool call cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn invalid_arguments<S1: Into<String>, S2: Into<String>>(tool: S1, message: S2) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn failed<S1: Into<String>, S2: Into<String>>(tool: S1, message: S2) -> Self {
        Self::ExecutionFailed {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Tool catalog and invocation facility.
///
/// Implementations must tolerate being retried with identical arguments;
/// no deduplication happens on this side.
#[async_trait]
pub trait ToolFacility: Send + Sync {
    /// Human-readable catalog embedded verbatim into the planning prompt
    fn describe_tools(&self) -> String;

    /// Names of every callable tool
    fn tool_names(&self) -> Vec<String>;

    /// Invoke a tool by name
    async fn execute(&self, name: &str, args: Value) -> Result<Value, ToolError>;
}

/// Produces the content of content-generation steps before the tool runs
#[async_trait]
pub trait ContentProducer: Send + Sync {
    async fn produce(&self, step: &PlanStep, input: &Value) -> Result<Value, ToolError>;
}

/// Failure message of a tool result whose `success` flag is false
pub fn result_failure(result: &Value) -> Option<String> {
    if result.get("success").and_then(Value::as_bool) != Some(false) {
        return None;
    }

    let message = ["error", "message"]
        .iter()
        .find_map(|key| match result.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        })
        .unwrap_or_else(|| "tool reported failure".to_string());
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_failure_detection() {
        assert_eq!(result_failure(&json!({"text": "ok"})), None);
        assert_eq!(result_failure(&json!({"success": true, "error": "x"})), None);
        assert_eq!(
            result_failure(&json!({"success": false, "error": "API key missing"})),
            Some("API key missing".to_string())
        );
        assert_eq!(
            result_failure(&json!({"success": false, "message": "quota"})),
            Some("quota".to_string())
        );
        assert_eq!(
            result_failure(&json!({"success": false, "error": {"code": 503}})),
            Some("{\"code\":503}".to_string())
        );
        assert_eq!(
            result_failure(&json!({"success": false})),
            Some("tool reported failure".to_string())
        );
    }

    #[test]
    fn test_tool_error_messages() {
        let err = ToolError::Timeout {
            tool: "search".to_string(),
            timeout_ms: 1500,
        };
        assert_eq!(err.to_string(), "Tool search timed out after 1500ms");
        assert_eq!(
            ToolError::invalid_arguments("read_file", "missing path").to_string(),
            "Invalid arguments for read_file: missing path"
        );
    }
}
