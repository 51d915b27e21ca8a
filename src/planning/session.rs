//! Per-run structured prompt session

use super::ExecutionResult;
use crate::llm::Message;
use crate::utils::text::truncate;
use serde::{Deserialize, Serialize};

const TOOL_MESSAGE_MAX_CHARS: usize = 1200;

/// Tracks the original query, a step cursor and the structured tool-result
/// messages accumulated during one plan-execute run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredPromptSession {
    query: Option<String>,
    cursor: usize,
    messages: Vec<Message>,
}

impl StructuredPromptSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize for a new run
    pub fn start<S: Into<String>>(&mut self, query: S) {
        self.query = Some(query.into());
        self.cursor = 0;
        self.messages.clear();
    }

    pub fn is_active(&self) -> bool {
        self.query.is_some()
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Number of steps completed so far
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Record a completed step (success or failure) and move the cursor
    pub fn advance(&mut self, result: &ExecutionResult) {
        self.cursor += 1;
        let status = if result.success {
            "succeeded"
        } else if result.is_skipped() {
            "was skipped"
        } else {
            "failed"
        };
        let detail = match &result.tool_error {
            Some(error) if !result.success => format!("Error: {}", error),
            _ => format!("Observation: {}", result.observation),
        };

        self.messages.push(Message::user(format!(
            "[Tool result {}/{}] step {} ({}) {}.\n{}",
            self.cursor,
            result.step_index + 1,
            result.step_id,
            result.tool_name,
            status,
            truncate(&detail, TOOL_MESSAGE_MAX_CHARS)
        )));
    }

    /// Structured tool-result messages accumulated so far
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Clear all state at run end
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::PlanStep;
    use serde_json::json;

    #[test]
    fn test_session_lifecycle() {
        let mut session = StructuredPromptSession::new();
        assert!(!session.is_active());

        session.start("find the readme");
        assert_eq!(session.query(), Some("find the readme"));

        let step = PlanStep::new("step1", "list_files", json!({}), "");
        let ok = ExecutionResult::succeeded(&step, 0, json!({}), json!(["README.md"]), "[\"README.md\"]".into());
        session.advance(&ok);

        let skipped = ExecutionResult::skipped(&step, 1, json!({}), "denied".into(), None);
        session.advance(&skipped);

        assert_eq!(session.cursor(), 2);
        assert_eq!(session.messages().len(), 2);
        assert!(session.messages()[0].content.contains("succeeded"));
        assert!(session.messages()[1].content.contains("was skipped"));
        assert!(session.messages()[1].content.contains("Error: denied"));

        session.reset();
        assert!(!session.is_active());
        assert!(session.messages().is_empty());
        assert_eq!(session.cursor(), 0);
    }
}
