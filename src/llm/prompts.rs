//! Prompt templates for planning, synthesis, regeneration and content generation

use crate::utils::errors::PlanexError;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

lazy_static! {
    static ref TEMPLATE_VAR: Regex = Regex::new(r"\{\{([a-z_]+)\}\}").unwrap();
}

/// Template for different types of LLM interactions
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub system_message: String,
    pub user_template: String,
    pub variables: Vec<String>,
}

/// Context for filling prompt templates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptContext {
    pub variables: HashMap<String, String>,
}

impl PromptContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn set_variable<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.variables.insert(key.into(), value.into());
    }

    pub fn get_variable(&self, key: &str) -> Option<&String> {
        self.variables.get(key)
    }
}

impl PromptTemplate {
    /// Fill the template with context variables.
    ///
    /// Substitution is a single pass, so values that themselves contain
    /// `{{...}}` (tool catalogs, step placeholders) are inserted verbatim.
    /// Unknown `{{...}}` markers in the template are left untouched.
    pub fn fill(&self, context: &PromptContext) -> Result<(String, String), PlanexError> {
        for variable in &self.variables {
            if !context.variables.contains_key(variable) {
                return Err(PlanexError::validation(
                    variable.clone(),
                    "Missing required prompt variable",
                ));
            }
        }

        let substitute = |text: &str| {
            TEMPLATE_VAR
                .replace_all(text, |caps: &Captures| match context.variables.get(&caps[1]) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                })
                .into_owned()
        };

        Ok((substitute(&self.system_message), substitute(&self.user_template)))
    }
}

/// Collection of predefined prompt templates
pub struct PromptTemplates;

impl PromptTemplates {
    /// Planning prompt: tool catalog, rules, plan schema and the user query
    pub fn plan_generation() -> PromptTemplate {
        PromptTemplate {
            system_message: r#"You are a task planning assistant. You solve the user's request by planning a sequence of tool calls that are executed one after another.

## Response Format
Answer with tagged blocks only:

<thought>Your reasoning about which tools are needed.</thought>
<plan>
{"steps": [{"step_id": "step1", "tool": "tool_name", "input": {"param": "value"}, "reason": "Why this step is needed"}]}
</plan>

If the request can be answered without any tool, skip the plan and reply with:

<final_answer>Your answer.</final_answer>

## Plan Rules
1. Use only tools from the catalog below, spelled exactly as listed.
2. Number steps sequentially: step1, step2, step3, ...
3. Steps run strictly in order. A step may only depend on earlier steps.
4. `input` is either a JSON object matching the tool's parameters or a plain string.
5. Keep plans short. Do not add verification steps unless the user asked for them.
6. The plan block must contain valid JSON and nothing else.

## Referencing Earlier Results
Use placeholders to pass data between steps:
- `{{step1.output}}` is the whole result of step 1
- `{{step1.output.path}}` is a field of that result
- `{{step2.output.items[0].name}}` indexes into arrays
- `{{step1.output["file name"]}}` quotes keys with special characters
- `{{step1.observation}}`, `{{step1.input}}` and `{{step1.error}}` are also available

A value that is exactly one placeholder receives the raw JSON value. Placeholders inside longer text are replaced by their text form.

## Available Tools
{{tools}}"#
                .to_string(),
            user_template: "## User Request\n{{query}}\n\nRespond with a <plan> block, or a <final_answer> block if no tools are needed.".to_string(),
            variables: vec!["tools".to_string(), "query".to_string()],
        }
    }

    /// Final answer synthesis from a bounded summary of execution results
    pub fn final_answer() -> PromptTemplate {
        PromptTemplate {
            system_message: r#"You are a helpful assistant. A plan of tool calls has been executed on behalf of the user. Use the execution results to answer the user's original request.

## Guidelines
1. Base the answer on the results. Do not invent data that is not in them.
2. If a step failed or was skipped, say so briefly and work with what is available.
3. Be concise and direct.

Wrap the complete answer in a single <final_answer>...</final_answer> block."#
                .to_string(),
            user_template: "## User Request\n{{query}}\n\n## Execution Results\n```json\n{{results}}\n```".to_string(),
            variables: vec!["query".to_string(), "results".to_string()],
        }
    }

    /// Rewrite a failed step keeping its tool, fixing the input
    pub fn regenerate_fixed_params() -> PromptTemplate {
        PromptTemplate {
            system_message: r#"You repair a single failed step of an execution plan. The tool is right but its input was wrong.

Respond with exactly one JSON object and nothing else:
{"step_id": "...", "tool": "...", "input": {...}, "reason": "..."}

Rules:
1. Keep the same tool unless it cannot possibly work.
2. Use only fields that actually exist in earlier results. Placeholders such as {{step1.output.path}} are allowed.
3. Keep the step's purpose unchanged."#
                .to_string(),
            user_template: r#"## User Request
{{query}}

## Failed Step
Tool: {{tool}}
Reason: {{reason}}
Input:
{{input}}

## Error
{{error}}

## Available Fields From Earlier Results
{{available_fields}}

## Tool Catalog
{{tools}}"#
                .to_string(),
            variables: vec![
                "query".to_string(),
                "tool".to_string(),
                "reason".to_string(),
                "input".to_string(),
                "error".to_string(),
                "available_fields".to_string(),
                "tools".to_string(),
            ],
        }
    }

    /// Rewrite a failed step using a different tool
    pub fn regenerate_alternative_tool() -> PromptTemplate {
        PromptTemplate {
            system_message: r#"You repair a single failed step of an execution plan. The tool it used is unusable right now (missing credentials, unauthorized, unavailable or unknown).

Respond with exactly one JSON object and nothing else:
{"step_id": "...", "tool": "...", "input": {...}, "reason": "..."}

Rules:
1. Pick a different tool from the catalog that accomplishes the same purpose.
2. Prefer the suggested candidates when they fit.
3. The input must match the chosen tool's parameters."#
                .to_string(),
            user_template: r#"## User Request
{{query}}

## Failed Step
Tool: {{tool}}
Reason: {{reason}}
Input:
{{input}}

## Error
{{error}}

## Suggested Alternatives
{{candidates}}

## Tool Catalog
{{tools}}"#
                .to_string(),
            variables: vec![
                "query".to_string(),
                "tool".to_string(),
                "reason".to_string(),
                "input".to_string(),
                "error".to_string(),
                "candidates".to_string(),
                "tools".to_string(),
            ],
        }
    }

    /// Content generation for content-producing tools
    pub fn content_generation() -> PromptTemplate {
        PromptTemplate {
            system_message: r#"You are a writer producing content that a later step will save or send. Output only the requested content: no preamble, no commentary and no surrounding code fences unless the content itself is code in a markdown document."#
                .to_string(),
            user_template: "## Overall Request\n{{query}}\n\n## Step Purpose\n{{reason}}\n\n## Instructions\n{{request}}".to_string(),
            variables: vec![
                "query".to_string(),
                "reason".to_string(),
                "request".to_string(),
            ],
        }
    }

    /// Get list of all available template names
    pub fn list_templates() -> Vec<&'static str> {
        vec![
            "plan_generation",
            "final_answer",
            "regenerate_fixed_params",
            "regenerate_alternative_tool",
            "content_generation",
        ]
    }

    /// Get template by name
    pub fn get_template(name: &str) -> Option<PromptTemplate> {
        match name {
            "plan_generation" => Some(Self::plan_generation()),
            "final_answer" => Some(Self::final_answer()),
            "regenerate_fixed_params" => Some(Self::regenerate_fixed_params()),
            "regenerate_alternative_tool" => Some(Self::regenerate_alternative_tool()),
            "content_generation" => Some(Self::content_generation()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_context_creation() {
        let context = PromptContext::new()
            .with_variable("query", "list files")
            .with_variable("tools", "read_file");

        assert_eq!(context.get_variable("query"), Some(&"list files".to_string()));
        assert_eq!(context.get_variable("missing"), None);
    }

    #[test]
    fn test_template_filling_keeps_step_placeholders() {
        let template = PromptTemplates::plan_generation();
        let context = PromptContext::new()
            .with_variable("tools", "- read_file: read {{path}}")
            .with_variable("query", "open the readme");

        let (system, user) = template.fill(&context).unwrap();
        assert!(system.contains("{{step1.output.path}}"));
        assert!(system.contains("- read_file: read {{path}}"));
        assert!(user.contains("open the readme"));
    }

    #[test]
    fn test_missing_variable_error() {
        let template = PromptTemplates::final_answer();
        let context = PromptContext::new().with_variable("query", "q");

        let result = template.fill(&context);
        assert!(matches!(result, Err(PlanexError::Validation { ref field, .. }) if field == "results"));
    }

    #[test]
    fn test_template_retrieval() {
        for name in PromptTemplates::list_templates() {
            assert!(PromptTemplates::get_template(name).is_some(), "{}", name);
        }
        assert!(PromptTemplates::get_template("nonexistent").is_none());
    }
}
