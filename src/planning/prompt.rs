//! Planning and final-answer prompt construction

use super::summary::{summarize_results, SummaryLimits};
use super::ExecutionResult;
use crate::llm::{Message, PromptContext, PromptTemplates};
use crate::Result;

/// Planning prompt: rules, plan schema, placeholder syntax and the verbatim
/// tool catalog, followed by the user query.
pub fn build_plan_prompt(user_query: &str, tool_catalog: &str) -> Result<Vec<Message>> {
    let context = PromptContext::new()
        .with_variable("tools", tool_catalog.trim())
        .with_variable("query", user_query.trim());
    let (system, user) = PromptTemplates::plan_generation().fill(&context)?;
    Ok(vec![Message::system(system), Message::user(user)])
}

/// Final-answer prompt embedding a bounded summary of the execution results
pub fn build_final_answer_prompt(
    user_query: &str,
    results: &[ExecutionResult],
    limits: &SummaryLimits,
) -> Result<Vec<Message>> {
    let context = PromptContext::new()
        .with_variable("query", user_query.trim())
        .with_variable("results", summarize_results(results, limits));
    let (system, user) = PromptTemplates::final_answer().fill(&context)?;
    Ok(vec![Message::system(system), Message::user(user)])
}
