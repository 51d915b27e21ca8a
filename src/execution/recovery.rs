//! Failure recovery: single-slot suspension and AI-assisted step regeneration

use super::ToolFacility;
use crate::llm::{Message, ModelClient, PromptContext, PromptTemplates, StreamCollector};
use crate::planning::PlanStep;
use crate::ui::events::DriverEvent;
use crate::utils::errors::PlanexError;
use crate::utils::text::TextProcessor;
use crate::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

lazy_static! {
    /// Errors that mean the tool itself cannot be used right now
    static ref TOOL_UNUSABLE: Regex = Regex::new(
        r"(?i)(api[ _-]?key|credential|token (is )?(missing|invalid|expired)|not configured|unauthori[sz]ed|forbidden|\b401\b|\b403\b|permission denied|unavailable|\b503\b|\b502\b|service (is )?down|connection refused|unknown tool|tool not found|no such tool)"
    )
    .unwrap();
}

const MAX_ALTERNATIVES: usize = 5;

/// Caller's answer to a suspended failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryDecision {
    Retry,
    Regenerate,
    Skip,
}

impl fmt::Display for RecoveryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryDecision::Retry => write!(f, "retry"),
            RecoveryDecision::Regenerate => write!(f, "regenerate"),
            RecoveryDecision::Skip => write!(f, "skip"),
        }
    }
}

/// What went wrong with a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A `{{stepN...}}` reference could not be resolved; no tool was called
    Placeholder,
    /// The tool call returned an error
    ToolError,
    /// The tool returned a result with `success: false`
    FailedResult,
    /// The tool did not return within the per-call timeout
    Timeout,
    /// The content producer failed before the tool ran
    ContentProduction,
}

/// A failed step waiting for a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFailure {
    pub tool_name: String,
    pub args: Value,
    pub error: String,
    pub step_id: String,
    pub step_index: usize,
    pub kind: FailureKind,
    /// Field paths available on the referenced result (placeholder failures)
    #[serde(default)]
    pub available_fields: Vec<String>,
}

/// One-shot resolver for a pending failure.
///
/// Dropping it without answering halts the run.
#[derive(Debug)]
pub struct DecisionHandle {
    step_id: String,
    sender: oneshot::Sender<RecoveryDecision>,
}

impl DecisionHandle {
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Deliver the decision. Returns false when the run no longer waits for it.
    pub fn resolve(self, decision: RecoveryDecision) -> bool {
        self.sender.send(decision).is_ok()
    }

    pub fn retry(self) -> bool {
        self.resolve(RecoveryDecision::Retry)
    }

    pub fn regenerate(self) -> bool {
        self.resolve(RecoveryDecision::Regenerate)
    }

    pub fn skip(self) -> bool {
        self.resolve(RecoveryDecision::Skip)
    }
}

/// How a failed step is rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegenerationStrategy {
    /// Same tool, corrected input
    FixParameters,
    /// Different tool for the same purpose
    AlternativeTool,
}

impl RegenerationStrategy {
    /// Choose a strategy from the failure diagnosis
    pub fn for_failure(failure: &PendingFailure) -> Self {
        match failure.kind {
            FailureKind::Placeholder => RegenerationStrategy::FixParameters,
            _ if TOOL_UNUSABLE.is_match(&failure.error) => RegenerationStrategy::AlternativeTool,
            _ => RegenerationStrategy::FixParameters,
        }
    }
}

impl fmt::Display for RegenerationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegenerationStrategy::FixParameters => write!(f, "fixed parameters"),
            RegenerationStrategy::AlternativeTool => write!(f, "alternative tool"),
        }
    }
}

/// Rewrites a failed step with one model call
pub struct StepRegenerator {
    model: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolFacility>,
}

impl StepRegenerator {
    pub fn new(model: Arc<dyn ModelClient>, tools: Arc<dyn ToolFacility>) -> Self {
        Self { model, tools }
    }

    /// Catalog tools ranked by similarity to the step's purpose, failing tool excluded
    pub fn alternatives(&self, step: &PlanStep) -> Vec<String> {
        let names = self.tools.tool_names();
        let text = format!("{} {}", step.reason, step.tool.replace('_', " "));
        TextProcessor::new()
            .rank_candidates(&text, &names, &[step.tool.as_str()])
            .into_iter()
            .take(MAX_ALTERNATIVES)
            .collect()
    }

    fn build_messages(
        &self,
        query: &str,
        step: &PlanStep,
        failure: &PendingFailure,
        strategy: RegenerationStrategy,
    ) -> Result<Vec<Message>> {
        let input = serde_json::to_string_pretty(&step.input)?;
        let mut context = PromptContext::new()
            .with_variable("query", query)
            .with_variable("tool", step.tool.as_str())
            .with_variable("reason", step.reason.as_str())
            .with_variable("input", input)
            .with_variable("error", failure.error.as_str())
            .with_variable("tools", self.tools.describe_tools());

        let template = match strategy {
            RegenerationStrategy::FixParameters => {
                let fields = if failure.available_fields.is_empty() {
                    "(none recorded)".to_string()
                } else {
                    failure.available_fields.join(", ")
                };
                context.set_variable("available_fields", fields);
                PromptTemplates::regenerate_fixed_params()
            }
            RegenerationStrategy::AlternativeTool => {
                let candidates = self.alternatives(step);
                let candidates = if candidates.is_empty() {
                    "(no other tools available)".to_string()
                } else {
                    candidates.join(", ")
                };
                context.set_variable("candidates", candidates);
                PromptTemplates::regenerate_alternative_tool()
            }
        };

        let (system, user) = template.fill(&context)?;
        Ok(vec![Message::system(system), Message::user(user)])
    }

    /// Ask the model for a replacement step
    pub async fn regenerate(
        &self,
        query: &str,
        step: &PlanStep,
        failure: &PendingFailure,
        abort: &CancellationToken,
    ) -> Result<(PlanStep, RegenerationStrategy)> {
        let strategy = RegenerationStrategy::for_failure(failure);
        info!("Regenerating step {} using {} strategy", step.step_id, strategy);

        if abort.is_cancelled() {
            return Err(PlanexError::cancelled("step regeneration"));
        }

        let messages = self.build_messages(query, step, failure, strategy)?;
        let stream = self.model.stream_chat(&messages, abort.clone()).await?;
        let text = StreamCollector::collect_stream(stream, abort).await?;
        debug!("Regeneration response: {} chars", text.len());

        let mut regenerated = PlanStep::from_model_output(&text)?;
        let known = self.tools.tool_names();
        if !known.is_empty() && !known.iter().any(|t| t == &regenerated.tool) {
            return Err(PlanexError::validation(
                "tool",
                format!("regenerated step uses unknown tool '{}'", regenerated.tool),
            ));
        }
        if strategy == RegenerationStrategy::AlternativeTool && regenerated.tool == step.tool {
            return Err(PlanexError::validation(
                "tool",
                format!("regenerated step still uses the unusable tool '{}'", step.tool),
            ));
        }
        if regenerated.reason.trim().is_empty() {
            regenerated.reason = step.reason.clone();
        }
        regenerated.step_id = step.step_id.clone();

        Ok((regenerated, strategy))
    }
}

/// Single suspension point for failing steps
#[derive(Default)]
pub struct FailureRecoveryCoordinator {
    pending: Option<PendingFailure>,
    receiver: Option<oneshot::Receiver<RecoveryDecision>>,
    regenerator: Option<StepRegenerator>,
}

impl FailureRecoveryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_regenerator(mut self, regenerator: StepRegenerator) -> Self {
        self.regenerator = Some(regenerator);
        self
    }

    /// The failure currently awaiting a decision
    pub fn pending(&self) -> Option<&PendingFailure> {
        self.pending.as_ref()
    }

    /// Occupy the pending slot and hand out its resolver.
    ///
    /// Fails when a decision is already outstanding.
    pub fn open(&mut self, failure: PendingFailure) -> Result<DecisionHandle> {
        if let Some(existing) = &self.pending {
            return Err(PlanexError::execution(format!(
                "recovery decision for step {} is still pending",
                existing.step_id
            )));
        }

        let (sender, receiver) = oneshot::channel();
        let handle = DecisionHandle {
            step_id: failure.step_id.clone(),
            sender,
        };
        self.pending = Some(failure);
        self.receiver = Some(receiver);
        Ok(handle)
    }

    /// Wait for the outstanding decision; clears the slot whatever the outcome
    pub async fn await_decision(&mut self, abort: &CancellationToken) -> Result<RecoveryDecision> {
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| PlanexError::execution("no recovery decision is pending"))?;

        let outcome = tokio::select! {
            _ = abort.cancelled() => None,
            decision = receiver => Some(decision),
        };
        let step_id = self
            .pending
            .take()
            .map(|failure| failure.step_id)
            .unwrap_or_default();

        match outcome {
            None => Err(PlanexError::cancelled("waiting for recovery decision")),
            Some(Ok(decision)) => {
                info!("Recovery decision for step {}: {}", step_id, decision);
                Ok(decision)
            }
            Some(Err(_)) => {
                warn!("Recovery decision for step {} was dropped", step_id);
                Err(PlanexError::halted(step_id, "no recovery decision was given"))
            }
        }
    }

    /// Publish the failure and wait for the caller's decision
    pub async fn suspend(
        &mut self,
        failure: PendingFailure,
        events: &mpsc::UnboundedSender<DriverEvent>,
        abort: &CancellationToken,
    ) -> Result<RecoveryDecision> {
        let handle = self.open(failure.clone())?;
        info!(
            "Step {} ({}) failed, awaiting decision: {}",
            failure.step_id, failure.tool_name, failure.error
        );
        // A closed channel drops the handle, which halts the run
        let _ = events.send(DriverEvent::FailureSuspended { failure, handle });
        self.await_decision(abort).await
    }

    /// Rewrite the failed step via the model
    pub async fn regenerate(
        &self,
        query: &str,
        step: &PlanStep,
        failure: &PendingFailure,
        abort: &CancellationToken,
    ) -> Result<(PlanStep, RegenerationStrategy)> {
        match &self.regenerator {
            Some(regenerator) => regenerator.regenerate(query, step, failure, abort).await,
            None => Err(PlanexError::execution("step regeneration is not available")),
        }
    }
}
