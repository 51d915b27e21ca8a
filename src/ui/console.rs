//! Line-oriented console rendering of driver events

use super::events::DriverEvent;
use crate::execution::{DecisionHandle, PendingFailure, RecoveryDecision};
use crate::llm::Phase;
use crate::planning::{DriverState, ExecutionResult, Plan};
use crate::utils::errors::PlanexError;
use crate::utils::text::truncate;
use crate::Result;
use colored::*;
use inquire::Select;
use std::collections::HashMap;
use std::io::Write;
use tokio::sync::mpsc;
use tracing::warn;

/// Automatic answers per step before falling back to skip
const MAX_AUTO_DECISIONS: u32 = 3;

/// How suspended failures are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Ask on the terminal
    Interactive,
    /// Always answer with the given decision
    Auto(RecoveryDecision),
    /// Drop the handle, which halts the run
    Halt,
}

/// Renders driver events and answers recovery decisions
pub struct ConsoleRenderer<W: Write + Send> {
    out: W,
    policy: FailurePolicy,
    show_phases: bool,
    streaming_answer: bool,
    auto_decisions: HashMap<String, u32>,
}

impl<W: Write + Send> ConsoleRenderer<W> {
    pub fn new(out: W, policy: FailurePolicy) -> Self {
        Self {
            out,
            policy,
            show_phases: true,
            streaming_answer: false,
            auto_decisions: HashMap::new(),
        }
    }

    /// Hide thought/action/observation blocks
    pub fn with_phases(mut self, show: bool) -> Self {
        self.show_phases = show;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Consume events until the driver drops its sender
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<DriverEvent>) -> Result<W> {
        while let Some(event) = events.recv().await {
            self.handle(event).await?;
        }
        self.out.flush()?;
        Ok(self.out)
    }

    pub async fn handle(&mut self, event: DriverEvent) -> Result<()> {
        match event {
            DriverEvent::StateChanged { to, .. } => self.render_state(to)?,
            DriverEvent::Phase { phase, content } => self.render_phase(phase, &content)?,
            DriverEvent::PlanMaterialized { plan } => self.render_plan(&plan)?,
            DriverEvent::StepStarted { index, step } => {
                writeln!(
                    self.out,
                    "{} {} {}",
                    "▶".bright_blue(),
                    format!("{}.", index + 1).bright_yellow(),
                    format!("{} ({})", step.tool, step.step_id).bold()
                )?;
            }
            DriverEvent::StepProgress { elapsed_ms, .. } => {
                writeln!(self.out, "  {}", format!("… still running ({}s)", elapsed_ms / 1000).dimmed())?;
            }
            DriverEvent::StepResult { result } => self.render_result(&result)?,
            DriverEvent::FailureSuspended { failure, handle } => self.decide(failure, handle).await?,
            DriverEvent::StepRegenerated { step, strategy, .. } => {
                writeln!(
                    self.out,
                    "  {} {}",
                    "↻".bright_yellow(),
                    format!("regenerated with {}: {} {}", strategy, step.tool, step.input).yellow()
                )?;
            }
            DriverEvent::RegenerationFailed { step_id, error, .. } => {
                writeln!(self.out, "  {} {}", "✗".red(), format!("could not regenerate {}: {}", step_id, error).red())?;
            }
            DriverEvent::FinalAnswerDelta { delta } => {
                if !self.streaming_answer {
                    writeln!(self.out)?;
                    self.streaming_answer = true;
                }
                write!(self.out, "{}", delta)?;
                self.out.flush()?;
            }
            DriverEvent::FinalAnswerComplete { .. } => {
                if self.streaming_answer {
                    writeln!(self.out)?;
                    self.streaming_answer = false;
                }
            }
            DriverEvent::RunFailed { error } => {
                writeln!(self.out, "{} {}", "Run failed:".bright_red().bold(), error.bright_red())?;
            }
            DriverEvent::Aborted => {
                writeln!(self.out, "{}", "Run aborted".bright_yellow())?;
            }
        }
        Ok(())
    }

    fn render_state(&mut self, state: DriverState) -> Result<()> {
        match state {
            DriverState::Planning => writeln!(self.out, "{}", "Planning…".bright_cyan())?,
            DriverState::Synthesizing => writeln!(self.out, "{}", "Writing the answer…".bright_cyan())?,
            _ => {}
        }
        Ok(())
    }

    fn render_phase(&mut self, phase: Phase, content: &str) -> Result<()> {
        if !self.show_phases || phase == Phase::Plan {
            return Ok(());
        }
        writeln!(
            self.out,
            "{} {}",
            format!("[{}]", phase).dimmed(),
            truncate(content.trim(), 400).dimmed().italic()
        )?;
        Ok(())
    }

    fn render_plan(&mut self, plan: &Plan) -> Result<()> {
        writeln!(self.out, "{}", format!("Plan ({} steps)", plan.len()).bright_green().bold())?;
        for (i, step) in plan.steps.iter().enumerate() {
            writeln!(
                self.out,
                "  {} {}: {}",
                format!("{}.", i + 1).bright_yellow(),
                step.tool.bold(),
                step.reason
            )?;
        }
        Ok(())
    }

    fn render_result(&mut self, result: &ExecutionResult) -> Result<()> {
        if result.success {
            writeln!(self.out, "  {} {}", "✅".green(), truncate(&result.observation, 200).green())?;
        } else if result.is_skipped() {
            writeln!(
                self.out,
                "  {} {}",
                "⏭".bright_black(),
                format!("skipped: {}", result.tool_error.as_deref().unwrap_or("unknown error")).bright_black()
            )?;
        } else {
            writeln!(
                self.out,
                "  {} {}",
                "❌".red(),
                result.tool_error.as_deref().unwrap_or("failed").red()
            )?;
        }
        Ok(())
    }

    async fn decide(&mut self, failure: PendingFailure, handle: DecisionHandle) -> Result<()> {
        writeln!(
            self.out,
            "  {} {}",
            "⚠".bright_red(),
            format!("{} ({}) failed: {}", failure.step_id, failure.tool_name, failure.error).bright_red()
        )?;
        if !failure.available_fields.is_empty() {
            writeln!(
                self.out,
                "    {}",
                format!("available fields: {}", failure.available_fields.join(", ")).dimmed()
            )?;
        }
        self.out.flush()?;

        let decision = match self.policy {
            FailurePolicy::Halt => None,
            FailurePolicy::Auto(decision) => {
                let count = self.auto_decisions.entry(failure.step_id.clone()).or_insert(0);
                *count += 1;
                if *count > MAX_AUTO_DECISIONS && decision != RecoveryDecision::Skip {
                    warn!("Step {} kept failing; skipping it", failure.step_id);
                    Some(RecoveryDecision::Skip)
                } else {
                    Some(decision)
                }
            }
            FailurePolicy::Interactive => prompt_decision(&failure).await?,
        };

        match decision {
            Some(decision) => {
                writeln!(self.out, "    {}", format!("→ {}", decision).bright_black())?;
                if !handle.resolve(decision) {
                    warn!("Decision for {} arrived after the run stopped waiting", failure.step_id);
                }
            }
            None => {
                writeln!(self.out, "    {}", "→ halt".bright_black())?;
                drop(handle);
            }
        }
        Ok(())
    }
}

/// Ask on the terminal; `None` means halt
async fn prompt_decision(failure: &PendingFailure) -> Result<Option<RecoveryDecision>> {
    let message = format!("How should step {} continue?", failure.step_id);
    let answer = tokio::task::spawn_blocking(move || {
        let options = vec!["Retry", "Regenerate", "Skip", "Halt"];
        Select::new(&message, options).prompt()
    })
    .await
    .map_err(|e| PlanexError::ui(format!("Decision prompt failed: {}", e)))?;

    let decision = match answer {
        Ok("Retry") => Some(RecoveryDecision::Retry),
        Ok("Regenerate") => Some(RecoveryDecision::Regenerate),
        Ok("Skip") => Some(RecoveryDecision::Skip),
        Ok(_) => None,
        Err(inquire::InquireError::OperationCanceled) | Err(inquire::InquireError::OperationInterrupted) => None,
        Err(e) => return Err(e.into()),
    };
    Ok(decision)
}
