//! Plan-execute driver: planning stream, sequential execution and synthesis

use super::prompt::{build_final_answer_prompt, build_plan_prompt};
use super::{ExecutionLog, ExecutionResult, Plan, StructuredPromptSession};
use crate::config::OrchestrationConfig;
use crate::execution::{
    ContentProducer, FailureRecoveryCoordinator, StepExecutor, StepRegenerator, ToolFacility, ToolGate,
};
use crate::llm::{Message, ModelClient, Phase, PhaseEvent, PhaseParser};
use crate::ui::events::DriverEvent;
use crate::utils::errors::PlanexError;
use crate::Result;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Idle,
    Planning,
    Executing,
    Synthesizing,
    Done,
    Aborted,
    Failed,
}

impl DriverState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DriverState::Done | DriverState::Aborted | DriverState::Failed)
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverState::Idle => "idle",
            DriverState::Planning => "planning",
            DriverState::Executing => "executing",
            DriverState::Synthesizing => "synthesizing",
            DriverState::Done => "done",
            DriverState::Aborted => "aborted",
            DriverState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub query: String,
    pub state: DriverState,
    /// Plan as executed, including regenerated steps
    pub plan: Option<Plan>,
    pub results: Vec<ExecutionResult>,
    pub final_answer: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    fn new(query: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            query: query.to_string(),
            state: DriverState::Idle,
            plan: None,
            results: Vec::new(),
            final_answer: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == DriverState::Done
    }
}

/// What one model stream produced
#[derive(Debug, Default)]
struct StreamOutcome {
    plan: Option<Plan>,
    final_answer: Option<String>,
    raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPurpose {
    Planning,
    Synthesis,
}

/// Owns the run state and drives `idle -> planning -> executing ->
/// synthesizing -> done`. Only the driver changes the state.
pub struct PlanExecuteDriver {
    model: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolFacility>,
    content: Option<Arc<dyn ContentProducer>>,
    config: OrchestrationConfig,
    events: mpsc::UnboundedSender<DriverEvent>,
    abort: CancellationToken,
    gate: ToolGate,
    state: DriverState,
}

impl PlanExecuteDriver {
    pub fn new(
        model: Arc<dyn ModelClient>,
        tools: Arc<dyn ToolFacility>,
        config: OrchestrationConfig,
        events: mpsc::UnboundedSender<DriverEvent>,
    ) -> Self {
        Self {
            model,
            tools,
            content: None,
            config,
            events,
            abort: CancellationToken::new(),
            gate: ToolGate::new(),
            state: DriverState::Idle,
        }
    }

    pub fn with_content_producer(mut self, producer: Arc<dyn ContentProducer>) -> Self {
        self.content = Some(producer);
        self
    }

    /// Use an externally owned abort token
    pub fn with_abort_token(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    /// Token that aborts the current and every later run when cancelled
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn gate(&self) -> &ToolGate {
        &self.gate
    }

    fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&mut self, to: DriverState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("Driver state {} -> {}", from, to);
        self.state = to;
        self.emit(DriverEvent::StateChanged { from, to });
    }

    fn check_abort(&self) -> Result<()> {
        if self.abort.is_cancelled() {
            return Err(PlanexError::cancelled("plan-execute run"));
        }
        Ok(())
    }

    /// Run one query to completion.
    ///
    /// Step-level failures are handled through the recovery protocol and never
    /// end the run. Run-level failures end in `Failed`, abort and halted
    /// decisions in `Aborted`; either way the report is returned.
    pub async fn run(&mut self, query: &str) -> RunReport {
        let mut report = RunReport::new(query);
        self.state = DriverState::Idle;
        info!("Starting plan-execute run {} for: {}", report.run_id, query);

        match self.drive(query, &mut report).await {
            Ok(()) => self.transition(DriverState::Done),
            Err(e) if self.abort.is_cancelled() || e.is_cancelled() => {
                info!("Run {} aborted", report.run_id);
                self.transition(DriverState::Aborted);
                self.emit(DriverEvent::Aborted);
            }
            Err(e @ PlanexError::Halted { .. }) => {
                info!("Run {} halted: {}", report.run_id, e);
                report.error = Some(e.to_string());
                self.transition(DriverState::Aborted);
                self.emit(DriverEvent::Aborted);
            }
            Err(e) => {
                error!("Run {} failed ({}): {}", report.run_id, e.category(), e);
                report.error = Some(e.to_string());
                self.transition(DriverState::Failed);
                self.emit(DriverEvent::RunFailed { error: e.to_string() });
            }
        }

        report.state = self.state;
        report.finished_at = Some(Utc::now());
        report
    }

    async fn drive(&mut self, query: &str, report: &mut RunReport) -> Result<()> {
        self.check_abort()?;
        self.transition(DriverState::Planning);

        let messages = build_plan_prompt(query, &self.tools.describe_tools())?;
        let planning = self.stream_phases(&messages, StreamPurpose::Planning).await?;

        let mut plan = match (planning.plan, planning.final_answer) {
            (Some(plan), _) => plan,
            (None, Some(answer)) => {
                info!("Model answered directly; skipping execution");
                report.final_answer = Some(answer);
                return Ok(());
            }
            (None, None) => {
                return Err(PlanexError::planning(
                    "Model response contained neither a plan nor a final answer",
                ))
            }
        };

        info!("Plan materialized with {} steps", plan.len());
        report.plan = Some(plan.clone());
        self.emit(DriverEvent::PlanMaterialized { plan: plan.clone() });
        self.transition(DriverState::Executing);

        let mut session = StructuredPromptSession::new();
        session.start(query);
        let mut log = ExecutionLog::new();

        let coordinator =
            FailureRecoveryCoordinator::new().with_regenerator(StepRegenerator::new(self.model.clone(), self.tools.clone()));
        let mut executor = StepExecutor::new(
            self.tools.clone(),
            coordinator,
            self.config.executor_config(),
            self.events.clone(),
            self.abort.clone(),
        )
        .with_gate(self.gate.clone());
        if let Some(producer) = &self.content {
            executor = executor.with_content_producer(producer.clone());
        }

        for index in 0..plan.len() {
            self.wait_for_tools().await?;
            let outcome = executor.execute_step(&mut plan, index, &log, query).await;
            report.plan = Some(plan.clone());
            let result = outcome?;
            self.check_abort()?;

            debug!("Step {} finished (success: {})", result.step_id, result.success);
            self.emit(DriverEvent::StepResult { result: result.clone() });
            session.advance(&result);
            report.results.push(result.clone());
            log.append(result);
        }

        self.wait_for_tools().await?;
        self.check_abort()?;
        self.transition(DriverState::Synthesizing);

        let mut messages = build_final_answer_prompt(query, log.records(), &self.config.summary)?;
        // Tool-result messages go between the system prompt and the final request
        if let Some(request) = messages.pop() {
            messages.extend(session.messages().iter().cloned());
            messages.push(request);
        }

        let synthesis = self.stream_phases(&messages, StreamPurpose::Synthesis).await?;
        let answer = match synthesis.final_answer {
            Some(answer) => answer,
            None => {
                let text = synthesis.raw.trim().to_string();
                if text.is_empty() {
                    return Err(PlanexError::planning("Model returned an empty final answer"));
                }
                warn!("Final answer had no final_answer tags; using raw response");
                self.emit(DriverEvent::FinalAnswerDelta { delta: text.clone() });
                self.emit(DriverEvent::FinalAnswerComplete { text: text.clone() });
                text
            }
        };

        report.final_answer = Some(answer);
        session.reset();
        Ok(())
    }

    /// Bounded wait for any tool call still holding the gate
    async fn wait_for_tools(&self) -> Result<()> {
        let timeout = self.config.tool_wait_timeout();
        match self.gate.wait_idle(timeout, self.config.poll_interval(), &self.abort).await {
            Err(PlanexError::Timeout { .. }) => Err(PlanexError::execution(format!(
                "A tool call was still running after {}s; giving up on the run",
                timeout.as_secs()
            ))),
            other => other,
        }
    }

    /// Stream one model response through the phase parser
    async fn stream_phases(&self, messages: &[Message], purpose: StreamPurpose) -> Result<StreamOutcome> {
        self.check_abort()?;
        let mut parser = PhaseParser::new(self.config.action_tick_threshold);
        let mut outcome = StreamOutcome::default();
        let mut stream = self.model.stream_chat(messages, self.abort.clone()).await?;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.abort.cancelled() => return Err(PlanexError::cancelled("model stream")),
                next = stream.next() => next,
            };

            let chunk = match next {
                Some(chunk) => chunk?,
                None => break,
            };
            if let Some(delta) = chunk.delta.as_deref() {
                outcome.raw.push_str(delta);
                for event in parser.push(delta) {
                    self.handle_phase_event(event, &mut outcome, purpose)?;
                }
            }
            if self.is_settled(&outcome, purpose) || chunk.is_complete {
                break;
            }
        }

        if !self.is_settled(&outcome, purpose) {
            for event in parser.finish() {
                self.handle_phase_event(event, &mut outcome, purpose)?;
            }
        }
        Ok(outcome)
    }

    fn is_settled(&self, outcome: &StreamOutcome, purpose: StreamPurpose) -> bool {
        match purpose {
            StreamPurpose::Planning => outcome.plan.is_some() || outcome.final_answer.is_some(),
            StreamPurpose::Synthesis => outcome.final_answer.is_some(),
        }
    }

    fn handle_phase_event(&self, event: PhaseEvent, outcome: &mut StreamOutcome, purpose: StreamPurpose) -> Result<()> {
        match event {
            PhaseEvent::Phase { phase, content } => {
                debug!("Phase detected: {}", phase);
                if purpose == StreamPurpose::Planning && phase == Phase::Plan {
                    if outcome.plan.is_some() || outcome.final_answer.is_some() {
                        warn!("Ignoring additional plan phase");
                    } else {
                        outcome.plan = Some(Plan::from_phase_content(&content)?);
                    }
                }
                self.emit(DriverEvent::Phase { phase, content });
            }
            PhaseEvent::FinalAnswerDelta { delta } => {
                if outcome.plan.is_none() {
                    self.emit(DriverEvent::FinalAnswerDelta { delta });
                }
            }
            PhaseEvent::FinalAnswerComplete { text } => {
                if outcome.plan.is_none() && outcome.final_answer.is_none() {
                    outcome.final_answer = Some(text.clone());
                    self.emit(DriverEvent::FinalAnswerComplete { text });
                }
            }
        }
        Ok(())
    }
}
