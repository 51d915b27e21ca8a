//! Events emitted by the plan-execute driver

use crate::execution::{DecisionHandle, PendingFailure, RegenerationStrategy};
use crate::llm::Phase;
use crate::planning::{DriverState, ExecutionResult, Plan, PlanStep};

/// Everything a UI needs to follow a run.
///
/// `FailureSuspended` carries the only handle able to resume a suspended
/// step; dropping it halts the run.
#[derive(Debug)]
pub enum DriverEvent {
    /// Driver moved between states
    StateChanged { from: DriverState, to: DriverState },
    /// A complete phase block was parsed from the planning stream
    Phase { phase: Phase, content: String },
    /// The plan was accepted and execution is about to start
    PlanMaterialized { plan: Plan },
    /// A step attempt started
    StepStarted { index: usize, step: PlanStep },
    /// Periodic tick while a tool call is outstanding
    StepProgress {
        index: usize,
        step_id: String,
        elapsed_ms: u64,
    },
    /// A step reached its terminal disposition
    StepResult { result: ExecutionResult },
    /// A step failed and waits for a recovery decision
    FailureSuspended {
        failure: PendingFailure,
        handle: DecisionHandle,
    },
    /// A failed step was rewritten by the model
    StepRegenerated {
        index: usize,
        step: PlanStep,
        strategy: RegenerationStrategy,
    },
    /// Rewriting a failed step did not produce a usable step
    RegenerationFailed {
        index: usize,
        step_id: String,
        error: String,
    },
    FinalAnswerDelta { delta: String },
    FinalAnswerComplete { text: String },
    /// Run-level failure; the run has ended
    RunFailed { error: String },
    Aborted,
}

impl DriverEvent {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            DriverEvent::StateChanged { .. } => "state_changed",
            DriverEvent::Phase { .. } => "phase",
            DriverEvent::PlanMaterialized { .. } => "plan_materialized",
            DriverEvent::StepStarted { .. } => "step_started",
            DriverEvent::StepProgress { .. } => "step_progress",
            DriverEvent::StepResult { .. } => "step_result",
            DriverEvent::FailureSuspended { .. } => "failure_suspended",
            DriverEvent::StepRegenerated { .. } => "step_regenerated",
            DriverEvent::RegenerationFailed { .. } => "regeneration_failed",
            DriverEvent::FinalAnswerDelta { .. } => "final_answer_delta",
            DriverEvent::FinalAnswerComplete { .. } => "final_answer_complete",
            DriverEvent::RunFailed { .. } => "run_failed",
            DriverEvent::Aborted => "aborted",
        }
    }

    /// True for events after which the driver emits nothing else
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DriverEvent::FinalAnswerComplete { .. } | DriverEvent::RunFailed { .. } | DriverEvent::Aborted
        )
    }
}
