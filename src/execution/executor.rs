//! Step executor: placeholder resolution, tool invocation and the recovery loop

use super::recovery::{FailureKind, FailureRecoveryCoordinator, PendingFailure, RecoveryDecision};
use super::{result_failure, ContentProducer, ToolError, ToolFacility, ToolGate};
use crate::planning::summary::observation;
use crate::planning::{ExecutionLog, ExecutionResult, Plan, PlaceholderResolver, PlanStep};
use crate::ui::events::DriverEvent;
use crate::utils::errors::PlanexError;
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timing and routing settings for step execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub tool_call_timeout: Duration,
    pub progress_tick: Duration,
    pub observation_max_chars: usize,
    /// Tools whose input is produced by the content producer first
    pub content_tools: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tool_call_timeout: Duration::from_secs(60),
            progress_tick: Duration::from_secs(1),
            observation_max_chars: 500,
            content_tools: vec!["generate_content".to_string()],
        }
    }
}

/// A failed attempt, before any decision was taken
struct AttemptFailure {
    args: Value,
    error: String,
    kind: FailureKind,
    available_fields: Vec<String>,
}

impl AttemptFailure {
    fn from_tool_error(args: Value, error: ToolError) -> Self {
        let kind = match error {
            ToolError::Timeout { .. } => FailureKind::Timeout,
            _ => FailureKind::ToolError,
        };
        Self {
            args,
            error: error.to_string(),
            kind,
            available_fields: Vec::new(),
        }
    }
}

/// Runs one plan step at a time until it reaches a terminal disposition
pub struct StepExecutor {
    tools: Arc<dyn ToolFacility>,
    content: Option<Arc<dyn ContentProducer>>,
    gate: ToolGate,
    coordinator: FailureRecoveryCoordinator,
    config: ExecutorConfig,
    events: mpsc::UnboundedSender<DriverEvent>,
    abort: CancellationToken,
}

impl StepExecutor {
    pub fn new(
        tools: Arc<dyn ToolFacility>,
        coordinator: FailureRecoveryCoordinator,
        config: ExecutorConfig,
        events: mpsc::UnboundedSender<DriverEvent>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            tools,
            content: None,
            gate: ToolGate::new(),
            coordinator,
            config,
            events,
            abort,
        }
    }

    pub fn with_content_producer(mut self, producer: Arc<dyn ContentProducer>) -> Self {
        self.content = Some(producer);
        self
    }

    /// Share an existing gate (the driver polls it between steps)
    pub fn with_gate(mut self, gate: ToolGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn gate(&self) -> &ToolGate {
        &self.gate
    }

    fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    /// Execute the step at `index`, including every retry and regeneration,
    /// and return the single record for its terminal disposition.
    ///
    /// Only run-level conditions are returned as errors: abort, or a decision
    /// handle dropped without an answer.
    pub async fn execute_step(
        &mut self,
        plan: &mut Plan,
        index: usize,
        log: &ExecutionLog,
        query: &str,
    ) -> Result<ExecutionResult> {
        'attempt: loop {
            if self.abort.is_cancelled() {
                return Err(PlanexError::cancelled(format!("step #{}", index + 1)));
            }

            let step = plan
                .get(index)
                .cloned()
                .ok_or_else(|| PlanexError::not_found(format!("plan step #{}", index + 1)))?;
            self.emit(DriverEvent::StepStarted {
                index,
                step: step.clone(),
            });

            let failure = match self.attempt(&step, index, log).await {
                Ok(_) if self.abort.is_cancelled() => {
                    return Err(PlanexError::cancelled(format!("step {}", step.step_id)));
                }
                Ok((args, result)) => {
                    let observation = observation(&result, self.config.observation_max_chars);
                    info!("Step {} ({}) completed", step.step_id, step.tool);
                    return Ok(ExecutionResult::succeeded(&step, index, args, result, observation));
                }
                Err(failure) => failure,
            };

            if self.abort.is_cancelled() {
                return Err(PlanexError::cancelled(format!("step {}", step.step_id)));
            }

            let mut pending = PendingFailure {
                tool_name: step.tool.clone(),
                args: failure.args.clone(),
                error: failure.error.clone(),
                step_id: step.step_id.clone(),
                step_index: index,
                kind: failure.kind,
                available_fields: failure.available_fields,
            };

            loop {
                let decision = self
                    .coordinator
                    .suspend(pending.clone(), &self.events, &self.abort)
                    .await?;

                match decision {
                    RecoveryDecision::Retry => {
                        debug!("Retrying step {}", step.step_id);
                        continue 'attempt;
                    }
                    RecoveryDecision::Skip => {
                        info!("Skipping step {} after failure", step.step_id);
                        let previous = log.last_successful_before(index).cloned();
                        return Ok(ExecutionResult::skipped(
                            &step,
                            index,
                            failure.args,
                            pending.error,
                            previous,
                        ));
                    }
                    RecoveryDecision::Regenerate => {
                        match self.coordinator.regenerate(query, &step, &pending, &self.abort).await {
                            Ok((regenerated, strategy)) => {
                                let replaced = plan.replace_step(index, regenerated)?.clone();
                                info!(
                                    "Step {} regenerated ({}): now uses {}",
                                    replaced.step_id, strategy, replaced.tool
                                );
                                self.emit(DriverEvent::StepRegenerated {
                                    index,
                                    step: replaced,
                                    strategy,
                                });
                                continue 'attempt;
                            }
                            Err(e) if e.is_cancelled() => return Err(e),
                            Err(e) => {
                                warn!("Regeneration of step {} failed: {}", step.step_id, e);
                                self.emit(DriverEvent::RegenerationFailed {
                                    index,
                                    step_id: step.step_id.clone(),
                                    error: e.to_string(),
                                });
                                pending.error = format!("{} (regeneration failed: {})", failure.error, e);
                            }
                        }
                    }
                }
            }
        }
    }

    /// One pass through resolving -> producing -> invoking
    async fn attempt(
        &self,
        step: &PlanStep,
        index: usize,
        log: &ExecutionLog,
    ) -> std::result::Result<(Value, Value), AttemptFailure> {
        let args = match PlaceholderResolver::new(log).resolve_step(step) {
            Ok(args) => args,
            Err(e) => {
                debug!("Placeholder resolution failed for {}: {}", step.step_id, e);
                return Err(AttemptFailure {
                    args: step.input.clone(),
                    error: e.to_string(),
                    kind: FailureKind::Placeholder,
                    available_fields: e.available_fields,
                });
            }
        };

        let args = match self.produce_content(step, args).await {
            Ok(args) => args,
            Err((args, e)) => {
                return Err(AttemptFailure {
                    args,
                    error: e.to_string(),
                    kind: FailureKind::ContentProduction,
                    available_fields: Vec::new(),
                })
            }
        };

        match self.invoke(&step.tool, args.clone(), index, &step.step_id).await {
            Ok(result) => match result_failure(&result) {
                Some(message) => Err(AttemptFailure {
                    args,
                    error: message,
                    kind: FailureKind::FailedResult,
                    available_fields: Vec::new(),
                }),
                None => Ok((args, result)),
            },
            Err(e) => Err(AttemptFailure::from_tool_error(args, e)),
        }
    }

    /// Route content-generation tools through the content producer
    async fn produce_content(&self, step: &PlanStep, args: Value) -> std::result::Result<Value, (Value, ToolError)> {
        let Some(producer) = &self.content else {
            return Ok(args);
        };
        if !self.config.content_tools.iter().any(|t| t == &step.tool) {
            return Ok(args);
        }

        debug!("Producing content for step {}", step.step_id);
        let produced = tokio::select! {
            _ = self.abort.cancelled() => Err(ToolError::Cancelled),
            produced = producer.produce(step, &args) => produced,
        };
        match produced {
            Ok(content) => Ok(content),
            Err(e) => Err((args, e)),
        }
    }

    /// Invoke a tool on its own task, bounded by the per-call timeout.
    /// Abandoned calls keep running; their result is dropped.
    async fn invoke(&self, tool: &str, args: Value, index: usize, step_id: &str) -> std::result::Result<Value, ToolError> {
        let tools = Arc::clone(&self.tools);
        let gate = self.gate.clone();
        let name = tool.to_string();
        let mut call = tokio::spawn(async move {
            let _busy = gate.enter();
            tools.execute(&name, args).await
        });

        let started = Instant::now();
        let deadline = tokio::time::sleep(self.config.tool_call_timeout);
        tokio::pin!(deadline);
        let tick = self.config.progress_tick.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(started + tick, tick);

        loop {
            tokio::select! {
                biased;
                _ = self.abort.cancelled() => return Err(ToolError::Cancelled),
                joined = &mut call => {
                    return match joined {
                        Ok(result) => result,
                        Err(e) => Err(ToolError::failed(tool, format!("tool task aborted: {}", e))),
                    };
                }
                _ = &mut deadline => {
                    warn!("Tool {} timed out after {:?}", tool, self.config.tool_call_timeout);
                    return Err(ToolError::Timeout {
                        tool: tool.to_string(),
                        timeout_ms: self.config.tool_call_timeout.as_millis() as u64,
                    });
                }
                _ = ticker.tick() => {
                    self.emit(DriverEvent::StepProgress {
                        index,
                        step_id: step_id.to_string(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls of every tool, then echoes the args
    struct FlakyTools {
        failures: usize,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FlakyTools {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ToolFacility for FlakyTools {
        fn describe_tools(&self) -> String {
            "- echo".to_string()
        }

        fn tool_names(&self) -> Vec<String> {
            vec!["echo".to_string()]
        }

        async fn execute(&self, name: &str, args: Value) -> std::result::Result<Value, ToolError> {
            tokio::time::sleep(self.delay).await;
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Ok(json!({"success": false, "error": format!("flaky call {}", call)}));
            }
            Ok(json!({"tool": name, "args": args}))
        }
    }

    fn executor(tools: Arc<dyn ToolFacility>, config: ExecutorConfig) -> (StepExecutor, mpsc::UnboundedReceiver<DriverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = StepExecutor::new(tools, FailureRecoveryCoordinator::new(), config, tx, CancellationToken::new());
        (executor, rx)
    }

    /// Answer every suspension with the given decisions, in order
    fn auto_decide(mut rx: mpsc::UnboundedReceiver<DriverEvent>, decisions: Vec<RecoveryDecision>) -> tokio::task::JoinHandle<usize> {
        tokio::spawn(async move {
            let mut decisions = decisions.into_iter();
            let mut suspensions = 0;
            while let Some(event) = rx.recv().await {
                if let DriverEvent::FailureSuspended { handle, .. } = event {
                    suspensions += 1;
                    match decisions.next() {
                        Some(decision) => {
                            handle.resolve(decision);
                        }
                        None => drop(handle),
                    }
                }
            }
            suspensions
        })
    }

    #[tokio::test]
    async fn test_successful_step_records_result() {
        let (mut executor, _rx) = executor(Arc::new(FlakyTools::new(0)), ExecutorConfig::default());
        let mut plan = Plan::new(vec![PlanStep::new("step1", "echo", json!({"x": 1}), "echo it")]);

        let result = executor.execute_step(&mut plan, 0, &ExecutionLog::new(), "q").await.unwrap();
        assert!(result.success);
        assert_eq!(result.tool_result, Some(json!({"tool": "echo", "args": {"x": 1}})));
        assert!(result.observation.contains("echo"));
    }

    #[tokio::test]
    async fn test_retry_yields_single_record() {
        let (mut executor, rx) = executor(Arc::new(FlakyTools::new(2)), ExecutorConfig::default());
        let decider = auto_decide(rx, vec![RecoveryDecision::Retry, RecoveryDecision::Retry]);
        let mut plan = Plan::new(vec![PlanStep::new("step1", "echo", json!("a"), "")]);

        let result = executor.execute_step(&mut plan, 0, &ExecutionLog::new(), "q").await.unwrap();
        assert!(result.success);
        drop(executor);
        assert_eq!(decider.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_skip_carries_previous_result() {
        let (mut executor, rx) = executor(Arc::new(FlakyTools::new(1)), ExecutorConfig::default());
        let _decider = auto_decide(rx, vec![RecoveryDecision::Skip]);

        let first = PlanStep::new("step1", "search", json!("q"), "");
        let mut log = ExecutionLog::new();
        log.append(ExecutionResult::succeeded(&first, 0, json!("q"), json!({"text": "hello"}), "hello".into()));

        let mut plan = Plan::new(vec![first, PlanStep::new("step2", "echo", json!("a"), "")]);
        let result = executor.execute_step(&mut plan, 1, &log, "q").await.unwrap();

        assert!(!result.success);
        assert_eq!(result.tool_error.as_deref(), Some("flaky call 0"));
        assert_eq!(result.tool_result.unwrap()["previousResult"], json!({"text": "hello"}));
    }

    #[tokio::test]
    async fn test_placeholder_failure_suspends_without_calling_tool() {
        let tools = Arc::new(FlakyTools::new(0));
        let (mut executor, mut rx) = executor(tools.clone(), ExecutorConfig::default());
        let mut plan = Plan::new(vec![PlanStep::new("step1", "echo", json!("{{step1.output.x}}"), "")]);

        let decider = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let DriverEvent::FailureSuspended { failure, handle } = event {
                    assert_eq!(failure.kind, FailureKind::Placeholder);
                    handle.skip();
                    return;
                }
            }
        });

        let result = executor.execute_step(&mut plan, 0, &ExecutionLog::new(), "q").await.unwrap();
        decider.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.tool_result.unwrap()["previousResult"], Value::Null);
        assert_eq!(tools.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_decision_halts() {
        let (mut executor, rx) = executor(Arc::new(FlakyTools::new(5)), ExecutorConfig::default());
        let _decider = auto_decide(rx, vec![]);
        let mut plan = Plan::new(vec![PlanStep::new("step1", "echo", json!("a"), "")]);

        let result = executor.execute_step(&mut plan, 0, &ExecutionLog::new(), "q").await;
        assert!(matches!(result, Err(PlanexError::Halted { .. })));
    }

    #[tokio::test]
    async fn test_timeout_becomes_step_failure_with_progress() {
        let tools = Arc::new(FlakyTools {
            failures: 0,
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(300),
        });
        let config = ExecutorConfig {
            tool_call_timeout: Duration::from_millis(60),
            progress_tick: Duration::from_millis(10),
            ..ExecutorConfig::default()
        };
        let (mut executor, mut rx) = executor(tools, config);
        let gate = executor.gate().clone();
        let mut plan = Plan::new(vec![PlanStep::new("step1", "echo", json!("a"), "")]);

        let decider = tokio::spawn(async move {
            let mut progress = 0;
            while let Some(event) = rx.recv().await {
                match event {
                    DriverEvent::StepProgress { .. } => progress += 1,
                    DriverEvent::FailureSuspended { failure, handle } => {
                        assert_eq!(failure.kind, FailureKind::Timeout);
                        handle.skip();
                        return progress;
                    }
                    _ => {}
                }
            }
            progress
        });

        let result = executor.execute_step(&mut plan, 0, &ExecutionLog::new(), "q").await.unwrap();
        assert!(!result.success);
        assert!(result.tool_error.unwrap().contains("timed out"));
        assert!(decider.await.unwrap() > 0);
        // The abandoned call is still running
        assert!(gate.is_busy());
    }

    struct Producer;

    #[async_trait]
    impl ContentProducer for Producer {
        async fn produce(&self, step: &PlanStep, input: &Value) -> std::result::Result<Value, ToolError> {
            Ok(json!({"content": format!("{} for {}", input["topic"].as_str().unwrap_or(""), step.step_id)}))
        }
    }

    #[tokio::test]
    async fn test_content_tools_use_producer_output() {
        let config = ExecutorConfig {
            content_tools: vec!["echo".to_string()],
            ..ExecutorConfig::default()
        };
        let (executor, _rx) = executor(Arc::new(FlakyTools::new(0)), config);
        let mut executor = executor.with_content_producer(Arc::new(Producer));
        let mut plan = Plan::new(vec![PlanStep::new("step1", "echo", json!({"topic": "poem"}), "")]);

        let result = executor.execute_step(&mut plan, 0, &ExecutionLog::new(), "q").await.unwrap();
        assert_eq!(result.tool_args, json!({"content": "poem for step1"}));
    }

    /// Fires the abort token and then reports success
    struct CancellingTool(CancellationToken);

    #[async_trait]
    impl ToolFacility for CancellingTool {
        fn describe_tools(&self) -> String {
            "- finish".to_string()
        }

        fn tool_names(&self) -> Vec<String> {
            vec!["finish".to_string()]
        }

        async fn execute(&self, _name: &str, _args: Value) -> std::result::Result<Value, ToolError> {
            self.0.cancel();
            Ok(json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn test_result_after_abort_is_discarded() {
        for _ in 0..25 {
            let (tx, _rx) = mpsc::unbounded_channel();
            let abort = CancellationToken::new();
            let mut executor = StepExecutor::new(
                Arc::new(CancellingTool(abort.clone())),
                FailureRecoveryCoordinator::new(),
                ExecutorConfig::default(),
                tx,
                abort,
            );
            let mut plan = Plan::new(vec![PlanStep::new("step1", "finish", json!({}), "")]);

            let result = executor.execute_step(&mut plan, 0, &ExecutionLog::new(), "q").await;
            assert!(result.unwrap_err().is_cancelled());
        }
    }

    /// Fails every call with a fixed error
    struct BrokenTool;

    #[async_trait]
    impl ToolFacility for BrokenTool {
        fn describe_tools(&self) -> String {
            "- broken".to_string()
        }

        fn tool_names(&self) -> Vec<String> {
            vec!["broken".to_string()]
        }

        async fn execute(&self, name: &str, _args: Value) -> std::result::Result<Value, ToolError> {
            Err(ToolError::failed(name, "boom"))
        }
    }

    #[tokio::test]
    async fn test_skip_after_failed_regeneration_keeps_note() {
        // No regenerator is configured, so regeneration always fails
        let (mut executor, rx) = executor(Arc::new(BrokenTool), ExecutorConfig::default());
        let _decider = auto_decide(rx, vec![RecoveryDecision::Regenerate, RecoveryDecision::Skip]);
        let mut plan = Plan::new(vec![PlanStep::new("step1", "broken", json!({}), "")]);

        let result = executor.execute_step(&mut plan, 0, &ExecutionLog::new(), "q").await.unwrap();
        let error = result.tool_error.unwrap();
        assert!(error.starts_with("Tool broken failed: boom"));
        assert!(error.contains("regeneration failed"));
    }

    #[tokio::test]
    async fn test_abort_before_step() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let abort = CancellationToken::new();
        let mut executor = StepExecutor::new(
            Arc::new(FlakyTools::new(0)),
            FailureRecoveryCoordinator::new(),
            ExecutorConfig::default(),
            tx,
            abort.clone(),
        );
        abort.cancel();
        let mut plan = Plan::new(vec![PlanStep::new("step1", "echo", json!("a"), "")]);
        let result = executor.execute_step(&mut plan, 0, &ExecutionLog::new(), "q").await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
