//! Scripted collaborators for driving full plan-execute runs

#![allow(dead_code)]

use async_trait::async_trait;
use planex::execution::{PendingFailure, RecoveryDecision, RegenerationStrategy, ToolError, ToolFacility};
use planex::llm::{stream_from_text, LlmError, LlmStream, Message, ModelClient};
use planex::planning::PlanStep;
use planex::ui::DriverEvent;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Model that replays queued responses in small chunks
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|r| Ok(r.to_string())).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// Model whose first call fails
    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::from(vec![Err(message.to_string())])),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompt(&self, call: usize) -> Vec<Message> {
        self.prompts.lock().unwrap()[call].clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(&self, messages: &[Message], _abort: CancellationToken) -> Result<LlmStream, LlmError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(stream_from_text(&text, 5)),
            Some(Err(message)) => Err(LlmError::RequestFailed { status: 500, message }),
            None => Err(LlmError::StreamInterrupted {
                message: "no scripted response left".to_string(),
            }),
        }
    }
}

/// One scripted tool outcome
#[derive(Clone)]
pub enum ToolReply {
    Ok(Value),
    Err(ToolError),
    Slow(Duration, Value),
    /// Fires the abort token, then succeeds anyway
    CancelThenOk(CancellationToken, Value),
}

/// Tools answering from per-tool queues; the last reply repeats
pub struct ScriptedTools {
    replies: Mutex<HashMap<String, VecDeque<ToolReply>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTools {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with(self, tool: &str, replies: Vec<ToolReply>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(tool.to_string(), replies.into_iter().collect());
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, tool: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(name, _)| name == tool)
            .map(|(_, args)| args)
            .collect()
    }
}

#[async_trait]
impl ToolFacility for ScriptedTools {
    fn describe_tools(&self) -> String {
        let mut names = self.tool_names();
        names.sort();
        names
            .iter()
            .map(|name| format!("- {}(input: object): scripted tool", name))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn tool_names(&self) -> Vec<String> {
        self.replies.lock().unwrap().keys().cloned().collect()
    }

    async fn execute(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        self.calls.lock().unwrap().push((name.to_string(), args));
        let reply = {
            let mut replies = self.replies.lock().unwrap();
            let queue = replies
                .get_mut(name)
                .ok_or_else(|| ToolError::NotFound { name: name.to_string() })?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        };

        match reply {
            Some(ToolReply::Ok(value)) => Ok(value),
            Some(ToolReply::Err(error)) => Err(error),
            Some(ToolReply::Slow(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Some(ToolReply::CancelThenOk(abort, value)) => {
                abort.cancel();
                Ok(value)
            }
            None => Err(ToolError::failed(name, "no scripted reply")),
        }
    }
}

/// What the responder saw during a run
#[derive(Debug, Default)]
pub struct Transcript {
    pub kinds: Vec<&'static str>,
    pub failures: Vec<PendingFailure>,
    pub regenerated: Vec<(PlanStep, RegenerationStrategy)>,
    pub answer: String,
}

/// Answers suspended failures in order (`None` drops the handle) and
/// optionally cancels `abort` when the given step starts.
pub fn spawn_responder(
    mut events: mpsc::UnboundedReceiver<DriverEvent>,
    decisions: Vec<Option<RecoveryDecision>>,
    cancel_at_step: Option<(usize, CancellationToken)>,
) -> JoinHandle<Transcript> {
    tokio::spawn(async move {
        let mut decisions = VecDeque::from(decisions);
        let mut transcript = Transcript::default();

        while let Some(event) = events.recv().await {
            transcript.kinds.push(event.kind());
            match event {
                DriverEvent::StepStarted { index, .. } => {
                    if let Some((at, abort)) = &cancel_at_step {
                        if *at == index {
                            abort.cancel();
                        }
                    }
                }
                DriverEvent::FailureSuspended { failure, handle } => {
                    transcript.failures.push(failure);
                    match decisions.pop_front().flatten() {
                        Some(decision) => {
                            handle.resolve(decision);
                        }
                        None => drop(handle),
                    }
                }
                DriverEvent::StepRegenerated { step, strategy, .. } => {
                    transcript.regenerated.push((step, strategy));
                }
                DriverEvent::FinalAnswerDelta { delta } => transcript.answer.push_str(&delta),
                _ => {}
            }
        }
        transcript
    })
}
