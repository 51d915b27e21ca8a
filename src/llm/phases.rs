//! Incremental phase detection over a streaming model response.
//!
//! The model answers in tag-delimited blocks (`<plan>...</plan>`,
//! `<action>...</action>`, `<final_answer>...</final_answer>`, ...). Chunks
//! arrive at arbitrary boundaries, so the parser keeps a buffer, runs one
//! detection pass per pushed chunk and emits an event for every block that is
//! structurally complete. Detected blocks are removed from the buffer together
//! with any untagged text in front of them.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

lazy_static! {
    static ref OPEN_TAG: Regex =
        Regex::new(r"<(question|plan|thought|action|observation|final_answer)>").unwrap();
}

const TOOL_ENVELOPE_OPEN: &str = "<use_mcp_tool>";
const TOOL_ENVELOPE_PARTS: [&str; 5] = [
    "<tool_name>",
    "</tool_name>",
    "<arguments>",
    "</arguments>",
    "</use_mcp_tool>",
];
const FINAL_ANSWER_CLOSE: &str = "</final_answer>";

/// One labeled segment of model output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Question,
    Plan,
    Thought,
    Action,
    Observation,
    FinalAnswer,
}

impl Phase {
    /// All phases in tag-set order
    pub const ALL: [Phase; 6] = [
        Phase::Question,
        Phase::Plan,
        Phase::Thought,
        Phase::Action,
        Phase::Observation,
        Phase::FinalAnswer,
    ];

    /// Tag name used in model output
    pub fn tag(&self) -> &'static str {
        match self {
            Phase::Question => "question",
            Phase::Plan => "plan",
            Phase::Thought => "thought",
            Phase::Action => "action",
            Phase::Observation => "observation",
            Phase::FinalAnswer => "final_answer",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.tag() == tag)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Output of a detection pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseEvent {
    /// A complete block other than the final answer
    Phase { phase: Phase, content: String },
    /// Incremental final answer text
    FinalAnswerDelta { delta: String },
    /// The final answer closed; carries the full text
    FinalAnswerComplete { text: String },
}

/// Tracks "still incomplete" ticks against one exact action block
#[derive(Debug, Default)]
struct ActionTicks {
    block: String,
    count: u32,
}

/// Streaming tag parser
#[derive(Debug)]
pub struct PhaseParser {
    buffer: String,
    current: Option<Phase>,
    action_tick_threshold: u32,
    action_ticks: ActionTicks,
    /// Text of the final answer streamed so far; `Some` while streaming
    final_answer: Option<String>,
}

impl Default for PhaseParser {
    fn default() -> Self {
        Self::new(10)
    }
}

enum PassOutcome {
    /// A block was consumed; look for the next one
    Continue,
    /// Nothing more can be detected in this pass
    Stop,
}

impl PhaseParser {
    /// Create a parser that force-accepts an incomplete action block on the
    /// `action_tick_threshold`-th pass that sees it unchanged.
    pub fn new(action_tick_threshold: u32) -> Self {
        Self {
            buffer: String::new(),
            current: None,
            action_tick_threshold: action_tick_threshold.max(1),
            action_ticks: ActionTicks::default(),
            final_answer: None,
        }
    }

    /// Currently active phase, if any
    pub fn current_phase(&self) -> Option<Phase> {
        self.current
    }

    /// Whether final answer text is being streamed
    pub fn is_streaming_final_answer(&self) -> bool {
        self.final_answer.is_some()
    }

    /// Unconsumed buffer contents
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Append a chunk and run one detection pass
    pub fn push(&mut self, delta: &str) -> Vec<PhaseEvent> {
        self.buffer.push_str(delta);
        self.detect(false)
    }

    /// End of stream: flush an unterminated final answer and force-accept a
    /// pending incomplete action.
    pub fn finish(&mut self) -> Vec<PhaseEvent> {
        let mut events = self.detect(true);

        if let Some(mut text) = self.final_answer.take() {
            if !self.buffer.is_empty() {
                let rest = std::mem::take(&mut self.buffer);
                text.push_str(&rest);
                events.push(PhaseEvent::FinalAnswerDelta { delta: rest });
            }
            debug!("Flushing unterminated final answer at end of stream");
            events.push(PhaseEvent::FinalAnswerComplete {
                text: text.trim().to_string(),
            });
        }

        self.action_ticks = ActionTicks::default();
        events
    }

    fn detect(&mut self, at_end: bool) -> Vec<PhaseEvent> {
        let mut events = Vec::new();

        loop {
            let outcome = if self.final_answer.is_some() {
                self.stream_final_answer(&mut events)
            } else {
                self.detect_block(&mut events, at_end)
            };

            if let PassOutcome::Stop = outcome {
                break;
            }
        }

        events
    }

    fn stream_final_answer(&mut self, events: &mut Vec<PhaseEvent>) -> PassOutcome {
        let Some(text) = self.final_answer.as_mut() else {
            return PassOutcome::Stop;
        };

        if let Some(close) = self.buffer.find(FINAL_ANSWER_CLOSE) {
            let tail: String = self.buffer[..close].to_string();
            if !tail.is_empty() {
                text.push_str(&tail);
                events.push(PhaseEvent::FinalAnswerDelta { delta: tail });
            }
            let full = text.trim().to_string();
            self.buffer.drain(..close + FINAL_ANSWER_CLOSE.len());
            self.final_answer = None;
            debug!("Final answer complete ({} chars)", full.len());
            events.push(PhaseEvent::FinalAnswerComplete { text: full });
            // A duplicate closed block later in this buffer is not processed in this pass
            return PassOutcome::Stop;
        }

        let safe = self.buffer.len() - partial_suffix_len(&self.buffer, FINAL_ANSWER_CLOSE);
        if safe > 0 {
            let delta: String = self.buffer.drain(..safe).collect();
            text.push_str(&delta);
            events.push(PhaseEvent::FinalAnswerDelta { delta });
        }
        PassOutcome::Stop
    }

    fn detect_block(&mut self, events: &mut Vec<PhaseEvent>, at_end: bool) -> PassOutcome {
        let Some(open) = OPEN_TAG.captures(&self.buffer) else {
            return PassOutcome::Stop;
        };
        let (open_start, open_end) = match open.get(0) {
            Some(m) => (m.start(), m.end()),
            None => return PassOutcome::Stop,
        };
        let Some(phase) = open.get(1).and_then(|m| Phase::from_tag(m.as_str())) else {
            return PassOutcome::Stop;
        };

        if phase == Phase::FinalAnswer {
            self.buffer.drain(..open_end);
            self.current = Some(Phase::FinalAnswer);
            self.final_answer = Some(String::new());
            debug!("Final answer streaming started");
            return PassOutcome::Continue;
        }

        let close_tag = format!("</{}>", phase.tag());
        let closes: Vec<usize> = self.buffer[open_end..]
            .match_indices(&close_tag)
            .map(|(i, _)| open_end + i)
            .collect();
        let Some(&first_close) = closes.first() else {
            return PassOutcome::Stop;
        };

        let close_at = if phase == Phase::Action {
            match self.accept_action(open_start, open_end, &closes, &close_tag, at_end) {
                Some(close_at) => close_at,
                None => return PassOutcome::Stop,
            }
        } else {
            first_close
        };

        let content = self.buffer[open_end..close_at].trim().to_string();
        self.buffer.drain(..close_at + close_tag.len());
        self.current = Some(phase);
        debug!("Detected {} phase ({} chars)", phase, content.len());
        events.push(PhaseEvent::Phase { phase, content });
        PassOutcome::Continue
    }

    /// Pick the closing tag position for an action block, or `None` while the
    /// block is still considered incomplete.
    fn accept_action(
        &mut self,
        open_start: usize,
        open_end: usize,
        closes: &[usize],
        close_tag: &str,
        at_end: bool,
    ) -> Option<usize> {
        let first_close = closes[0];
        if !self.buffer[open_end..first_close].contains(TOOL_ENVELOPE_OPEN) {
            self.action_ticks = ActionTicks::default();
            return Some(first_close);
        }

        if let Some(&complete) = closes
            .iter()
            .find(|&&close| envelope_complete(&self.buffer[open_end..close]))
        {
            self.action_ticks = ActionTicks::default();
            return Some(complete);
        }

        let block = &self.buffer[open_start..first_close + close_tag.len()];
        if self.action_ticks.block == block {
            self.action_ticks.count += 1;
        } else {
            self.action_ticks = ActionTicks {
                block: block.to_string(),
                count: 1,
            };
        }

        if at_end || self.action_ticks.count >= self.action_tick_threshold {
            warn!(
                "Force-accepting incomplete action block after {} tick(s)",
                self.action_ticks.count
            );
            self.action_ticks = ActionTicks::default();
            return Some(first_close);
        }

        debug!(
            "Action block incomplete ({}/{})",
            self.action_ticks.count, self.action_tick_threshold
        );
        None
    }
}

fn envelope_complete(content: &str) -> bool {
    TOOL_ENVELOPE_PARTS.iter().all(|part| content.contains(part))
}

/// Length of the longest proper prefix of `tag` that `text` ends with
fn partial_suffix_len(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&k| text.ends_with(&tag[..k]))
        .unwrap_or(0)
}

/// Extract the tool envelope of an action block, if present
pub fn parse_tool_envelope(content: &str) -> Option<(String, String)> {
    let name = between(content, "<tool_name>", "</tool_name>")?;
    let arguments = between(content, "<arguments>", "</arguments>").unwrap_or_default();
    Some((name.trim().to_string(), arguments.trim().to_string()))
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(&text[start..end])
}
