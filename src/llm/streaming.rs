//! Streaming support for LLM responses

use super::{LlmError, TokenUsage};
use futures::stream::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Represents a chunk of streaming response data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// The incremental text for this chunk
    pub delta: Option<String>,
    /// Set on the last chunk of a response
    pub is_complete: bool,
    /// Token usage information (usually only in the final chunk)
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    /// Create a new content chunk
    pub fn content<S: Into<String>>(delta: S) -> Self {
        Self {
            delta: Some(delta.into()),
            is_complete: false,
            usage: None,
        }
    }

    /// Create a final chunk with optional usage
    pub fn finish(usage: Option<TokenUsage>) -> Self {
        Self {
            delta: None,
            is_complete: true,
            usage,
        }
    }

    /// Check if this is a content chunk
    pub fn is_content(&self) -> bool {
        self.delta.as_deref().map_or(false, |d| !d.is_empty())
    }

    /// Check if this is the final chunk
    pub fn is_final(&self) -> bool {
        self.is_complete
    }
}

/// Stream of chunks from an LLM response
pub type LlmStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// Utility for collecting streaming responses into complete text
#[derive(Debug, Default)]
pub struct StreamCollector {
    content_buffer: String,
    usage: Option<TokenUsage>,
    complete: bool,
}

impl StreamCollector {
    /// Create a new stream collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a stream chunk
    pub fn process_chunk(&mut self, chunk: &StreamChunk) {
        if let Some(delta) = &chunk.delta {
            self.content_buffer.push_str(delta);
        }
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }
        if chunk.is_complete {
            self.complete = true;
        }
    }

    /// Text collected so far
    pub fn content(&self) -> &str {
        &self.content_buffer
    }

    /// Usage reported by the provider, if any
    pub fn usage(&self) -> Option<&TokenUsage> {
        self.usage.as_ref()
    }

    /// Whether the final chunk has been seen
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Consume the collector and return the collected text
    pub fn into_text(self) -> String {
        self.content_buffer
    }

    /// Collect all chunks from a stream into text, honouring the abort signal
    pub async fn collect_stream(mut stream: LlmStream, abort: &CancellationToken) -> Result<String, LlmError> {
        let mut collector = Self::new();

        loop {
            let next = tokio::select! {
                _ = abort.cancelled() => return Err(LlmError::Cancelled),
                next = stream.next() => next,
            };

            match next {
                Some(chunk) => {
                    let chunk = chunk?;
                    collector.process_chunk(&chunk);
                    if chunk.is_final() {
                        break;
                    }
                }
                None => break,
            }
        }

        Ok(collector.into_text())
    }
}

/// Server-Sent Events (SSE) parser for streaming responses
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse incoming data and extract complete SSE events
    pub fn parse(&mut self, data: &str) -> Vec<SseEvent> {
        // Providers mix \r\n and \n line endings
        self.buffer.push_str(&data.replace("\r\n", "\n"));
        let mut events = Vec::new();

        while let Some(event_end) = self.buffer.find("\n\n") {
            let event_data = self.buffer[..event_end].to_string();
            self.buffer.drain(..event_end + 2);

            if let Some(event) = Self::parse_event(&event_data) {
                events.push(event);
            }
        }

        events
    }

    fn parse_event(data: &str) -> Option<SseEvent> {
        let mut event_type = None;
        let mut event_data = String::new();
        let mut event_id = None;

        for line in data.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(colon_pos) = line.find(':') {
                let field = &line[..colon_pos];
                let value = line[colon_pos + 1..].trim_start();

                match field {
                    "event" => event_type = Some(value.to_string()),
                    "data" => {
                        if !event_data.is_empty() {
                            event_data.push('\n');
                        }
                        event_data.push_str(value);
                    }
                    "id" => event_id = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        if !event_data.is_empty() {
            Some(SseEvent {
                event_type,
                data: event_data,
                id: event_id,
            })
        } else {
            None
        }
    }
}

/// Represents a Server-Sent Event
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Check if this is a completion event (indicating end of stream)
    pub fn is_completion(&self) -> bool {
        self.event_type.as_deref() == Some("done") || self.data == "[DONE]"
    }
}

/// Build an [`LlmStream`] from pre-recorded text, split into fixed-size chunks
pub fn stream_from_text(text: &str, chunk_size: usize) -> LlmStream {
    let mut chunks: Vec<Result<StreamChunk, LlmError>> = crate::utils::text::chunk_chars(text, chunk_size)
        .into_iter()
        .map(|c| Ok(StreamChunk::content(c)))
        .collect();
    chunks.push(Ok(StreamChunk::finish(None)));
    Box::pin(futures::stream::iter(chunks))
}
