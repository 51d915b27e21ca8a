//! OpenAI-compatible streaming chat client (OpenRouter, OpenAI)

use super::streaming::{LlmStream, SseParser, StreamChunk};
use super::{GenerationConfig, LlmError, Message, ModelClient, TokenUsage};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default API base URL for a provider name
pub fn default_base_url(provider: &str) -> &'static str {
    match provider.to_lowercase().as_str() {
        "openai" => OPENAI_BASE_URL,
        _ => OPENROUTER_BASE_URL,
    }
}

/// Streaming chat client for OpenAI-compatible endpoints
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    provider_name: String,
    generation: GenerationConfig,
}

impl OpenRouterClient {
    /// Create a new OpenRouter client
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_config(api_key, model, None, None)
    }

    /// Create a client with custom configuration
    pub fn with_config(
        api_key: String,
        model: String,
        base_url: Option<String>,
        generation: Option<GenerationConfig>,
    ) -> Self {
        let base_url = base_url
            .unwrap_or_else(|| OPENROUTER_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let provider_name = if base_url.contains("api.openai.com") {
            "openai"
        } else {
            "openrouter"
        };

        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_key,
            model,
            base_url,
            provider_name: provider_name.to_string(),
            generation: generation.unwrap_or_default(),
        }
    }

    /// Override the reported provider name
    pub fn with_provider_name<S: Into<String>>(mut self, name: S) -> Self {
        self.provider_name = name.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn create_headers(&self) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(|_| {
            LlmError::Authentication {
                message: "API key contains invalid header characters".to_string(),
            }
        })?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("X-Title", HeaderValue::from_static("planex"));
        Ok(headers)
    }

    fn request_body(&self, messages: &[Message]) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });

        if let Some(temp) = self.generation.temperature {
            body["temperature"] = temp.into();
        }
        if let Some(max_tokens) = self.generation.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        if let Some(top_p) = self.generation.top_p {
            body["top_p"] = top_p.into();
        }
        body
    }

    /// Open the streaming response.
    ///
    /// Failures are returned as-is; a failed model call ends the run.
    async fn open_stream(
        &self,
        body: &serde_json::Value,
        abort: &CancellationToken,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let headers = self.create_headers()?;
        let send = self.client.post(&url).headers(headers).json(body).send();

        let response = tokio::select! {
            _ = abort.cancelled() => return Err(LlmError::Cancelled),
            result = send => result.map_err(LlmError::Network)?,
        };
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let error = Self::parse_error_response(status, &text, &self.model);
        warn!("Model request failed: {}", error);
        Err(error)
    }

    /// Parse error response and return appropriate LlmError
    fn parse_error_response(status: u16, body: &str, model: &str) -> LlmError {
        match status {
            429 => {
                let retry_after = serde_json::from_str::<serde_json::Value>(body)
                    .ok()
                    .and_then(|json| {
                        json.get("retry_after")
                            .and_then(|v| v.as_u64())
                            .or_else(|| json.pointer("/error/retry_after").and_then(|v| v.as_u64()))
                    });
                LlmError::RateLimit { retry_after }
            }
            401 | 403 => LlmError::Authentication {
                message: "Invalid API key or insufficient permissions".to_string(),
            },
            400 | 404 if body.contains("model") && (body.contains("not found") || body.contains("invalid")) => {
                LlmError::InvalidModel {
                    model: model.to_string(),
                }
            }
            _ => LlmError::RequestFailed {
                status,
                message: body.to_string(),
            },
        }
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        abort: CancellationToken,
    ) -> Result<LlmStream, LlmError> {
        let body = self.request_body(messages);
        debug!(
            "Opening {} stream with {} message(s) for model {}",
            self.provider_name,
            messages.len(),
            self.model
        );
        let response = self.open_stream(&body, &abort).await?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()));
        Ok(sse_chunks(Box::pin(bytes), abort))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

struct SseState {
    bytes: ByteStream,
    parser: SseParser,
    pending_bytes: Vec<u8>,
    queue: VecDeque<Result<StreamChunk, LlmError>>,
    usage: Option<TokenUsage>,
    abort: CancellationToken,
    done: bool,
}

impl SseState {
    fn ingest(&mut self, bytes: &[u8]) {
        self.pending_bytes.extend_from_slice(bytes);

        // Chunk boundaries can split multi-byte characters; only an
        // incomplete trailing sequence is held back
        let mut text = String::new();
        loop {
            let (valid, invalid) = match std::str::from_utf8(&self.pending_bytes) {
                Ok(_) => (self.pending_bytes.len(), None),
                Err(e) => (e.valid_up_to(), Some(e.error_len())),
            };
            text.push_str(&String::from_utf8_lossy(&self.pending_bytes[..valid]));
            match invalid {
                Some(Some(len)) => {
                    text.push(char::REPLACEMENT_CHARACTER);
                    self.pending_bytes.drain(..valid + len);
                }
                _ => {
                    self.pending_bytes.drain(..valid);
                    break;
                }
            }
        }

        for event in self.parser.parse(&text) {
            if event.is_completion() {
                self.finish();
                return;
            }

            match parse_chunk(&event.data) {
                Ok((delta, usage)) => {
                    if usage.is_some() {
                        self.usage = usage;
                    }
                    if let Some(delta) = delta.filter(|d| !d.is_empty()) {
                        self.queue.push_back(Ok(StreamChunk::content(delta)));
                    }
                }
                Err(e) => {
                    self.queue.push_back(Err(e));
                    self.done = true;
                    return;
                }
            }
        }
    }

    fn finish(&mut self) {
        self.queue.push_back(Ok(StreamChunk::finish(self.usage.take())));
        self.done = true;
    }
}

/// Parse one SSE `data:` payload into a text delta and optional usage
fn parse_chunk(data: &str) -> Result<(Option<String>, Option<TokenUsage>), LlmError> {
    let json: serde_json::Value = serde_json::from_str(data)?;

    if let Some(error) = json.get("error") {
        return Err(LlmError::StreamInterrupted {
            message: error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        });
    }

    let delta = json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .map(str::to_string);

    let usage = json.get("usage").and_then(|u| u.as_object()).map(|u| TokenUsage {
        prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        completion_tokens: u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
    });

    Ok((delta, usage))
}

fn sse_chunks(bytes: ByteStream, abort: CancellationToken) -> LlmStream {
    let state = SseState {
        bytes,
        parser: SseParser::new(),
        pending_bytes: Vec::new(),
        queue: VecDeque::new(),
        usage: None,
        abort,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            let next = tokio::select! {
                _ = state.abort.cancelled() => None,
                next = state.bytes.next() => Some(next),
            };

            match next {
                None => {
                    state.done = true;
                    return Some((Err(LlmError::Cancelled), state));
                }
                Some(Some(Ok(bytes))) => state.ingest(&bytes),
                Some(Some(Err(e))) => {
                    state.done = true;
                    return Some((
                        Err(LlmError::StreamInterrupted {
                            message: e.to_string(),
                        }),
                        state,
                    ));
                }
                // Connection closed without [DONE]
                Some(None) => state.finish(),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(parts: Vec<&'static str>) -> ByteStream {
        Box::pin(stream::iter(
            parts.into_iter().map(|p| Ok(p.as_bytes().to_vec())),
        ))
    }

    #[test]
    fn test_default_base_url() {
        assert_eq!(default_base_url("openai"), "https://api.openai.com/v1");
        assert_eq!(default_base_url("OpenRouter"), "https://openrouter.ai/api/v1");
    }

    #[test]
    fn test_provider_name_from_base_url() {
        let client = OpenRouterClient::with_config(
            "k".to_string(),
            "m".to_string(),
            Some("https://api.openai.com/v1/".to_string()),
            None,
        );
        assert_eq!(client.name(), "openai");
        assert_eq!(client.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn test_request_body_enables_streaming() {
        let client = OpenRouterClient::new("k".to_string(), "m".to_string());
        let body = client.request_body(&[Message::user("hi")]);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn test_parse_error_response() {
        assert!(matches!(
            OpenRouterClient::parse_error_response(429, r#"{"error":{"retry_after":3}}"#, "m"),
            LlmError::RateLimit { retry_after: Some(3) }
        ));
        assert!(matches!(
            OpenRouterClient::parse_error_response(401, "", "m"),
            LlmError::Authentication { .. }
        ));
        assert!(matches!(
            OpenRouterClient::parse_error_response(400, "model not found", "x/y"),
            LlmError::InvalidModel { ref model } if model == "x/y"
        ));
    }

    #[tokio::test]
    async fn test_sse_chunks_yield_deltas_until_done() {
        let bytes = byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"<plan>\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"x</pl",
            "an>\"}}]}\n\ndata: {\"choices\":[],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n",
        ]);

        let chunks: Vec<_> = sse_chunks(bytes, CancellationToken::new()).collect().await;
        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].delta.as_deref(), Some("<plan>"));
        assert_eq!(chunks[1].delta.as_deref(), Some("x</plan>"));
        assert!(chunks[2].is_final());
        assert_eq!(chunks[2].usage.as_ref().map(|u| u.total_tokens), Some(3));
    }

    #[tokio::test]
    async fn test_sse_chunks_surface_provider_errors() {
        let bytes = byte_stream(vec!["data: {\"error\":{\"message\":\"context length exceeded\"}}\n\n"]);
        let chunks: Vec<_> = sse_chunks(bytes, CancellationToken::new()).collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], Err(LlmError::StreamInterrupted { message }) if message.contains("context length")));
    }

    #[tokio::test]
    async fn test_sse_chunks_stop_on_abort() {
        let abort = CancellationToken::new();
        abort.cancel();
        let bytes: ByteStream = Box::pin(stream::pending());
        let chunks: Vec<_> = sse_chunks(bytes, abort).collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Err(LlmError::Cancelled)));
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stall_stream() {
        let bytes: ByteStream = Box::pin(stream::iter(vec![
            Ok(b"\xFF\n\n".to_vec()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"caf\xC3".to_vec()),
            Ok(b"\xA9\"}}]}\n\ndata: [DONE]\n\n".to_vec()),
        ]));

        let chunks: Vec<_> = sse_chunks(bytes, CancellationToken::new()).collect().await;
        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].delta.as_deref(), Some("café"));
        assert!(chunks[1].is_final());
    }

    #[tokio::test]
    async fn test_failed_request_is_not_retried() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                seen.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 4096];
                    // Read headers and body before answering
                    loop {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        request.extend_from_slice(&buf[..n]);
                        let text = String::from_utf8_lossy(&request).to_lowercase();
                        if let Some(end) = text.find("\r\n\r\n") {
                            let length = text
                                .lines()
                                .find_map(|l| l.strip_prefix("content-length:"))
                                .and_then(|v| v.trim().parse::<usize>().ok())
                                .unwrap_or(0);
                            if request.len() >= end + 4 + length {
                                break;
                            }
                        }
                    }
                    let _ = socket
                        .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 4\r\nconnection: close\r\n\r\nbusy")
                        .await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        let client = OpenRouterClient::with_config(
            "k".to_string(),
            "m".to_string(),
            Some(format!("http://{}/v1", addr)),
            None,
        );
        let result = client.stream_chat(&[Message::user("hi")], CancellationToken::new()).await;

        assert!(matches!(result, Err(LlmError::RequestFailed { status: 503, .. })));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }
}
