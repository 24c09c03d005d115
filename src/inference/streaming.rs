//! SSE streaming response parser for OpenAI-compatible chat completions.
//!
//! Reads an HTTP body as a byte stream, splits on SSE boundaries
//! (`data: …\n\n`), parses each event as JSON, and accumulates tool call
//! fragments across deltas until the model finishes the turn.

use std::fmt::Display;
use std::pin::Pin;

use futures::stream::{self, Stream, StreamExt};
use uuid::Uuid;

use super::errors::InferenceError;
use super::types::{ChatCompletionChunk, StreamChunk, ToolCallRequest};

// ─── SSE reader ──────────────────────────────────────────────────────────────

/// Parse raw SSE bytes into `StreamChunk`s.
///
/// 1. Buffers bytes until a complete SSE event (`\n\n`) is available
/// 2. Parses each `data:` payload as a `ChatCompletionChunk`
/// 3. Accumulates tool call fragments by index
/// 4. Emits the completed tool calls once the model reports a finish reason,
///    on `[DONE]`, or when the body ends
pub fn parse_sse_stream<S, B, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<StreamChunk, InferenceError>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let reader = SseReader {
        bytes: Box::pin(byte_stream),
        state: StreamState::default(),
        buffer: Vec::new(),
        exhausted: false,
    };

    stream::unfold(reader, |mut reader| async move {
        let item = reader.next_chunk().await?;
        Some((item, reader))
    })
}

struct SseReader<S> {
    bytes: Pin<Box<S>>,
    state: StreamState,
    /// Bytes of incomplete SSE events. Kept as bytes so a multi-byte UTF-8
    /// character split across network reads is decoded whole.
    buffer: Vec<u8>,
    exhausted: bool,
}

impl<S, B, E> SseReader<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    async fn next_chunk(&mut self) -> Option<Result<StreamChunk, InferenceError>> {
        loop {
            if let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
                let event: Vec<u8> = self.buffer.drain(..end + 2).collect();
                let event = String::from_utf8_lossy(&event);
                match self.state.process_event(&event) {
                    Ok(Some(chunk)) => return Some(Ok(chunk)),
                    Ok(None) => continue,
                    Err(e) => return Some(Err(e)),
                }
            }

            if self.exhausted {
                let tail = std::mem::take(&mut self.buffer);
                let tail = String::from_utf8_lossy(&tail);
                if !tail.trim().is_empty() {
                    match self.state.process_event(tail.trim()) {
                        Ok(Some(chunk)) => return Some(Ok(chunk)),
                        Ok(None) => {}
                        Err(e) => return Some(Err(e)),
                    }
                }
                return self.state.finalize().map(Ok);
            }

            match self.bytes.next().await {
                Some(Ok(bytes)) => {
                    self.buffer
                        .extend(bytes.as_ref().iter().copied().filter(|b| *b != b'\r'));
                }
                Some(Err(e)) => {
                    self.exhausted = true;
                    self.buffer.clear();
                    self.state.abandon();
                    return Some(Err(InferenceError::StreamError {
                        reason: format!("stream read error: {e}"),
                    }));
                }
                None => self.exhausted = true,
            }
        }
    }
}

// ─── Stream State ────────────────────────────────────────────────────────────

/// A tool call still being streamed.
#[derive(Debug)]
struct PendingCall {
    index: u32,
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates tool call fragments across SSE events.
#[derive(Debug, Default)]
struct StreamState {
    pending: Vec<PendingCall>,
    done: bool,
}

impl StreamState {
    /// Process a single SSE event string (may contain multiple `data:` lines).
    fn process_event(&mut self, event: &str) -> Result<Option<StreamChunk>, InferenceError> {
        if self.done {
            return Ok(None);
        }

        let mut data_content = String::new();

        for line in event.lines() {
            if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                let data = data.trim();
                if data == "[DONE]" {
                    let chunk = self.finalize();
                    self.done = true;
                    return Ok(chunk);
                }
                data_content.push_str(data);
            }
            // Comments, `event:` and `id:` lines carry nothing we use.
        }

        if data_content.is_empty() {
            return Ok(None);
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(&data_content).map_err(|e| InferenceError::StreamError {
                reason: format!("failed to parse SSE chunk: {e} (data: {data_content})"),
            })?;

        Ok(self.process_chunk(chunk))
    }

    fn process_chunk(&mut self, chunk: ChatCompletionChunk) -> Option<StreamChunk> {
        let choice = chunk.choices.into_iter().next()?;

        let mut result = StreamChunk {
            token: choice.delta.content.filter(|c| !c.is_empty()),
            tool_calls: None,
            finish_reason: choice.finish_reason,
        };

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let index = tc.index.unwrap_or(0);
            let (name, args) = match tc.function {
                Some(f) => (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()),
                None => (String::new(), String::new()),
            };

            match self.pending.iter_mut().find(|p| p.index == index) {
                Some(pending) => {
                    if !name.is_empty() {
                        pending.name = name;
                    }
                    pending.arguments.push_str(&args);
                    if tc.id.is_some() {
                        pending.id = tc.id;
                    }
                }
                None => self.pending.push(PendingCall {
                    index,
                    id: tc.id,
                    name,
                    arguments: args,
                }),
            }
        }

        if result.finish_reason.is_some() && !self.pending.is_empty() {
            result.tool_calls = Some(self.take_pending());
            result.finish_reason = Some("tool_calls".into());
        }

        if result.token.is_none() && result.tool_calls.is_none() && result.finish_reason.is_none() {
            return None;
        }
        Some(result)
    }

    /// Emit any tool calls still pending when the stream ends.
    fn finalize(&mut self) -> Option<StreamChunk> {
        if self.pending.is_empty() {
            return None;
        }
        Some(StreamChunk::calls(self.take_pending()))
    }

    fn abandon(&mut self) {
        self.pending.clear();
        self.done = true;
    }

    fn take_pending(&mut self) -> Vec<ToolCallRequest> {
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by_key(|p| p.index);
        pending
            .into_iter()
            .map(|p| ToolCallRequest {
                id: p
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{}", Uuid::new_v4())),
                name: p.name,
                raw_arguments: p.arguments,
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
