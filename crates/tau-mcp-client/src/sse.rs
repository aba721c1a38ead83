//! Line-oriented decoding of `text/event-stream` bodies.
//!
//! Each `data:` line becomes one [`SseFrame`] tagged with the most recent
//! `event:` name of the current event block. Comment lines, `id:`/`retry:`
//! fields and blank separators never produce frames.

use std::pin::Pin;

use futures_util::{stream, Stream, StreamExt};

use crate::error::McpClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: Vec<u8>,
    current_event: Option<String>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a body chunk and returns every frame completed by it. Partial
    /// trailing lines stay buffered until the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=pos).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(|ch: char| ch == '\n' || ch == '\r');
            if let Some(frame) = self.apply_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flushes a final unterminated line at end of stream.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&line).into_owned();
        self.apply_line(line.trim_end_matches('\r'))
    }

    fn apply_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            self.current_event = None;
            return None;
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                let name = value.trim();
                self.current_event = (!name.is_empty()).then(|| name.to_string());
                None
            }
            "data" => {
                if value.trim().is_empty() {
                    return None;
                }
                Some(SseFrame {
                    event: self.current_event.clone(),
                    data: value.to_string(),
                })
            }
            _ => None,
        }
    }
}

pub type SseFrameStream = Pin<Box<dyn Stream<Item = Result<SseFrame, McpClientError>> + Send>>;

/// Turns a streaming HTTP response body into a lazy sequence of SSE frames.
pub fn sse_frames(response: reqwest::Response) -> SseFrameStream {
    let state = (
        response.bytes_stream().boxed(),
        SseLineDecoder::new(),
        std::collections::VecDeque::<SseFrame>::new(),
        false,
    );
    stream::unfold(state, |(mut body, mut decoder, mut ready, mut done)| async move {
        loop {
            if let Some(frame) = ready.pop_front() {
                return Some((Ok(frame), (body, decoder, ready, done)));
            }
            if done {
                return None;
            }
            match body.next().await {
                Some(Ok(chunk)) => ready.extend(decoder.push(chunk.as_ref())),
                Some(Err(error)) => {
                    done = true;
                    return Some((
                        Err(McpClientError::transport(format!(
                            "event stream read failed: {error}"
                        ))),
                        (body, decoder, ready, done),
                    ));
                }
                None => {
                    done = true;
                    ready.extend(decoder.finish());
                }
            }
        }
    })
    .boxed()
}
