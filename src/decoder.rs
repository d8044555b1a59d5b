//! server-sent-events decoding for chat-completion streams.
//!
//! the wire body is a sequence of `data: <json>` lines, terminated by `data: [DONE]`.
//! chunks arrive at arbitrary byte boundaries (mid-line, mid-utf8-sequence), so the decoder
//! keeps two carry buffers: undecoded bytes and an unterminated line.

use async_trait::async_trait;
use bevy::log::{debug, warn};
use serde::Deserialize;

use crate::error::RequestError;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// incremental byte source, e.g. an http response body.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait ChunkSource {
    /// next chunk of bytes, or `None` once the body is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RequestError>;

    /// release the underlying resource. must be safe to call more than once.
    async fn close(&mut self) {}
}

#[cfg(not(target_arch = "wasm32"))]
pub type BoxedSource = Box<dyn ChunkSource + Send>;
#[cfg(target_arch = "wasm32")]
pub type BoxedSource = Box<dyn ChunkSource>;

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// turns raw body chunks into content deltas.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending_bytes: Vec<u8>,
    line_buf: String,
    done: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// true once the `[DONE]` sentinel was seen; everything after it is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// feed one chunk, returning the deltas of every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.pending_bytes.extend_from_slice(chunk);
        self.decode_pending();

        let mut out = Vec::new();
        while let Some(nl) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=nl).collect();
            self.process_line(&line, &mut out);
            if self.done {
                self.line_buf.clear();
                self.pending_bytes.clear();
                break;
            }
        }
        out
    }

    /// source is exhausted: treat the unterminated tail as a final line.
    pub fn flush(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        if !self.pending_bytes.is_empty() {
            // a truncated multi-byte sequence can never complete now
            self.line_buf.push_str(&String::from_utf8_lossy(&self.pending_bytes));
            self.pending_bytes.clear();
        }
        let tail = std::mem::take(&mut self.line_buf);
        for line in tail.split('\n') {
            self.process_line(line, &mut out);
            if self.done {
                break;
            }
        }
        out
    }

    /// move every complete utf-8 sequence from `pending_bytes` into `line_buf`.
    fn decode_pending(&mut self) {
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending_bytes[start..]) {
                Ok(s) => {
                    self.line_buf.push_str(s);
                    start = self.pending_bytes.len();
                    break;
                }
                Err(e) => {
                    let valid = start + e.valid_up_to();
                    if let Ok(s) = std::str::from_utf8(&self.pending_bytes[start..valid]) {
                        self.line_buf.push_str(s);
                    }
                    match e.error_len() {
                        Some(bad) => {
                            self.line_buf.push(char::REPLACEMENT_CHARACTER);
                            start = valid + bad;
                        }
                        None => {
                            start = valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending_bytes.drain(..start);
    }

    fn process_line(&mut self, raw: &str, out: &mut Vec<String>) {
        let line = raw.trim();
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload).trim();
        if payload == DONE_SENTINEL {
            debug!(target: "bevy_dive_buddy", "stream sentinel reached");
            self.done = true;
            return;
        }
        match extract_delta(payload) {
            Ok(Some(delta)) => out.push(delta),
            Ok(None) => {}
            Err(err) => {
                warn!(target: "bevy_dive_buddy", "skipping malformed stream line ({err}): {payload}");
            }
        }
    }
}

/// `choices[0].delta.content`; absent or empty content is not an error.
fn extract_delta(payload: &str) -> Result<Option<String>, serde_json::Error> {
    let chunk: CompletionChunk = serde_json::from_str(payload)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .filter(|c| !c.is_empty()))
}
