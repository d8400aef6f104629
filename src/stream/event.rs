//! Stream events and the NDJSON wire schema
//!
//! `StreamEvent` is what the controller emits; `WireEvent` is its JSON shape.
//! Output bytes are decoded to text on the way out with a carry buffer, so a
//! UTF-8 sequence split across two reads arrives whole in the later event.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

/// Events emitted for one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Started {
        operation_id: String,
        command_line: String,
    },
    Output {
        bytes: Bytes,
    },
    Exited {
        exit_code: i32,
        duration: Duration,
    },
    Error {
        code: String,
        message: String,
        remediation_hint: Option<String>,
    },
}

impl StreamEvent {
    pub fn from_error(err: &ExecutionError) -> Self {
        StreamEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            remediation_hint: err.remediation_hint(),
        }
    }

    /// `Exited` and `Error` end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Exited { .. } | StreamEvent::Error { .. })
    }
}

/// Inbound control messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlMessage {
    Cancel,
}

impl ControlMessage {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// JSON shape of an event, one per line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireEvent {
    #[serde(rename_all = "camelCase")]
    Started {
        operation_id: String,
        command_line: String,
    },
    Output {
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Exited {
        exit_code: i32,
        duration: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        remediation_hint: Option<String>,
    },
}

impl WireEvent {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// `HH:MM:SS.mmm`
pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_millis();
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60,
        ms
    )
}

/// Incremental UTF-8 decoder that carries incomplete trailing sequences.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes`, holding back an incomplete sequence at the end.
    /// Invalid sequences become U+FFFD.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(bytes);

        let mut out = String::with_capacity(input.len());
        let mut rest = &input[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is held back, lossily.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Converts `StreamEvent`s to `WireEvent`s, keeping decoder state between
/// output chunks.
#[derive(Debug, Default)]
pub struct EventEncoder {
    decoder: Utf8Decoder,
}

impl EventEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero, one or two wire events: empty output is skipped, and a terminal
    /// event is preceded by any text still held by the decoder.
    pub fn encode(&mut self, event: StreamEvent) -> Vec<WireEvent> {
        let mut wire = Vec::with_capacity(1);
        if event.is_terminal() && self.decoder.has_pending() {
            wire.push(WireEvent::Output {
                data: self.decoder.finish(),
            });
        }
        match event {
            StreamEvent::Started {
                operation_id,
                command_line,
            } => wire.push(WireEvent::Started {
                operation_id,
                command_line,
            }),
            StreamEvent::Output { bytes } => {
                let data = self.decoder.decode(&bytes);
                if !data.is_empty() {
                    wire.push(WireEvent::Output { data });
                }
            }
            StreamEvent::Exited {
                exit_code,
                duration,
            } => wire.push(WireEvent::Exited {
                exit_code,
                duration: format_duration(duration),
            }),
            StreamEvent::Error {
                code,
                message,
                remediation_hint,
            } => wire.push(WireEvent::Error {
                code,
                message,
                remediation_hint,
            }),
        }
        wire
    }
}
