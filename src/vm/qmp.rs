//! Monitor protocol messages.
//!
//! The engine's control endpoint speaks JSON objects over a TCP socket.
//! Outbound commands are `{"execute": <name>}` with an optional `arguments`
//! object, terminated by CRLF. Inbound traffic is a greeting, command
//! replies (`return` / `error`) and asynchronous events. The engine is started
//! with `pretty=on`, so one inbound object may span several lines;
//! [`FrameDecoder`] reassembles them.

use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound for a single buffered inbound object.
const MAX_FRAME_BYTES: usize = 1_048_576;

// ---------------------------------------------------------------------------
// Outbound commands
// ---------------------------------------------------------------------------

/// Commands this crate issues on the monitor channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QmpCommand {
    /// Leave negotiation mode. Sent once during the handshake.
    Capabilities,
    /// Freeze guest CPUs.
    Stop,
    /// Resume guest CPUs.
    Cont,
    /// ACPI power button press.
    SystemPowerdown,
    /// Write the current display to a PPM file.
    Screendump { filename: PathBuf },
}

#[derive(Serialize)]
struct Execute<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

impl QmpCommand {
    pub fn name(&self) -> &'static str {
        match self {
            QmpCommand::Capabilities => "qmp_capabilities",
            QmpCommand::Stop => "stop",
            QmpCommand::Cont => "cont",
            QmpCommand::SystemPowerdown => "system_powerdown",
            QmpCommand::Screendump { .. } => "screendump",
        }
    }

    fn arguments(&self) -> Option<Value> {
        match self {
            QmpCommand::Screendump { filename } => Some(serde_json::json!({
                "filename": filename.display().to_string(),
            })),
            _ => None,
        }
    }

    /// The JSON object for this command.
    pub fn to_json(&self) -> String {
        let execute = Execute {
            execute: self.name(),
            arguments: self.arguments(),
        };
        serde_json::to_string(&execute).unwrap_or_default()
    }

    /// The exact bytes written to the socket.
    pub fn to_wire(&self) -> String {
        let mut line = self.to_json();
        line.push_str("\r\n");
        line
    }
}

// ---------------------------------------------------------------------------
// Inbound messages
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawTimestamp {
    seconds: i64,
    #[serde(default)]
    microseconds: i64,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    event: String,
    timestamp: Option<RawTimestamp>,
    data: Option<QmpEventData>,
}

/// Structured payload of an asynchronous event. Only the fields this crate
/// reports on are typed; everything else is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct QmpEventData {
    /// Whether the guest initiated the shutdown or reset.
    pub guest: Option<bool>,
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// An asynchronous event from the engine. Observational only.
#[derive(Debug, Clone, PartialEq)]
pub struct QmpEvent {
    pub name: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub data: Option<QmpEventData>,
}

/// One decoded inbound object.
#[derive(Debug, Clone, PartialEq)]
pub enum QmpMessage {
    Greeting(Value),
    Return(Value),
    Error { class: String, desc: String },
    Event(QmpEvent),
    Unknown(Value),
}

impl QmpMessage {
    pub fn from_value(value: Value) -> Self {
        if let Some(greeting) = value.get("QMP") {
            return QmpMessage::Greeting(greeting.clone());
        }
        if let Some(ret) = value.get("return") {
            return QmpMessage::Return(ret.clone());
        }
        if let Some(err) = value.get("error") {
            let field = |key: &str| {
                err.get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            return QmpMessage::Error {
                class: field("class"),
                desc: field("desc"),
            };
        }
        if value.get("event").is_some() {
            if let Ok(raw) = serde_json::from_value::<RawEvent>(value.clone()) {
                let timestamp = raw.timestamp.and_then(|ts| {
                    Utc.timestamp_opt(ts.seconds, ts.microseconds.clamp(0, 999_999) as u32 * 1000)
                        .single()
                });
                return QmpMessage::Event(QmpEvent {
                    name: raw.event,
                    timestamp,
                    data: raw.data,
                });
            }
        }
        QmpMessage::Unknown(value)
    }
}

// ---------------------------------------------------------------------------
// Frame decoder
// ---------------------------------------------------------------------------

/// Error from [`FrameDecoder::next_frame`].
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed monitor frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("monitor frame exceeds {MAX_FRAME_BYTES} bytes")]
    TooLarge,
}

/// Reassembles JSON objects from a byte stream, compact or pretty-printed.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete object, if one is buffered.
    ///
    /// A malformed object is dropped up to the next newline so later frames
    /// still decode.
    pub fn next_frame(&mut self) -> Option<Result<Value, FrameError>> {
        let start = match self.buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => start,
            None => {
                self.buf.clear();
                return None;
            }
        };
        self.buf.drain(..start);

        let (result, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            let result = stream.next();
            (result, stream.byte_offset())
        };

        match result {
            Some(Ok(value)) => {
                self.buf.drain(..consumed);
                Some(Ok(value))
            }
            Some(Err(e)) if e.is_eof() => {
                if self.buf.len() > MAX_FRAME_BYTES {
                    self.buf.clear();
                    return Some(Err(FrameError::TooLarge));
                }
                None
            }
            Some(Err(e)) => {
                let skip = self
                    .buf
                    .iter()
                    .position(|b| *b == b'\n')
                    .map(|i| i + 1)
                    .unwrap_or(self.buf.len());
                self.buf.drain(..skip);
                Some(Err(FrameError::Malformed(e)))
            }
            None => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
