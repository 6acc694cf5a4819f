//! Wire format: one JSON document per line.
//!
//! Request:  {"id": 7, "command": "topic:list", "args": {...}}
//! Response: {"id": 7, "ok": true, "data": ...}
//!           {"id": 7, "ok": false, "error": {"kind": "NOT_FOUND", "message": "..."}}
//! Push:     {"event": "consumer:message", "sessionId": "...", "message": {...}}

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::error::KafdeskError;
use crate::models::ConsumerEvent;

/// Longest accepted request line.
pub const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("line exceeds {MAX_LINE_LENGTH} bytes")]
    LineTooLong,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<LinesCodecError> for ProtocolError {
    fn from(error: LinesCodecError) -> Self {
        match error {
            LinesCodecError::MaxLineLengthExceeded => ProtocolError::LineTooLong,
            LinesCodecError::Io(e) => ProtocolError::Io(e),
        }
    }
}

// ========================================
// FRAMES
// ========================================

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: u64,
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug)]
pub enum InboundFrame {
    Request(Request),
    /// A line that is not a valid request. `id` is recovered when possible.
    Malformed { id: u64, message: String },
}

#[derive(Debug)]
pub enum OutboundFrame {
    Response {
        id: u64,
        result: Result<Value, KafdeskError>,
    },
    Push(ConsumerEvent),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    kind: &'a str,
    message: String,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ResponseLine<'a> {
    Ok { id: u64, ok: bool, data: Value },
    Err { id: u64, ok: bool, error: ErrorBody<'a> },
}

// ========================================
// CODEC
// ========================================

#[derive(Debug)]
pub struct JsonLineCodec {
    lines: LinesCodec,
}

impl JsonLineCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }
}

impl Default for JsonLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonLineCodec {
    type Item = InboundFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(line) = self.lines.decode(src)? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(parse_line(&line)));
        }
    }
}

impl Encoder<OutboundFrame> for JsonLineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: OutboundFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = match item {
            OutboundFrame::Response { id, result: Ok(data) } => {
                serde_json::to_string(&ResponseLine::Ok { id, ok: true, data })?
            }
            OutboundFrame::Response { id, result: Err(e) } => serde_json::to_string(&ResponseLine::Err {
                id,
                ok: false,
                error: ErrorBody {
                    kind: e.kind(),
                    message: e.to_string(),
                },
            })?,
            OutboundFrame::Push(event) => serde_json::to_string(&event)?,
        };
        self.lines.encode(line, dst)?;
        Ok(())
    }
}

fn parse_line(line: &str) -> InboundFrame {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return InboundFrame::Malformed {
                id: 0,
                message: format!("Invalid JSON: {}", e),
            }
        }
    };

    let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);
    match serde_json::from_value::<Request>(value) {
        Ok(request) => InboundFrame::Request(request),
        Err(e) => InboundFrame::Malformed {
            id,
            message: format!("Invalid request: {}", e),
        },
    }
}
