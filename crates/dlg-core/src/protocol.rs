//! Chat-completion wire formats: streaming `data:` frames, the non-streaming
//! JSON envelope and the `{error: {...}}` body of failed requests.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::Error;
use crate::Result;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
const MAX_ERROR_CHARS: usize = 200;

/// What one framed line means to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A content fragment of the answer.
    Delta(String),
    /// The terminal sentinel; no more content follows.
    Done,
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Interpret one framed line.
///
/// Lines without the `data:` marker (comments, `event:` fields, blank
/// separators) yield `None`, as do data frames without content such as the
/// opening role frame. A data payload that is not valid JSON is an error.
pub fn parse_line(line: &str) -> Result<Option<SseEvent>> {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    let payload = payload.trim();

    if payload == DONE_SENTINEL {
        return Ok(Some(SseEvent::Done));
    }
    if payload.is_empty() {
        return Ok(None);
    }

    let frame: StreamFrame = serde_json::from_str(payload)?;
    if let Some(detail) = frame.error {
        return Err(Error::api(200, sanitize(&detail.preferred_text(200))));
    }

    Ok(frame
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map(SseEvent::Delta))
}

#[derive(Debug, Deserialize)]
struct CompletionEnvelope {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the answer from a non-streaming response body.
pub fn parse_completion(body: &[u8]) -> Result<String> {
    let envelope: CompletionEnvelope = serde_json::from_slice(body)?;
    envelope
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| Error::stream("No choices in response"))
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: Option<serde_json::Value>,
    message: Option<String>,
}

impl ErrorDetail {
    /// The code is preferred over the message: verbose messages can echo the
    /// credential back.
    fn preferred_text(&self, status: u16) -> String {
        match &self.code {
            Some(serde_json::Value::String(code)) if !code.is_empty() => code.clone(),
            Some(serde_json::Value::Number(code)) => code.to_string(),
            _ => self
                .message
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("HTTP {}", status)),
        }
    }
}

/// Decode the body of a non-2xx response into an error.
pub fn decode_error(status: u16, body: &str) -> Error {
    let text = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.preferred_text(status),
        Err(_) => format!("HTTP {}", status),
    };
    Error::from_status(status, sanitize(&text))
}

fn credential_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(sk-[A-Za-z0-9_\-*]{4,}|bearer\s+\S+)").expect("credential pattern is valid")
    })
}

/// Redact anything that looks like a credential and bound the length.
pub fn sanitize(text: &str) -> String {
    let redacted = credential_pattern().replace_all(text, "[redacted]");
    if redacted.chars().count() > MAX_ERROR_CHARS {
        let mut cut: String = redacted.chars().take(MAX_ERROR_CHARS).collect();
        cut.push('…');
        cut
    } else {
        redacted.into_owned()
    }
}
