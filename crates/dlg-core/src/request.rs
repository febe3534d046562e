use serde::{Deserialize, Serialize};

use crate::context::ConversationContext;
use crate::error::Error;
use crate::message::Message;
use crate::Result;

pub const DEFAULT_TEMPERATURE: f32 = 1.0;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const DEFAULT_MAX_TOKENS: u32 = 512;

/// Sampling parameters for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl SamplingParams {
    /// Parse textual parameters as supplied by an event command. Missing or
    /// blank values take the defaults; anything else must parse.
    pub fn parse(
        temperature: Option<&str>,
        top_p: Option<&str>,
        max_tokens: Option<&str>,
    ) -> Result<Self> {
        fn field<T: std::str::FromStr>(name: &str, raw: Option<&str>, default: T) -> Result<T> {
            match raw.map(str::trim).filter(|s| !s.is_empty()) {
                Some(s) => s
                    .parse()
                    .map_err(|_| Error::invalid_request(format!("{} is not a number: {:?}", name, s))),
                None => Ok(default),
            }
        }

        let params = Self {
            temperature: field("temperature", temperature, DEFAULT_TEMPERATURE)?,
            top_p: field("top_p", top_p, DEFAULT_TOP_P)?,
            max_tokens: field("max_tokens", max_tokens, DEFAULT_MAX_TOKENS)?,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::invalid_request(format!(
                "temperature must be within 0..=2, got {}",
                self.temperature
            )));
        }
        if !self.top_p.is_finite() || !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::invalid_request(format!(
                "top_p must be within 0..=1, got {}",
                self.top_p
            )));
        }
        if self.max_tokens == 0 {
            return Err(Error::invalid_request("max_tokens must be positive"));
        }
        Ok(())
    }
}

/// The chat-completion request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub stream: bool,
    pub messages: Vec<Message>,
}

/// Build the request body from the current context. Pure; performs no I/O.
pub fn build(
    context: &ConversationContext,
    model: &str,
    params: &SamplingParams,
    stream: bool,
) -> Result<ChatRequest> {
    params.validate()?;

    Ok(ChatRequest {
        model: model.to_string(),
        temperature: params.temperature,
        top_p: params.top_p,
        max_tokens: params.max_tokens,
        stream,
        messages: context.messages(),
    })
}
